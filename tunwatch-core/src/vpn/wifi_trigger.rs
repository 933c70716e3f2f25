//! Auto-connect on untrusted WiFi
//!
//! [`UntrustedWifiTrigger`] listens for WiFi changes and connects to the
//! recommended server when the device joins a network the user has not
//! marked as trusted. Repeated SSID events within [`DEBOUNCE_INTERVAL`]
//! (typical while roaming between access points) trigger at most once.

use crate::types::{ServerDescriptor, TrustList, WifiInfo};
use crate::vpn::machine::ConnectionStateMachine;
use crate::vpn::network_monitor::WifiInfoSignal;
use crate::vpn::state::ConnectionState;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Minimum time between two auto-connects
pub const DEBOUNCE_INTERVAL: Duration = Duration::from_secs(5);

/// User settings the trigger reads on every event
pub trait TrustSettings: Send + Sync {
    /// The `autoConnectUntrustedWifi` feature flag
    fn auto_connect_untrusted_wifi(&self) -> bool;

    fn trust_list(&self) -> TrustList;
}

/// Supplies the server to auto-connect to
pub trait ServerSelector: Send + Sync {
    fn recommended_server(&self) -> Option<ServerDescriptor>;
}

impl ServerSelector for ServerDescriptor {
    fn recommended_server(&self) -> Option<ServerDescriptor> {
        Some(self.clone())
    }
}

/// Outcome of evaluating one WiFi event, in check order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerDecision {
    NotOnWifi,
    FeatureDisabled,
    /// SSID could not be read; nothing to evaluate
    SsidUnavailable,
    Trusted,
    /// VPN is already connected or busy
    AlreadyActive,
    Debounced,
    NoRecommendedServer,
    Connect(ServerDescriptor),
}

/// Evaluate the trigger conditions, short-circuiting on the first failure
pub fn decide(
    info: &WifiInfo,
    settings: &dyn TrustSettings,
    state: &ConnectionState,
    last_trigger: Option<Instant>,
    now: Instant,
    servers: &dyn ServerSelector,
) -> TriggerDecision {
    if !info.connected_to_wifi {
        return TriggerDecision::NotOnWifi;
    }
    if !settings.auto_connect_untrusted_wifi() {
        return TriggerDecision::FeatureDisabled;
    }
    let Some(ssid) = info.ssid.as_deref() else {
        return TriggerDecision::SsidUnavailable;
    };
    if settings.trust_list().contains(ssid) {
        return TriggerDecision::Trusted;
    }
    if !state.accepts_connect() {
        return TriggerDecision::AlreadyActive;
    }
    if last_trigger.is_some_and(|at| now.saturating_duration_since(at) < DEBOUNCE_INTERVAL) {
        return TriggerDecision::Debounced;
    }
    match servers.recommended_server() {
        Some(server) => TriggerDecision::Connect(server),
        None => TriggerDecision::NoRecommendedServer,
    }
}

struct Evaluator {
    machine: ConnectionStateMachine,
    settings: Arc<dyn TrustSettings>,
    servers: Arc<dyn ServerSelector>,
    in_flight: AtomicBool,
    // Bumped by `stop`; an evaluation from an older epoch never connects
    epoch: AtomicU64,
    // Written only by the evaluation holding `in_flight`
    last_trigger: Mutex<Option<Instant>>,
}

impl Evaluator {
    async fn evaluate(&self, info: WifiInfo, epoch: u64) -> TriggerDecision {
        let now = Instant::now();
        let last_trigger = *self
            .last_trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let decision = decide(
            &info,
            self.settings.as_ref(),
            &self.machine.current_state(),
            last_trigger,
            now,
            self.servers.as_ref(),
        );

        if self.epoch.load(Ordering::Acquire) != epoch {
            debug!(ssid = ?info.ssid, "Trigger stopped during evaluation");
            return decision;
        }
        if let TriggerDecision::Connect(server) = &decision {
            info!(
                ssid = info.ssid.as_deref().unwrap_or_default(),
                server = %server.id,
                "Joined untrusted WiFi, connecting"
            );
            *self.last_trigger.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
            self.machine.connect(server.clone()).await;
        } else {
            debug!(ssid = ?info.ssid, decision = ?decision, "WiFi change evaluated");
        }
        decision
    }
}

/// Connects the VPN when the device joins an untrusted WiFi network
pub struct UntrustedWifiTrigger {
    evaluator: Arc<Evaluator>,
    wifi: Arc<dyn WifiInfoSignal>,
    task: Mutex<Option<JoinHandle<()>>>,
    evaluation: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl UntrustedWifiTrigger {
    pub fn new(
        machine: ConnectionStateMachine,
        wifi: Arc<dyn WifiInfoSignal>,
        settings: Arc<dyn TrustSettings>,
        servers: Arc<dyn ServerSelector>,
    ) -> Self {
        Self {
            evaluator: Arc::new(Evaluator {
                machine,
                settings,
                servers,
                in_flight: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                last_trigger: Mutex::new(None),
            }),
            wifi,
            task: Mutex::new(None),
            evaluation: Arc::new(Mutex::new(None)),
        }
    }

    /// Start listening for WiFi changes; a no-op when already monitoring
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Untrusted WiFi trigger already monitoring");
            return;
        }

        let mut events = self.wifi.subscribe();
        let evaluator = Arc::clone(&self.evaluator);
        let evaluation = Arc::clone(&self.evaluation);
        let epoch = evaluator.epoch.load(Ordering::Acquire);
        *task = Some(tokio::spawn(async move {
            while let Some(info) = events.recv().await {
                if evaluator
                    .in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    debug!(ssid = ?info.ssid, "Evaluation in flight, dropping WiFi event");
                    continue;
                }
                let evaluator = Arc::clone(&evaluator);
                let handle = tokio::spawn(async move {
                    evaluator.evaluate(info, epoch).await;
                    if evaluator.epoch.load(Ordering::Acquire) == epoch {
                        evaluator.in_flight.store(false, Ordering::Release);
                    }
                });
                *evaluation
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            debug!("WiFi signal ended");
        }));
        info!("Untrusted WiFi trigger monitoring");
    }

    /// Stop listening for WiFi changes
    ///
    /// An evaluation still running is cancelled and will not connect.
    pub fn stop(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = task.take() else {
            return;
        };
        handle.abort();
        self.evaluator.epoch.fetch_add(1, Ordering::AcqRel);
        let evaluation = self
            .evaluation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(evaluation) = evaluation {
            evaluation.abort();
        }
        self.evaluator.in_flight.store(false, Ordering::Release);
        info!("Untrusted WiFi trigger stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        task.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for UntrustedWifiTrigger {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Connectivity-triggered automatic reconnection
//!
//! [`AutoReconnectService`] watches the connectivity signal. When the network
//! comes back while the VPN is not connected, it asks the state machine to
//! connect to the remembered target and keeps retrying with linear backoff
//! until the tunnel is up or the attempt budget is spent.
//!
//! Mid-session drops are recovered by the state machine itself; this service
//! covers the case where the device was offline long enough for that
//! recovery to give up.
//!
//! An explicit disconnect ends any campaign and keeps the service idle until
//! a connection is started from elsewhere again.

use crate::error::{PolicyValidationError, ReconnectError};
use crate::types::ServerDescriptor;
use crate::vpn::machine::ConnectionStateMachine;
use crate::vpn::network_monitor::ConnectivitySignal;
use crate::vpn::state::ConnectionState;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for automatic reconnection behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoReconnectPolicy {
    /// Whether the service should be started alongside a connection
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Reconnect attempts per campaign before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Linear backoff step in seconds
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
}

fn default_enabled() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay() -> u64 {
    2
}

impl Default for AutoReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
        }
    }
}

impl AutoReconnectPolicy {
    /// Validate the policy
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if self.max_attempts < 1 || self.max_attempts > 20 {
            return Err(PolicyValidationError::InvalidMaxAttempts(self.max_attempts));
        }
        if self.base_delay_secs < 1 || self.base_delay_secs > 300 {
            return Err(PolicyValidationError::InvalidBaseDelay(self.base_delay_secs));
        }
        Ok(())
    }

    /// Wait before the retry that follows `retry_count` failures
    ///
    /// Linear: `base_delay * retry_count`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        Duration::from_secs(self.base_delay_secs * u64::from(retry_count))
    }
}

/// One bounded series of reconnect attempts toward a single target
#[derive(Debug, Clone)]
struct ReconnectCampaign {
    target: ServerDescriptor,
    retry_count: u32,
    last_attempt_at: Instant,
}

impl ReconnectCampaign {
    fn new(target: ServerDescriptor) -> Self {
        Self {
            target,
            retry_count: 0,
            last_attempt_at: Instant::now(),
        }
    }
}

/// Reconnects when connectivity returns and the VPN is not up
pub struct AutoReconnectService {
    machine: ConnectionStateMachine,
    connectivity: Arc<dyn ConnectivitySignal>,
    policy: AutoReconnectPolicy,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoReconnectService {
    pub fn new(
        machine: ConnectionStateMachine,
        connectivity: Arc<dyn ConnectivitySignal>,
        policy: AutoReconnectPolicy,
    ) -> Self {
        Self {
            machine,
            connectivity,
            policy,
            task: Mutex::new(None),
        }
    }

    /// Start watching connectivity on behalf of `target`
    ///
    /// Calling `start` while already running is a no-op.
    pub fn start(&self, target: ServerDescriptor) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Auto-reconnect already running");
            return;
        }

        info!(server = %target.id, "Auto-reconnect started");
        let supervisor = Supervisor {
            machine: self.machine.clone(),
            policy: self.policy.clone(),
            target,
        };
        let online = self.connectivity.subscribe();
        *task = Some(tokio::spawn(supervisor.run(online)));
    }

    /// Stop watching and discard any in-flight campaign
    ///
    /// Does not disconnect the tunnel.
    pub fn stop(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = task.take() {
            handle.abort();
            info!("Auto-reconnect stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        task.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for AutoReconnectService {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Supervisor {
    machine: ConnectionStateMachine,
    policy: AutoReconnectPolicy,
    target: ServerDescriptor,
}

impl Supervisor {
    async fn run(self, mut online: crate::signal::Subscription<bool>) {
        let mut transitions = self.machine.observe_transitions();
        let mut last_online: Option<bool> = None;
        let mut campaign: Option<ReconnectCampaign> = None;
        let mut retry_at: Option<Instant> = None;
        // Set by an explicit disconnect, cleared by the next outside connect
        let mut user_disconnected = false;

        loop {
            let retry_due = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                // Apply queued transitions before acting on connectivity
                biased;

                state = transitions.recv() => {
                    let Some(state) = state else {
                        debug!("Connection engine shut down, auto-reconnect exiting");
                        break;
                    };
                    match state {
                        ConnectionState::Connecting { .. } if campaign.is_none() => {
                            user_disconnected = false;
                        }
                        ConnectionState::Connected { .. } => {
                            user_disconnected = false;
                            if let Some(finished) = campaign.take() {
                                info!(
                                    retries = finished.retry_count,
                                    "Reconnect campaign succeeded"
                                );
                                retry_at = None;
                            }
                        }
                        ConnectionState::Disconnecting => {
                            user_disconnected = true;
                            retry_at = None;
                            if campaign.take().is_some() {
                                info!("{}", ReconnectError::Aborted);
                            }
                        }
                        ConnectionState::Error { .. } => {
                            let Some(active) = campaign.as_mut() else {
                                continue;
                            };
                            active.retry_count += 1;
                            if active.retry_count >= self.policy.max_attempts {
                                warn!(
                                    server = %active.target.id,
                                    "{}",
                                    ReconnectError::BudgetExhausted { attempts: active.retry_count }
                                );
                                campaign = None;
                                retry_at = None;
                            } else {
                                let delay = self.policy.backoff(active.retry_count);
                                info!(
                                    retry = active.retry_count,
                                    delay_secs = delay.as_secs(),
                                    "Reconnect attempt failed, retrying"
                                );
                                retry_at = Some(Instant::now() + delay);
                            }
                        }
                        _ => {}
                    }
                }

                signal = online.recv() => {
                    let Some(is_online) = signal else {
                        debug!("Connectivity signal ended");
                        break;
                    };
                    let restored = is_online && last_online == Some(false);
                    last_online = Some(is_online);

                    if !is_online {
                        if retry_at.take().is_some() {
                            debug!("Offline, pending reconnect postponed");
                        }
                        continue;
                    }
                    if !restored {
                        continue;
                    }

                    let state = self.machine.current_state();
                    if state.is_connected() {
                        debug!("Connectivity restored, tunnel already up");
                        continue;
                    }
                    if user_disconnected {
                        debug!("Connectivity restored after explicit disconnect, staying down");
                        continue;
                    }

                    info!(
                        state = state.label(),
                        "Connectivity restored while not connected, reconnecting"
                    );
                    let active = campaign
                        .get_or_insert_with(|| ReconnectCampaign::new(self.target.clone()));
                    retry_at = None;
                    self.attempt(active).await;
                }

                _ = retry_due => {
                    retry_at = None;
                    if let Some(active) = campaign.as_mut() {
                        self.attempt(active).await;
                    }
                }
            }
        }
    }

    async fn attempt(&self, campaign: &mut ReconnectCampaign) {
        debug!(
            retry = campaign.retry_count,
            since_last_ms = campaign.last_attempt_at.elapsed().as_millis() as u64,
            "Reconnect attempt"
        );
        campaign.last_attempt_at = Instant::now();
        self.machine.connect(campaign.target.clone()).await;
    }
}

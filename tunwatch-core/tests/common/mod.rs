//! Shared fakes for engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tunwatch_core::error::TunnelError;
use tunwatch_core::signal::Subscription;
use tunwatch_core::store::MemoryPreferenceStore;
use tunwatch_core::types::{Protocol, ServerDescriptor};
use tunwatch_core::vpn::{
    ConnectionState, ConnectionStateMachine, DropNotifier, HandshakeFailure, MachineConfig,
    ProtocolProber, ReachabilityTest, TunnelDriver,
};

/// Reachability test with a configurable set of reachable protocols
#[derive(Default)]
pub struct ScriptedReachability {
    reachable: Mutex<HashSet<Protocol>>,
    // Failures to report before a protocol starts succeeding
    failures_before_success: Mutex<HashMap<Protocol, u32>>,
    latency: Mutex<Duration>,
    calls: Mutex<Vec<(Protocol, Instant)>>,
}

impl ScriptedReachability {
    pub fn new(reachable: impl IntoIterator<Item = Protocol>) -> Arc<Self> {
        let fake = Self::default();
        *fake.reachable.lock().unwrap() = reachable.into_iter().collect();
        Arc::new(fake)
    }

    pub fn unreachable() -> Arc<Self> {
        Self::new([])
    }

    pub fn set_reachable(&self, reachable: impl IntoIterator<Item = Protocol>) {
        *self.reachable.lock().unwrap() = reachable.into_iter().collect();
    }

    pub fn fail_first(&self, protocol: Protocol, times: u32) {
        self.failures_before_success
            .lock()
            .unwrap()
            .insert(protocol, times);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn calls(&self) -> Vec<Protocol> {
        self.calls.lock().unwrap().iter().map(|(p, _)| *p).collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl ReachabilityTest for ScriptedReachability {
    async fn handshake(
        &self,
        _address: &str,
        _port: u16,
        protocol: Protocol,
        _timeout: Duration,
    ) -> Result<(), HandshakeFailure> {
        self.calls.lock().unwrap().push((protocol, Instant::now()));
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        {
            let mut pending = self.failures_before_success.lock().unwrap();
            if let Some(remaining) = pending.get_mut(&protocol) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(HandshakeFailure::Timeout);
                }
            }
        }

        if self.reachable.lock().unwrap().contains(&protocol) {
            Ok(())
        } else {
            Err(HandshakeFailure::Refused)
        }
    }
}

/// Tunnel driver that records calls and lets tests fire drops
#[derive(Default)]
pub struct FakeDriver {
    opens: Mutex<Vec<(String, Protocol)>>,
    closes: Mutex<u32>,
    notifiers: Mutex<Vec<DropNotifier>>,
    open_error: Mutex<Option<TunnelError>>,
    close_error: Mutex<Option<TunnelError>>,
    close_delay: Mutex<Duration>,
    // Reason reported from inside the next successful `open`
    drop_during_open: Mutex<Option<String>>,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_opens_with(&self, error: Option<TunnelError>) {
        *self.open_error.lock().unwrap() = error;
    }

    pub fn fail_closes_with(&self, error: TunnelError) {
        *self.close_error.lock().unwrap() = Some(error);
    }

    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock().unwrap() = delay;
    }

    /// Make the next successful `open` report a drop before returning
    pub fn drop_during_next_open(&self, reason: &str) {
        *self.drop_during_open.lock().unwrap() = Some(reason.to_string());
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn opened_protocols(&self) -> Vec<Protocol> {
        self.opens.lock().unwrap().iter().map(|(_, p)| *p).collect()
    }

    pub fn close_count(&self) -> u32 {
        *self.closes.lock().unwrap()
    }

    /// Report the most recently opened tunnel as dropped
    pub fn drop_tunnel(&self, reason: &str) -> bool {
        let notifiers = self.notifiers.lock().unwrap();
        notifiers.last().map(|n| n.notify(reason)).unwrap_or(false)
    }

    /// Report the `index`-th opened tunnel as dropped
    pub fn drop_session(&self, index: usize, reason: &str) -> bool {
        let notifiers = self.notifiers.lock().unwrap();
        notifiers.get(index).map(|n| n.notify(reason)).unwrap_or(false)
    }
}

#[async_trait]
impl TunnelDriver for FakeDriver {
    async fn open(
        &self,
        server: &ServerDescriptor,
        protocol: Protocol,
        drops: DropNotifier,
    ) -> Result<(), TunnelError> {
        self.opens
            .lock()
            .unwrap()
            .push((server.id.clone(), protocol));
        if let Some(error) = self.open_error.lock().unwrap().clone() {
            return Err(error);
        }
        if let Some(reason) = self.drop_during_open.lock().unwrap().take() {
            drops.notify(reason);
        }
        self.notifiers.lock().unwrap().push(drops);
        Ok(())
    }

    async fn close(&self) -> Result<(), TunnelError> {
        *self.closes.lock().unwrap() += 1;
        let delay = *self.close_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.close_error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

pub fn server() -> ServerDescriptor {
    ServerDescriptor::new("fr-1", "Paris", "fr1.example.net", 443)
}

pub fn prober(reachability: Arc<ScriptedReachability>) -> Arc<ProtocolProber> {
    Arc::new(ProtocolProber::new(
        Arc::new(MemoryPreferenceStore::new()),
        reachability,
    ))
}

/// Machine with a single-retry probe policy
pub fn machine(
    driver: Arc<FakeDriver>,
    reachability: Arc<ScriptedReachability>,
) -> ConnectionStateMachine {
    let mut config = MachineConfig::default();
    config.probe.max_retries_per_protocol = 1;
    ConnectionStateMachine::start(driver, prober(reachability), config)
}

/// Next transition, failing the test if none arrives within a minute
pub async fn next_state(sub: &mut Subscription<ConnectionState>) -> ConnectionState {
    tokio::time::timeout(Duration::from_secs(60), sub.recv())
        .await
        .expect("timed out waiting for a transition")
        .expect("transition stream ended")
}

/// Skip transitions until one matches
pub async fn wait_for(
    sub: &mut Subscription<ConnectionState>,
    matches: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    loop {
        let state = next_state(sub).await;
        if matches(&state) {
            return state;
        }
    }
}

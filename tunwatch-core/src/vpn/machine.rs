//! Connection state machine
//!
//! [`ConnectionStateMachine`] is the single source of truth for what the VPN
//! is doing. It is a handle to a background actor task that owns the
//! [`ConnectionState`]: callers send commands, the tunnel driver reports
//! drops, and every applied transition is published to subscribers in order.
//!
//! ```text
//! Disconnected --connect--> Connecting --probe+open ok--> Connected
//! Connecting --probe/open fail--> Error
//! Connected --tunnel dropped--> Reconnecting --ok--> Connected
//! Reconnecting --attempts exhausted--> Error
//! Connected|Connecting|Reconnecting --disconnect--> Disconnecting --> Disconnected
//! Error --connect--> Connecting
//! ```
//!
//! Probing and tunnel I/O run in a spawned task tagged with a generation
//! number. Every command that changes course bumps the generation and aborts
//! the task, so a late completion from an abandoned attempt is discarded.

use crate::error::{FailureCause, PolicyValidationError};
use crate::signal::{Broadcaster, Subscription};
use crate::types::{Protocol, ServerDescriptor};
use crate::vpn::driver::{DropNotifier, TunnelDriver, TunnelDrop};
use crate::vpn::prober::{ProbePolicy, ProtocolProber};
use crate::vpn::state::ConnectionState;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Recovery budget for a tunnel that drops mid-session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    /// Reconnect attempts before giving up with an error
    #[serde(default = "default_recovery_attempts")]
    pub max_attempts: u32,

    /// Linear backoff step between attempts, in seconds
    #[serde(default = "default_recovery_delay")]
    pub base_delay_secs: u64,
}

fn default_recovery_attempts() -> u32 {
    3
}
fn default_recovery_delay() -> u64 {
    2
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_recovery_attempts(),
            base_delay_secs: default_recovery_delay(),
        }
    }
}

impl RecoveryPolicy {
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if self.max_attempts < 1 || self.max_attempts > 20 {
            return Err(PolicyValidationError::InvalidMaxAttempts(self.max_attempts));
        }
        if self.base_delay_secs < 1 || self.base_delay_secs > 300 {
            return Err(PolicyValidationError::InvalidBaseDelay(self.base_delay_secs));
        }
        Ok(())
    }

    /// Wait before recovery attempt `attempt` (1-based)
    ///
    /// The first attempt runs immediately; attempt n waits `base * (n - 1)`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.base_delay_secs * u64::from(attempt.saturating_sub(1)))
    }
}

/// Settings the state machine needs at runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    pub probe: ProbePolicy,
    pub recovery: RecoveryPolicy,
    /// Upper bound for `TunnelDriver::close`
    pub close_timeout: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            probe: ProbePolicy::default(),
            recovery: RecoveryPolicy::default(),
            close_timeout: Duration::from_secs(5),
        }
    }
}

enum Command {
    Connect {
        target: ServerDescriptor,
        ack: oneshot::Sender<()>,
    },
    Disconnect {
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

enum WorkEvent {
    AttemptFinished {
        generation: u64,
        result: Result<Protocol, FailureCause>,
    },
    Closed {
        generation: u64,
    },
}

/// Handle to the connection state machine
///
/// Cheap to clone; all clones talk to the same actor. The actor stops when
/// [`shutdown`](Self::shutdown) is called or every handle is dropped.
#[derive(Clone)]
pub struct ConnectionStateMachine {
    commands: mpsc::UnboundedSender<Command>,
    states: Broadcaster<ConnectionState>,
}

impl ConnectionStateMachine {
    /// Spawn the actor on the current tokio runtime
    pub fn start(
        driver: Arc<dyn TunnelDriver>,
        prober: Arc<ProtocolProber>,
        config: MachineConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let states = Broadcaster::with_initial(ConnectionState::Disconnected);
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (drops_tx, drops_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            state: ConnectionState::Disconnected,
            states: states.clone(),
            driver,
            prober,
            config,
            generation: 0,
            session: None,
            pending_drop: None,
            in_flight: None,
            work_tx,
            drops_tx,
        };
        tokio::spawn(actor.run(command_rx, work_rx, drops_rx));

        Self { commands, states }
    }

    /// Connect to `target`
    ///
    /// Accepted only from `Disconnected` or `Error`; otherwise a no-op.
    /// Returns once `Connecting` has been recorded; the outcome arrives on
    /// the transition stream.
    pub async fn connect(&self, target: ServerDescriptor) {
        self.send(|ack| Command::Connect { target, ack }).await;
    }

    /// Disconnect from the current server
    ///
    /// Accepted from `Connected`, `Connecting` and `Reconnecting`. Returns
    /// once `Disconnecting` has been recorded; `Disconnected` always follows,
    /// even if the driver fails to close.
    pub async fn disconnect(&self) {
        self.send(|ack| Command::Disconnect { ack }).await;
    }

    /// Stop the actor, closing any open tunnel and ending all transition streams
    pub async fn shutdown(&self) {
        self.send(|ack| Command::Shutdown { ack }).await;
    }

    /// Snapshot of the current state
    pub fn current_state(&self) -> ConnectionState {
        self.states.latest().unwrap_or_default()
    }

    /// Stream of transitions, starting with the current state
    pub fn observe_transitions(&self) -> Subscription<ConnectionState> {
        self.states.subscribe()
    }

    /// Whether the actor is still accepting commands
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn send(&self, build: impl FnOnce(oneshot::Sender<()>) -> Command) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(build(ack)).is_err() {
            warn!("Connection engine has shut down, command ignored");
            return;
        }
        let _ = done.await;
    }
}

struct Actor {
    state: ConnectionState,
    states: Broadcaster<ConnectionState>,
    driver: Arc<dyn TunnelDriver>,
    prober: Arc<ProtocolProber>,
    config: MachineConfig,
    generation: u64,
    // Generation of the attempt whose tunnel is currently open
    session: Option<u64>,
    // Drop reported by the current attempt before its result was handled
    pending_drop: Option<TunnelDrop>,
    in_flight: Option<JoinHandle<()>>,
    work_tx: mpsc::UnboundedSender<WorkEvent>,
    drops_tx: mpsc::UnboundedSender<TunnelDrop>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut work: mpsc::UnboundedReceiver<WorkEvent>,
        mut drops: mpsc::UnboundedReceiver<TunnelDrop>,
    ) {
        debug!("Connection state machine started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect { target, ack }) => {
                        self.handle_connect(target);
                        let _ = ack.send(());
                    }
                    Some(Command::Disconnect { ack }) => {
                        self.handle_disconnect();
                        let _ = ack.send(());
                    }
                    Some(Command::Shutdown { ack }) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = work.recv() => match event {
                    WorkEvent::AttemptFinished { generation, result } => {
                        self.handle_attempt_finished(generation, result);
                    }
                    WorkEvent::Closed { generation } => self.handle_closed(generation),
                },
                Some(report) = drops.recv() => self.handle_drop(report),
            }
        }
        debug!("Connection state machine stopped");
    }

    fn transition(&mut self, next: ConnectionState) {
        if next == self.state {
            return;
        }
        info!(from = self.state.label(), to = next.label(), "{}", next);
        self.state = next.clone();
        self.states.publish(next);
    }

    fn cancel_in_flight(&mut self) {
        self.generation += 1;
        self.pending_drop = None;
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
    }

    fn spawn_attempt(&mut self, target: ServerDescriptor, delay: Duration) {
        self.cancel_in_flight();
        let generation = self.generation;
        let prober = Arc::clone(&self.prober);
        let driver = Arc::clone(&self.driver);
        let policy = self.config.probe.clone();
        let work_tx = self.work_tx.clone();
        let drops = DropNotifier::new(generation, self.drops_tx.clone());

        self.in_flight = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = run_attempt(&prober, driver.as_ref(), &target, &policy, drops).await;
            let _ = work_tx.send(WorkEvent::AttemptFinished { generation, result });
        }));
    }

    fn handle_connect(&mut self, target: ServerDescriptor) {
        if !self.state.accepts_connect() {
            debug!(state = self.state.label(), server = %target.id, "Connect ignored");
            return;
        }
        self.session = None;
        self.spawn_attempt(target.clone(), Duration::ZERO);
        self.transition(ConnectionState::Connecting { target });
    }

    fn handle_disconnect(&mut self) {
        if !self.state.accepts_disconnect() {
            debug!(state = self.state.label(), "Disconnect ignored");
            return;
        }
        self.cancel_in_flight();
        self.session = None;
        self.transition(ConnectionState::Disconnecting);

        let generation = self.generation;
        let driver = Arc::clone(&self.driver);
        let close_timeout = self.config.close_timeout;
        let work_tx = self.work_tx.clone();
        tokio::spawn(async move {
            close_tunnel(driver.as_ref(), close_timeout).await;
            let _ = work_tx.send(WorkEvent::Closed { generation });
        });
    }

    fn handle_closed(&mut self, generation: u64) {
        if generation == self.generation && self.state == ConnectionState::Disconnecting {
            self.transition(ConnectionState::Disconnected);
        }
    }

    fn handle_attempt_finished(&mut self, generation: u64, result: Result<Protocol, FailureCause>) {
        if generation != self.generation {
            debug!(generation, current = self.generation, "Discarding stale attempt result");
            return;
        }
        self.in_flight = None;
        let early_drop = self.pending_drop.take();

        match (self.state.clone(), result) {
            (ConnectionState::Connecting { target }, Ok(protocol))
            | (ConnectionState::Reconnecting { target, .. }, Ok(protocol)) => {
                self.session = Some(generation);
                self.transition(ConnectionState::Connected {
                    target,
                    protocol,
                    since: Utc::now(),
                });
                if let Some(report) = early_drop {
                    self.handle_drop(report);
                }
            }
            (ConnectionState::Connecting { target }, Err(cause)) => {
                warn!(server = %target.id, "Connection attempt failed: {}", cause);
                self.transition(ConnectionState::Error {
                    message: cause.to_string(),
                    last_target: Some(target),
                });
            }
            (ConnectionState::Reconnecting { target, attempt }, Err(cause)) => {
                warn!(server = %target.id, attempt, "Recovery attempt failed: {}", cause);
                let max_attempts = self.config.recovery.max_attempts;
                if attempt >= max_attempts {
                    error!(attempts = attempt, "Tunnel recovery exhausted");
                    self.transition(ConnectionState::Error {
                        message: FailureCause::RecoveryExhausted { attempts: attempt }.to_string(),
                        last_target: Some(target),
                    });
                } else {
                    let next = attempt + 1;
                    let delay = self.config.recovery.delay_before(next);
                    debug!(
                        attempt = next,
                        delay_secs = delay.as_secs(),
                        "Scheduling recovery attempt"
                    );
                    self.spawn_attempt(target.clone(), delay);
                    self.transition(ConnectionState::Reconnecting {
                        target,
                        attempt: next,
                    });
                }
            }
            (state, _) => {
                debug!(state = state.label(), "Attempt result arrived in unexpected state");
            }
        }
    }

    fn handle_drop(&mut self, report: TunnelDrop) {
        let opening = matches!(
            self.state,
            ConnectionState::Connecting { .. } | ConnectionState::Reconnecting { .. }
        );
        if opening && report.session == self.generation {
            debug!(session = report.session, "Tunnel dropped before open completed");
            self.pending_drop = Some(report);
            return;
        }
        if !self.state.is_connected() || self.session != Some(report.session) {
            debug!(session = report.session, "Ignoring drop from inactive session");
            return;
        }
        let Some(target) = self.state.target().cloned() else {
            return;
        };
        warn!(server = %target.id, reason = %report.reason, "Tunnel dropped");
        self.session = None;
        self.spawn_attempt(target.clone(), self.config.recovery.delay_before(1));
        self.transition(ConnectionState::Reconnecting { target, attempt: 1 });
    }

    async fn shutdown(&mut self) {
        let tunnel_active = self.state.accepts_disconnect();
        self.cancel_in_flight();
        self.session = None;
        if tunnel_active {
            self.transition(ConnectionState::Disconnecting);
            close_tunnel(self.driver.as_ref(), self.config.close_timeout).await;
        }
        if self.state == ConnectionState::Disconnecting {
            self.transition(ConnectionState::Disconnected);
        }
        self.states.close();
    }
}

async fn run_attempt(
    prober: &ProtocolProber,
    driver: &dyn TunnelDriver,
    target: &ServerDescriptor,
    policy: &ProbePolicy,
    drops: DropNotifier,
) -> Result<Protocol, FailureCause> {
    let chain = target.protocol_chain();
    let probe = prober
        .probe(&target.address, target.port, &chain, policy)
        .await;
    for attempt in probe.log() {
        debug!(
            protocol = %attempt.protocol,
            attempt = attempt.attempt_number,
            succeeded = attempt.succeeded,
            "Probe log"
        );
    }

    match probe.protocol() {
        Some(protocol) => {
            driver.open(target, protocol, drops).await?;
            Ok(protocol)
        }
        None => Err(FailureCause::ProbeExhausted {
            tried: probe.tried_protocols(),
        }),
    }
}

async fn close_tunnel(driver: &dyn TunnelDriver, close_timeout: Duration) {
    match tokio::time::timeout(close_timeout, driver.close()).await {
        Ok(Ok(())) => debug!("Tunnel closed"),
        Ok(Err(e)) => warn!("Tunnel close failed, continuing: {}", e),
        Err(_) => warn!(
            timeout_secs = close_timeout.as_secs(),
            "Tunnel close timed out, continuing"
        ),
    }
}

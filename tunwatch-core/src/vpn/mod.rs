//! VPN connection module
//!
//! Connection state machine, protocol probing, and the services that
//! reconnect or auto-connect on network changes.

pub mod command_driver;
pub mod driver;
pub mod machine;
pub mod prober;
pub mod state;

// Network change detection and automatic reconnection
pub mod auto_reconnect;
pub mod network_monitor;
pub mod wifi_trigger;

// Public re-exports
pub use auto_reconnect::{AutoReconnectPolicy, AutoReconnectService};
pub use command_driver::{CommandTunnelDriver, DriverSettings};
pub use driver::{DropNotifier, TunnelDriver, TunnelDrop};
pub use machine::{ConnectionStateMachine, MachineConfig, RecoveryPolicy};
pub use network_monitor::{ConnectivitySignal, NetworkMonitor, PolledSignal, WifiInfoSignal};
pub use prober::{
    HandshakeFailure, ProbeAttempt, ProbePolicy, ProbeResult, ProtocolProber, ReachabilityTest,
    TcpReachability,
};
pub use state::ConnectionState;
pub use wifi_trigger::{
    ServerSelector, TriggerDecision, TrustSettings, UntrustedWifiTrigger, DEBOUNCE_INTERVAL,
};

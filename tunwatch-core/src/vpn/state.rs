//! VPN connection state
//!
//! Defines the states of the connection lifecycle. Only the
//! [`ConnectionStateMachine`](crate::vpn::machine::ConnectionStateMachine)
//! ever produces these values; everything else observes them.

use crate::types::{Protocol, ServerDescriptor};
use chrono::{DateTime, Utc};

/// VPN connection states
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected; clean rest state
    #[default]
    Disconnected,

    /// Probing protocols and opening the tunnel
    Connecting { target: ServerDescriptor },

    /// Tunnel is up
    Connected {
        target: ServerDescriptor,
        protocol: Protocol,
        /// When the tunnel reported success
        since: DateTime<Utc>,
    },

    /// Tearing the tunnel down
    Disconnecting,

    /// Recovering from a mid-session tunnel drop
    Reconnecting { target: ServerDescriptor, attempt: u32 },

    /// Last attempt failed; rests here until an explicit retry
    Error {
        message: String,
        last_target: Option<ServerDescriptor>,
    },
}

impl ConnectionState {
    /// Server the state refers to, if any
    pub fn target(&self) -> Option<&ServerDescriptor> {
        match self {
            ConnectionState::Connecting { target }
            | ConnectionState::Connected { target, .. }
            | ConnectionState::Reconnecting { target, .. } => Some(target),
            ConnectionState::Error { last_target, .. } => last_target.as_ref(),
            ConnectionState::Disconnected | ConnectionState::Disconnecting => None,
        }
    }

    /// Check if currently connected
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    /// Check if in error state
    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::Error { .. })
    }

    /// States from which a `connect` command is accepted
    pub fn accepts_connect(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error { .. })
    }

    /// States from which a `disconnect` command is accepted
    pub fn accepts_disconnect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected { .. }
                | ConnectionState::Connecting { .. }
                | ConnectionState::Reconnecting { .. }
        )
    }

    /// Short lowercase label, used in logs and CLI output
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting { .. } => "connecting",
            ConnectionState::Connected { .. } => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Error { .. } => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting { target } => write!(f, "connecting to {}", target.name),
            ConnectionState::Connected { target, protocol, .. } => {
                write!(f, "connected to {} via {}", target.name, protocol)
            }
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Reconnecting { target, attempt } => {
                write!(f, "reconnecting to {} (attempt {})", target.name, attempt)
            }
            ConnectionState::Error { message, .. } => write!(f, "error: {}", message),
        }
    }
}

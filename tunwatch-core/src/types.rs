//! Shared value types for the connection engine
//!
//! Server descriptors, the closed set of transport protocols, and the WiFi
//! information consumed by the untrusted-network trigger.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Transport protocol used to carry the tunnel
///
/// Declaration order is the default fallback priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Preferred transport, tried first unless the device has learned otherwise
    Primary,
    /// First fallback transport
    SecondaryA,
    /// Second fallback transport
    SecondaryB,
    /// Last-resort transport
    SecondaryC,
}

impl Protocol {
    /// All protocols in default priority order
    pub const ALL: [Protocol; 4] = [
        Protocol::Primary,
        Protocol::SecondaryA,
        Protocol::SecondaryB,
        Protocol::SecondaryC,
    ];

    /// Stable identifier used in configuration and in the preference store
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Primary => "primary",
            Protocol::SecondaryA => "secondary_a",
            Protocol::SecondaryB => "secondary_b",
            Protocol::SecondaryC => "secondary_c",
        }
    }

    /// Position in the default fallback order (0 = highest priority)
    pub fn priority(&self) -> usize {
        match self {
            Protocol::Primary => 0,
            Protocol::SecondaryA => 1,
            Protocol::SecondaryB => 2,
            Protocol::SecondaryC => 3,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown protocol name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol: {0}")]
pub struct UnknownProtocol(pub String);

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Protocol::Primary),
            "secondary_a" => Ok(Protocol::SecondaryA),
            "secondary_b" => Ok(Protocol::SecondaryB),
            "secondary_c" => Ok(Protocol::SecondaryC),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

/// Immutable description of a VPN server
///
/// Owned by the caller; the engine only ever clones it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique server identifier
    pub id: String,

    /// Human readable name
    pub name: String,

    /// Hostname or IP address
    pub address: String,

    /// Port used for both probing and the tunnel
    pub port: u16,

    /// Supported protocols, in the server's preferred order
    #[serde(rename = "protocols", default = "default_protocols")]
    pub supported_protocols: Vec<Protocol>,
}

fn default_protocols() -> Vec<Protocol> {
    Protocol::ALL.to_vec()
}

impl ServerDescriptor {
    /// Create a server descriptor supporting every protocol
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            port,
            supported_protocols: default_protocols(),
        }
    }

    /// Restrict the descriptor to the given protocols
    pub fn with_protocols(mut self, protocols: impl IntoIterator<Item = Protocol>) -> Self {
        self.supported_protocols = protocols.into_iter().collect();
        self
    }

    /// Protocol chain to probe for this server
    ///
    /// Duplicates are dropped (first occurrence wins); an empty list falls
    /// back to every protocol in default order.
    pub fn protocol_chain(&self) -> Vec<Protocol> {
        let mut chain = Vec::with_capacity(self.supported_protocols.len());
        for protocol in &self.supported_protocols {
            if !chain.contains(protocol) {
                chain.push(*protocol);
            }
        }
        if chain.is_empty() {
            chain = default_protocols();
        }
        chain
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.address, self.port)
    }
}

/// WiFi status reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WifiInfo {
    /// Whether the active uplink is a WiFi network
    pub connected_to_wifi: bool,

    /// Network name; `None` when the platform refuses to reveal it
    pub ssid: Option<String>,
}

impl WifiInfo {
    /// Device is on the named WiFi network
    pub fn on_network(ssid: impl Into<String>) -> Self {
        Self {
            connected_to_wifi: true,
            ssid: Some(ssid.into()),
        }
    }

    /// Device is on WiFi but the SSID could not be read
    pub fn ssid_hidden() -> Self {
        Self {
            connected_to_wifi: true,
            ssid: None,
        }
    }

    /// Device is not on WiFi (cellular, wired or offline)
    pub fn off_wifi() -> Self {
        Self::default()
    }
}

/// Set of SSIDs the user has marked as trusted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustList(HashSet<String>);

impl TrustList {
    pub fn new<I, S>(ssids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(ssids.into_iter().map(Into::into).collect())
    }

    /// Whether `ssid` is trusted (exact match)
    pub fn contains(&self, ssid: &str) -> bool {
        self.0.contains(ssid)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_roundtrip_through_str() {
        for protocol in Protocol::ALL {
            assert_eq!(protocol.as_str().parse::<Protocol>(), Ok(protocol));
        }
        assert!("wireguard".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_protocol_default_order_matches_priority() {
        let mut sorted = Protocol::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, Protocol::ALL.to_vec());
        assert_eq!(Protocol::SecondaryC.priority(), 3);
    }

    #[test]
    fn test_protocol_chain_dedups_and_defaults() {
        let server = ServerDescriptor::new("de-1", "Frankfurt", "de1.example.net", 443)
            .with_protocols([Protocol::SecondaryB, Protocol::Primary, Protocol::SecondaryB]);
        assert_eq!(server.protocol_chain(), vec![Protocol::SecondaryB, Protocol::Primary]);

        let empty = server.with_protocols([]);
        assert_eq!(empty.protocol_chain(), Protocol::ALL.to_vec());
    }

    #[test]
    fn test_trust_list_exact_match() {
        let trust = TrustList::new(["Home", "Office"]);
        assert!(trust.contains("Home"));
        assert!(!trust.contains("home"));
        assert_eq!(trust.len(), 2);
    }
}

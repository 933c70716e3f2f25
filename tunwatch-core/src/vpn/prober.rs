//! Ordered protocol fallback probing
//!
//! Before paying for a full tunnel setup, the engine checks which protocol
//! can currently reach the server with a cheap transport-level handshake.
//! Protocols that are filtered at the current location fail fast here
//! instead of timing out inside the tunnel driver.
//!
//! The protocol that last succeeded is persisted and tried first next time.

use crate::error::{PolicyValidationError, StoreError};
use crate::store::PreferenceStore;
use crate::types::Protocol;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Preference store key holding the learned protocol
pub const PREFERRED_PROTOCOL_KEY: &str = "preferred_protocol";

/// Probe budget and overrides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbePolicy {
    /// Reachability tests per protocol before moving to the next one
    #[serde(default = "default_max_retries")]
    pub max_retries_per_protocol: u32,

    /// Upper bound for a single handshake, in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Test only this protocol, with no fallback
    #[serde(default)]
    pub manual_override: Option<Protocol>,
}

fn default_max_retries() -> u32 {
    2
}
fn default_handshake_timeout_ms() -> u64 {
    3000
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            max_retries_per_protocol: default_max_retries(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            manual_override: None,
        }
    }
}

impl ProbePolicy {
    /// Validate the policy
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if self.max_retries_per_protocol < 1 || self.max_retries_per_protocol > 10 {
            return Err(PolicyValidationError::InvalidProbeRetries(
                self.max_retries_per_protocol,
            ));
        }
        if self.handshake_timeout_ms < 100 || self.handshake_timeout_ms > 60_000 {
            return Err(PolicyValidationError::InvalidHandshakeTimeout(
                self.handshake_timeout_ms,
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Why a single reachability test failed
///
/// Recorded for diagnostics only; every kind is treated the same.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandshakeFailure {
    Timeout,
    Refused,
    Unreachable { message: String },
}

impl std::fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeFailure::Timeout => write!(f, "timeout"),
            HandshakeFailure::Refused => write!(f, "refused"),
            HandshakeFailure::Unreachable { message } => write!(f, "unreachable: {}", message),
        }
    }
}

/// Cheap transport-level check that a protocol can reach a server
#[async_trait]
pub trait ReachabilityTest: Send + Sync {
    async fn handshake(
        &self,
        address: &str,
        port: u16,
        protocol: Protocol,
        timeout: Duration,
    ) -> Result<(), HandshakeFailure>;
}

/// TCP connect as the reachability test
///
/// Every protocol listens on the server's port, so a completed TCP
/// handshake means the path is not filtered for that endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpReachability;

#[async_trait]
impl ReachabilityTest for TcpReachability {
    async fn handshake(
        &self,
        address: &str,
        port: u16,
        _protocol: Protocol,
        timeout: Duration,
    ) -> Result<(), HandshakeFailure> {
        match tokio::time::timeout(timeout, TcpStream::connect((address, port))).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Err(HandshakeFailure::Refused)
            }
            Ok(Err(e)) => Err(HandshakeFailure::Unreachable {
                message: e.to_string(),
            }),
            Err(_) => Err(HandshakeFailure::Timeout),
        }
    }
}

/// One reachability test, as recorded in the probe log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeAttempt {
    pub protocol: Protocol,
    /// 1-based attempt number within this protocol
    pub attempt_number: u32,
    pub succeeded: bool,
    pub failure: Option<HandshakeFailure>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of probing a protocol chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeResult {
    Succeeded {
        protocol: Protocol,
        log: Vec<ProbeAttempt>,
    },
    Exhausted {
        log: Vec<ProbeAttempt>,
    },
}

impl ProbeResult {
    /// Every attempt made, in order
    pub fn log(&self) -> &[ProbeAttempt] {
        match self {
            ProbeResult::Succeeded { log, .. } | ProbeResult::Exhausted { log } => log,
        }
    }

    /// The winning protocol, if any
    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            ProbeResult::Succeeded { protocol, .. } => Some(*protocol),
            ProbeResult::Exhausted { .. } => None,
        }
    }

    /// Distinct protocols tested, in test order
    pub fn tried_protocols(&self) -> Vec<Protocol> {
        let mut tried = Vec::new();
        for attempt in self.log() {
            if !tried.contains(&attempt.protocol) {
                tried.push(attempt.protocol);
            }
        }
        tried
    }
}

/// Move `preferred` to the front of `chain`, keeping the rest in order
///
/// A preference the chain does not contain is ignored.
pub fn effective_chain(chain: &[Protocol], preferred: Option<Protocol>) -> Vec<Protocol> {
    match preferred {
        Some(preferred) if chain.contains(&preferred) => std::iter::once(preferred)
            .chain(chain.iter().copied().filter(|p| *p != preferred))
            .collect(),
        _ => chain.to_vec(),
    }
}

/// Picks the protocol to use for a server
pub struct ProtocolProber {
    store: Arc<dyn PreferenceStore>,
    reachability: Arc<dyn ReachabilityTest>,
}

impl ProtocolProber {
    pub fn new(store: Arc<dyn PreferenceStore>, reachability: Arc<dyn ReachabilityTest>) -> Self {
        Self {
            store,
            reachability,
        }
    }

    /// Prober using plain TCP handshakes
    pub fn with_tcp(store: Arc<dyn PreferenceStore>) -> Self {
        Self::new(store, Arc::new(TcpReachability))
    }

    /// Protocol learned from the last successful probe, or set by the user
    ///
    /// Unreadable or unrecognised stored values count as no preference.
    pub fn preferred_protocol(&self) -> Option<Protocol> {
        match self.store.read(PREFERRED_PROTOCOL_KEY) {
            Ok(Some(value)) => match value.parse() {
                Ok(protocol) => Some(protocol),
                Err(e) => {
                    warn!(value = %value, "Ignoring stored protocol preference: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read protocol preference: {}", e);
                None
            }
        }
    }

    /// Set or clear the preferred protocol
    ///
    /// Clearing restores the default fallback order.
    pub fn set_preferred_protocol(&self, protocol: Option<Protocol>) -> Result<(), StoreError> {
        match protocol {
            Some(protocol) => {
                self.store.write(PREFERRED_PROTOCOL_KEY, protocol.as_str())?;
                info!(protocol = %protocol, "Preferred protocol set");
            }
            None => {
                self.store.delete(PREFERRED_PROTOCOL_KEY)?;
                info!("Preferred protocol cleared, using default fallback order");
            }
        }
        Ok(())
    }

    /// Test protocols in order until one reaches `address:port`
    ///
    /// Blocks until a protocol succeeds or the whole chain is exhausted.
    #[tracing::instrument(
        skip(self, chain, policy),
        fields(max_retries = policy.max_retries_per_protocol)
    )]
    pub async fn probe(
        &self,
        address: &str,
        port: u16,
        chain: &[Protocol],
        policy: &ProbePolicy,
    ) -> ProbeResult {
        let order = match policy.manual_override {
            Some(protocol) => {
                debug!(protocol = %protocol, "Manual override, probing a single protocol");
                vec![protocol]
            }
            None => effective_chain(chain, self.preferred_protocol()),
        };
        let retries = policy.max_retries_per_protocol.max(1);
        let timeout = policy.handshake_timeout();
        let mut log = Vec::new();

        for protocol in order {
            for attempt_number in 1..=retries {
                let outcome = self
                    .reachability
                    .handshake(address, port, protocol, timeout)
                    .await;
                let succeeded = outcome.is_ok();
                log.push(ProbeAttempt {
                    protocol,
                    attempt_number,
                    succeeded,
                    failure: outcome.err(),
                    timestamp: Utc::now(),
                });

                if succeeded {
                    info!(protocol = %protocol, attempt = attempt_number, "Protocol reachable");
                    if policy.manual_override.is_none() {
                        if let Err(e) = self.set_preferred_protocol(Some(protocol)) {
                            warn!("Failed to persist protocol preference: {}", e);
                        }
                    }
                    return ProbeResult::Succeeded { protocol, log };
                }

                debug!(
                    protocol = %protocol,
                    attempt = attempt_number,
                    of = retries,
                    failure = ?log.last().and_then(|a| a.failure.as_ref()),
                    "Reachability test failed"
                );
            }
            warn!(protocol = %protocol, "Protocol exhausted its retry budget");
        }

        ProbeResult::Exhausted { log }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPreferenceStore;

    #[test]
    fn test_effective_chain_moves_preference_to_front() {
        let chain = [Protocol::Primary, Protocol::SecondaryA, Protocol::SecondaryB];
        assert_eq!(
            effective_chain(&chain, Some(Protocol::SecondaryA)),
            vec![Protocol::SecondaryA, Protocol::Primary, Protocol::SecondaryB]
        );
        assert_eq!(effective_chain(&chain, None), chain.to_vec());
    }

    #[test]
    fn test_effective_chain_ignores_unsupported_preference() {
        let chain = [Protocol::Primary, Protocol::SecondaryB];
        assert_eq!(
            effective_chain(&chain, Some(Protocol::SecondaryC)),
            chain.to_vec()
        );
    }

    #[test]
    fn test_policy_validation() {
        assert!(ProbePolicy::default().validate().is_ok());

        let policy = ProbePolicy {
            max_retries_per_protocol: 0,
            ..ProbePolicy::default()
        };
        assert_eq!(
            policy.validate(),
            Err(PolicyValidationError::InvalidProbeRetries(0))
        );

        let policy = ProbePolicy {
            handshake_timeout_ms: 10,
            ..ProbePolicy::default()
        };
        assert_eq!(
            policy.validate(),
            Err(PolicyValidationError::InvalidHandshakeTimeout(10))
        );
    }

    #[test]
    fn test_preference_roundtrip_and_garbage() {
        let store = Arc::new(MemoryPreferenceStore::new());
        let prober = ProtocolProber::with_tcp(store.clone());
        assert_eq!(prober.preferred_protocol(), None);

        prober
            .set_preferred_protocol(Some(Protocol::SecondaryC))
            .unwrap();
        assert_eq!(prober.preferred_protocol(), Some(Protocol::SecondaryC));

        store.write(PREFERRED_PROTOCOL_KEY, "carrier-pigeon").unwrap();
        assert_eq!(prober.preferred_protocol(), None);

        prober.set_preferred_protocol(None).unwrap();
        assert_eq!(store.read(PREFERRED_PROTOCOL_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_tcp_reachability_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = TcpReachability
            .handshake("127.0.0.1", port, Protocol::Primary, Duration::from_secs(2))
            .await;
        assert!(result.is_ok());

        drop(listener);
        let result = TcpReachability
            .handshake("127.0.0.1", port, Protocol::Primary, Duration::from_secs(2))
            .await;
        assert!(result.is_err());
    }
}

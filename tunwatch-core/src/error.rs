//! Error types for the tunwatch connection engine
//!
//! This module defines the error taxonomy used throughout the engine.
//! None of these errors escape the engine's public command surface: tunnel
//! and probe failures are folded into `ConnectionState::Error`, while
//! storage and configuration errors are returned to the caller that asked
//! for them (CLI, settings screens).

use crate::types::Protocol;
use thiserror::Error;

/// Main error type for the tunwatch application
#[derive(Error, Debug)]
pub enum EngineError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors related to the persisted preference store
    #[error("Preference store error: {0}")]
    Store(#[from] StoreError),

    /// Errors reported by a tunnel driver
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Errors related to network signal sources
    #[error("Network monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Failed to save configuration file: {path}")]
    SaveFailed { path: String },

    #[error("Unknown server: {id}")]
    UnknownServer { id: String },

    #[error("No servers configured")]
    NoServers,

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Errors reported by a [`TunnelDriver`](crate::vpn::driver::TunnelDriver)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error("failed to open {protocol} tunnel: {reason}")]
    OpenFailed { protocol: Protocol, reason: String },

    #[error("failed to close tunnel: {reason}")]
    CloseFailed { reason: String },

    #[error("no tunnel command configured for {protocol}")]
    Unsupported { protocol: Protocol },

    #[error("failed to spawn tunnel process: {reason}")]
    ProcessSpawnError { reason: String },

    #[error("tunnel operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },
}

/// Persisted preference store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read preference store {path}: {message}")]
    ReadFailed { path: String, message: String },

    #[error("Failed to write preference store {path}: {message}")]
    WriteFailed { path: String, message: String },

    #[error("Preference store {path} is corrupt: {message}")]
    Corrupt { path: String, message: String },
}

/// Errors raised by network signal sources
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("D-Bus connection failed: {0}")]
    DBusConnectionFailed(#[from] zbus::Error),

    #[error("NetworkManager not available")]
    NetworkManagerUnavailable,

    #[error("Failed to query network state: {0}")]
    QueryFailed(String),
}

/// Errors that end an automatic reconnection campaign
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Reconnect budget exhausted after {attempts} attempts")]
    BudgetExhausted { attempts: u32 },

    #[error("Reconnect campaign aborted by explicit disconnect")]
    Aborted,
}

/// Why a connection attempt ended in `ConnectionState::Error`
///
/// The rendered message is what the user sees next to a "Retry" affordance.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FailureCause {
    #[error("no reachable protocol (tried: {})", join_protocols(.tried))]
    ProbeExhausted { tried: Vec<Protocol> },

    #[error("{0}")]
    Tunnel(#[from] TunnelError),

    #[error("tunnel lost and {attempts} recovery attempts failed")]
    RecoveryExhausted { attempts: u32 },
}

fn join_protocols(protocols: &[Protocol]) -> String {
    if protocols.is_empty() {
        return "none".to_string();
    }
    protocols
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validation errors for engine policies
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyValidationError {
    #[error("max_retries_per_protocol must be between 1 and 10, got: {0}")]
    InvalidProbeRetries(u32),

    #[error("handshake_timeout_ms must be between 100 and 60000, got: {0}")]
    InvalidHandshakeTimeout(u64),

    #[error("max_attempts must be between 1 and 20, got: {0}")]
    InvalidMaxAttempts(u32),

    #[error("base_delay_secs must be between 1 and 300, got: {0}")]
    InvalidBaseDelay(u64),

    #[error("close_timeout_secs must be between 1 and 60, got: {0}")]
    InvalidCloseTimeout(u64),

    #[error("poll_interval_secs must be between 1 and 300, got: {0}")]
    InvalidPollInterval(u64),

    #[error("server {0} must list at least one protocol")]
    EmptyProtocolList(String),

    #[error("duplicate server id: {0}")]
    DuplicateServer(String),

    #[error("recommended_server {0} is not a configured server")]
    UnknownRecommendedServer(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;

//! Core library for the tunwatch VPN supervisor
//!
//! This crate provides the connection resilience engine: a connection state
//! machine with protocol fallback probing, mid-session recovery, automatic
//! reconnection when connectivity returns, and auto-connect on untrusted WiFi.

pub mod error;
pub mod signal;
pub mod store;
pub mod types;

pub mod config;
pub mod vpn;

/// Initialize logging infrastructure
///
/// Sets up tracing with systemd journal logging when running under systemd.
/// Otherwise logs to stderr. The level comes from `RUST_LOG`, defaulting to info.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if std::env::var("JOURNAL_STREAM").is_ok() {
            let journal_layer = tracing_journald::layer()?;
            tracing_subscriber::registry()
                .with(journal_layer)
                .with(filter)
                .try_init()?;
            return Ok(());
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(filter)
        .try_init()?;

    Ok(())
}

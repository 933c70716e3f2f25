//! CLI command implementations
//!
//! This module contains the implementation of all CLI subcommands.

use std::path::Path;
use std::sync::Arc;
use tunwatch_core::config::{toml_config, EngineConfig};
use tunwatch_core::error::EngineError;
use tunwatch_core::store::FilePreferenceStore;
use tunwatch_core::types::ServerDescriptor;
use tunwatch_core::vpn::ProtocolProber;

pub mod probe;
pub mod protocol;
pub mod run;
pub mod servers;

/// Load the configuration from `path`, or from the default location
pub(crate) fn load_config(path: Option<&Path>) -> Result<EngineConfig, EngineError> {
    match path {
        Some(path) => toml_config::load_config_from_path(path),
        None => toml_config::load_config(),
    }
}

/// Resolve `--server`, falling back to the recommended server
pub(crate) fn select_server(
    config: &EngineConfig,
    server: Option<&str>,
) -> Result<ServerDescriptor, EngineError> {
    let server = match server {
        Some(id) => config.server(id)?,
        None => config.default_server()?,
    };
    Ok(server.clone())
}

/// Prober backed by the on-disk preference store
pub(crate) fn file_prober() -> Result<Arc<ProtocolProber>, EngineError> {
    let store = FilePreferenceStore::new(toml_config::get_state_path()?);
    Ok(Arc::new(ProtocolProber::with_tcp(Arc::new(store))))
}

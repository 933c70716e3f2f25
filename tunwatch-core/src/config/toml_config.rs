//! TOML configuration file I/O
//!
//! Handles loading and saving the engine configuration to/from TOML files
//! in the user's configuration directory.

use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// File holding learned state such as the preferred protocol
const STATE_FILE_NAME: &str = "state.toml";

/// Get the default configuration directory
///
/// Returns ~/.config/tunwatch on Linux, or TUNWATCH_CONFIG_DIR environment variable if set.
/// When run through sudo, the invoking user's home is used.
pub fn get_config_dir() -> Result<PathBuf, EngineError> {
    if let Ok(config_dir) = std::env::var("TUNWATCH_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    let home = if let Ok(sudo_user) = std::env::var("SUDO_USER") {
        std::env::var("SUDO_HOME").unwrap_or_else(|_| format!("/home/{}", sudo_user))
    } else {
        std::env::var("HOME").map_err(|_| {
            EngineError::Config(ConfigError::IoError {
                message: "HOME environment variable not set".to_string(),
            })
        })?
    };

    Ok(PathBuf::from(home).join(".config").join("tunwatch"))
}

/// Get the default configuration file path
pub fn get_config_path() -> Result<PathBuf, EngineError> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Get the path of the preference store
pub fn get_state_path() -> Result<PathBuf, EngineError> {
    Ok(get_config_dir()?.join(STATE_FILE_NAME))
}

/// Load the engine configuration from the default TOML file
///
/// A missing file yields the default configuration.
pub fn load_config() -> Result<EngineConfig, EngineError> {
    let config_path = get_config_path()?;
    if !config_path.exists() {
        debug!(path = %config_path.display(), "No configuration file, using defaults");
        return Ok(EngineConfig::default());
    }
    load_config_from_path(&config_path)
}

/// Load the engine configuration from a specific TOML file
pub fn load_config_from_path<P: AsRef<Path>>(path: P) -> Result<EngineConfig, EngineError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => EngineError::Config(ConfigError::LoadFailed {
            path: path.to_string_lossy().to_string(),
        }),
        _ => EngineError::Config(ConfigError::IoError {
            message: format!("Failed to read config file: {}", e),
        }),
    })?;

    let config: EngineConfig = toml::from_str(&contents).map_err(|e| {
        EngineError::Config(ConfigError::ValidationError {
            message: format!("Failed to parse config file: {}", e),
        })
    })?;

    config.validate().map_err(|e| {
        warn!("Configuration validation failed: {}", e);
        EngineError::Config(ConfigError::ValidationError {
            message: e.to_string(),
        })
    })?;

    info!(
        servers = config.servers.len(),
        max_retries_per_protocol = config.probe.max_retries_per_protocol,
        handshake_timeout_ms = config.probe.handshake_timeout_ms,
        recovery_attempts = config.recovery.max_attempts,
        auto_reconnect = config.auto_reconnect.enabled,
        auto_connect_untrusted = config.wifi.auto_connect_untrusted,
        "Loaded configuration from {}",
        path.display()
    );
    Ok(config)
}

/// Save the engine configuration to a specific TOML file
pub fn save_config_to_path<P: AsRef<Path>>(
    config: &EngineConfig,
    path: P,
) -> Result<(), EngineError> {
    let path = path.as_ref();
    config.validate().map_err(|e| {
        EngineError::Config(ConfigError::ValidationError {
            message: e.to_string(),
        })
    })?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            EngineError::Config(ConfigError::IoError {
                message: format!("Failed to create config directory: {}", e),
            })
        })?;
    }

    let toml_string = toml::to_string_pretty(config)?;
    std::fs::write(path, toml_string).map_err(|_| {
        EngineError::Config(ConfigError::SaveFailed {
            path: path.to_string_lossy().to_string(),
        })
    })?;

    info!("Saved configuration to {}", path.display());
    Ok(())
}

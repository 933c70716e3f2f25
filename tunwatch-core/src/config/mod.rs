//! Configuration module
//!
//! Engine configuration as read from `config.toml`: probe and recovery
//! budgets, auto-reconnect and WiFi trigger settings, the server list and
//! the tunnel client commands.

use crate::error::{ConfigError, PolicyValidationError};
use crate::types::{ServerDescriptor, TrustList};
use crate::vpn::auto_reconnect::AutoReconnectPolicy;
use crate::vpn::command_driver::DriverSettings;
use crate::vpn::machine::{MachineConfig, RecoveryPolicy};
use crate::vpn::prober::ProbePolicy;
use crate::vpn::wifi_trigger::{ServerSelector, TrustSettings};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

pub mod toml_config;

/// `[wifi]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiSettings {
    /// Connect automatically when joining a WiFi network not in `trusted_ssids`
    #[serde(default)]
    pub auto_connect_untrusted: bool,

    #[serde(default)]
    pub trusted_ssids: Vec<String>,

    /// NetworkManager polling interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self {
            auto_connect_untrusted: false,
            trusted_ssids: Vec::new(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl WifiSettings {
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if self.poll_interval_secs < 1 || self.poll_interval_secs > 300 {
            return Err(PolicyValidationError::InvalidPollInterval(
                self.poll_interval_secs,
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl TrustSettings for WifiSettings {
    fn auto_connect_untrusted_wifi(&self) -> bool {
        self.auto_connect_untrusted
    }

    fn trust_list(&self) -> TrustList {
        TrustList::new(self.trusted_ssids.iter().cloned())
    }
}

/// `[engine]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Upper bound for closing a tunnel
    #[serde(default = "default_close_timeout")]
    pub close_timeout_secs: u64,
}

fn default_close_timeout() -> u64 {
    5
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            close_timeout_secs: default_close_timeout(),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server id used by auto-connect and when no `--server` is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_server: Option<String>,

    #[serde(default)]
    pub probe: ProbePolicy,

    /// Mid-session tunnel recovery
    #[serde(default)]
    pub recovery: RecoveryPolicy,

    #[serde(default)]
    pub auto_reconnect: AutoReconnectPolicy,

    #[serde(default)]
    pub wifi: WifiSettings,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub driver: DriverSettings,

    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
}

impl EngineConfig {
    /// Validate every section and the server list
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        self.probe.validate()?;
        self.recovery.validate()?;
        self.auto_reconnect.validate()?;
        self.wifi.validate()?;

        let close_timeout = self.engine.close_timeout_secs;
        if !(1..=60).contains(&close_timeout) {
            return Err(PolicyValidationError::InvalidCloseTimeout(close_timeout));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.id.as_str()) {
                return Err(PolicyValidationError::DuplicateServer(server.id.clone()));
            }
            if server.supported_protocols.is_empty() {
                return Err(PolicyValidationError::EmptyProtocolList(server.id.clone()));
            }
        }

        if let Some(id) = &self.recommended_server {
            if !seen.contains(id.as_str()) {
                return Err(PolicyValidationError::UnknownRecommendedServer(id.clone()));
            }
        }
        Ok(())
    }

    /// Look up a server by id
    pub fn server(&self, id: &str) -> Result<&ServerDescriptor, ConfigError> {
        self.servers
            .iter()
            .find(|server| server.id == id)
            .ok_or_else(|| ConfigError::UnknownServer { id: id.to_string() })
    }

    /// The recommended server, or the first configured one
    pub fn default_server(&self) -> Result<&ServerDescriptor, ConfigError> {
        match &self.recommended_server {
            Some(id) => self.server(id),
            None => self.servers.first().ok_or(ConfigError::NoServers),
        }
    }

    /// Runtime settings for the connection state machine
    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            probe: self.probe.clone(),
            recovery: self.recovery.clone(),
            close_timeout: Duration::from_secs(self.engine.close_timeout_secs),
        }
    }
}

impl ServerSelector for EngineConfig {
    fn recommended_server(&self) -> Option<ServerDescriptor> {
        self.default_server().ok().cloned()
    }
}

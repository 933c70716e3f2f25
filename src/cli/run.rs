//! `tunwatch run`: connect and supervise until Ctrl+C

use chrono::Local;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tunwatch_core::error::{ConfigError, EngineError};
use tunwatch_core::types::Protocol;
use tunwatch_core::vpn::{
    AutoReconnectService, CommandTunnelDriver, ConnectionState, ConnectionStateMachine,
    NetworkMonitor, UntrustedWifiTrigger,
};

fn describe(state: &ConnectionState) -> String {
    match state {
        ConnectionState::Connected {
            target,
            protocol,
            since,
        } => format!(
            "{} to {} via {} (since {})",
            "Connected".green().bold(),
            target,
            protocol,
            since.with_timezone(&Local).format("%H:%M:%S")
        ),
        ConnectionState::Reconnecting { .. } => state.to_string().yellow().to_string(),
        ConnectionState::Error { message, .. } => {
            format!("{} {}", "Error:".red().bold(), message)
        }
        _ => state.to_string(),
    }
}

pub async fn run_engine(
    config_path: Option<&Path>,
    server: Option<String>,
    protocol: Option<Protocol>,
) -> Result<(), EngineError> {
    let mut config = super::load_config(config_path)?;
    let target = super::select_server(&config, server.as_deref())?;
    if let Some(protocol) = protocol {
        config.probe.manual_override = Some(protocol);
    }
    if config.driver.commands.is_empty() {
        return Err(ConfigError::ValidationError {
            message: "no tunnel commands configured under [driver.commands]".to_string(),
        }
        .into());
    }

    let driver = Arc::new(CommandTunnelDriver::new(&config.driver)?);
    let machine =
        ConnectionStateMachine::start(driver, super::file_prober()?, config.machine_config());

    let mut transitions = machine.observe_transitions();
    let printer = tokio::spawn(async move {
        while let Some(state) = transitions.recv().await {
            println!("{}", describe(&state));
        }
    });

    let monitor = match NetworkMonitor::new().await {
        Ok(monitor) => Some(monitor),
        Err(e) => {
            warn!("Network monitoring unavailable, running without auto-reconnect: {}", e);
            None
        }
    };

    let interval = config.wifi.poll_interval();
    let auto_reconnect = match &monitor {
        Some(monitor) if config.auto_reconnect.enabled => {
            let service = AutoReconnectService::new(
                machine.clone(),
                Arc::new(monitor.connectivity_signal(interval)),
                config.auto_reconnect.clone(),
            );
            service.start(target.clone());
            Some(service)
        }
        _ => None,
    };
    let wifi_trigger = match &monitor {
        Some(monitor) if config.wifi.auto_connect_untrusted => {
            let trigger = UntrustedWifiTrigger::new(
                machine.clone(),
                Arc::new(monitor.wifi_signal(interval)),
                Arc::new(config.wifi.clone()),
                Arc::new(config.clone()),
            );
            trigger.start();
            Some(trigger)
        }
        _ => None,
    };

    info!(server = %target.id, "Connecting");
    machine.connect(target).await;

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");

    if let Some(trigger) = &wifi_trigger {
        trigger.stop();
    }
    if let Some(service) = &auto_reconnect {
        service.stop();
    }
    machine.shutdown().await;
    let _ = printer.await;
    Ok(())
}

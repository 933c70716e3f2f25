//! `tunwatch probe`

use colored::Colorize;
use std::path::Path;
use tunwatch_core::error::EngineError;
use tunwatch_core::vpn::ProbeResult;

/// Probe the server's protocol chain and print the log
pub async fn run_probe(
    config_path: Option<&Path>,
    server: Option<String>,
    json: bool,
) -> Result<(), EngineError> {
    let config = super::load_config(config_path)?;
    let target = super::select_server(&config, server.as_deref())?;
    let prober = super::file_prober()?;

    let result = prober
        .probe(&target.address, target.port, &target.protocol_chain(), &config.probe)
        .await;

    if json {
        serde_json::to_writer_pretty(std::io::stdout(), &result).map_err(std::io::Error::from)?;
        println!();
        return Ok(());
    }

    println!("Probing {}", target);
    for attempt in result.log() {
        let outcome = match &attempt.failure {
            None => "ok".green(),
            Some(failure) => failure.to_string().red(),
        };
        println!(
            "  {:<12} attempt {}  {}",
            attempt.protocol.as_str(),
            attempt.attempt_number,
            outcome
        );
    }

    match result {
        ProbeResult::Succeeded { protocol, .. } => {
            println!("{} {}", "Reachable via".green().bold(), protocol);
        }
        ProbeResult::Exhausted { .. } => {
            println!("{}", "No reachable protocol".red().bold());
        }
    }
    Ok(())
}

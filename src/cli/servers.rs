use colored::Colorize;
use std::path::Path;
use tunwatch_core::error::EngineError;

/// List configured servers with their protocol chains
pub fn run_servers(config_path: Option<&Path>) -> Result<(), EngineError> {
    let config = super::load_config(config_path)?;
    if config.servers.is_empty() {
        println!("No servers configured");
        return Ok(());
    }

    let recommended = config.default_server().ok().map(|s| s.id.clone());
    for server in &config.servers {
        let chain = server
            .protocol_chain()
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(" > ");
        let marker = if recommended.as_deref() == Some(server.id.as_str()) {
            "*".green().bold()
        } else {
            " ".normal()
        };
        println!("{} {:<12} {}  [{}]", marker, server.id.bold(), server, chain);
    }
    Ok(())
}

//! tunwatch - resilient VPN connection supervisor
//!
//! Keeps a VPN tunnel up across flaky networks: picks a protocol that is
//! not filtered at the current location, recovers dropped tunnels,
//! reconnects when connectivity returns and connects on untrusted WiFi.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tunwatch_core::error::EngineError;
use tunwatch_core::init_logging;
use tunwatch_core::types::Protocol;

mod cli;

#[derive(Parser)]
#[command(name = "tunwatch")]
#[command(about = "Resilient VPN supervisor with protocol fallback and automatic reconnection")]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.config/tunwatch/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and keep the tunnel up until interrupted
    Run {
        /// Server id (default: recommended server)
        #[arg(long)]
        server: Option<String>,
        /// Use only this protocol, with no fallback
        #[arg(long)]
        protocol: Option<Protocol>,
    },
    /// Test which protocol currently reaches a server
    Probe {
        /// Server id (default: recommended server)
        #[arg(long)]
        server: Option<String>,
        /// Print the probe log as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show or change the preferred protocol
    Protocol {
        #[command(subcommand)]
        action: ProtocolCommands,
    },
    /// List configured servers
    Servers,
}

#[derive(Subcommand)]
enum ProtocolCommands {
    /// Show the preferred protocol
    Get,
    /// Try this protocol first on the next connection
    Set { protocol: Protocol },
    /// Forget the preference and use the default fallback order
    Clear,
}

#[tokio::main]
async fn main() {
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    let result = match cli.command {
        Commands::Run { server, protocol } => cli::run::run_engine(config, server, protocol).await,
        Commands::Probe { server, json } => cli::probe::run_probe(config, server, json).await,
        Commands::Protocol { action } => match action {
            ProtocolCommands::Get => cli::protocol::run_protocol_get(),
            ProtocolCommands::Set { protocol } => cli::protocol::run_protocol_set(protocol),
            ProtocolCommands::Clear => cli::protocol::run_protocol_clear(),
        },
        Commands::Servers => cli::servers::run_servers(config),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            let exit_code = match e {
                // Configuration and stored state problems (exit code 2)
                EngineError::Config(_) | EngineError::Toml(_) | EngineError::TomlSerialize(_) => 2,
                EngineError::Store(_) => 2,
                // Runtime failures (exit code 1)
                EngineError::Tunnel(_) | EngineError::Monitor(_) | EngineError::Io(_) => 1,
            };

            eprintln!("{}", e);
            std::process::exit(exit_code);
        }
    }
}

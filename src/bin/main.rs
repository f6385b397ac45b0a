//! translate-stream binary.
//!
//! Entry point for the streaming translation service and its local tools.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use translate_stream_core::{
    cli::commands::Commands,
    cli::{handle_config, handle_device, handle_server, handle_translate, init_logging, validate_config},
    config::ServiceConfig,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level or filter directives (overrides configuration)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        ServiceConfig::load(cli.command.config_args()).context("Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.filter = Some(level);
    }
    let _log_guard = init_logging(&config.logging)?;
    validate_config(&config)?;

    info!("translate-stream {} starting up", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Server(_) => handle_server(config).await,
        Commands::Translate(cmd) => handle_translate(config, cmd).await,
        Commands::Device(_) => {
            if !handle_device(&config)? {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Config(_) => handle_config(&config),
    }
}

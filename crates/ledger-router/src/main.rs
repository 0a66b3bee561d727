//! Claim Ledger Router CLI
//!
//! Starts the HTTP server and the background janitor.

use anyhow::Context;
use clap::Parser;
use ledger_router::{config::RouterConfig, init_tracing, start_server};
use std::path::PathBuf;

/// Claim Ledger Router - versioned claims over HTTP
#[derive(Debug, Parser)]
#[command(name = "ledger-router")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured bind port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RouterConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => {
            eprintln!("Warning: No config file specified, using default test configuration");
            eprintln!("Usage: ledger-router --config <path-to-config.toml>");
            eprintln!();
            RouterConfig::default_test_config()
        }
    };
    if let Some(port) = cli.port {
        config.bind_port = port;
    }

    init_tracing(&config.log_filter);
    start_server(config).await?;

    Ok(())
}

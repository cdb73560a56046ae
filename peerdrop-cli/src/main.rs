//! Peerdrop CLI - Command-line interface
//!
//! Runs the tracker, shares files as a peer, and fetches files from peers.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use peerdrop_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "peerdrop")]
#[command(about = "Tracker-coordinated peer-to-peer file distribution")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the full trace of the last run
    #[arg(long)]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(
        cli.log_level.as_tracing_level(),
        cli.logs_dir.as_deref(),
        cli.command.role(),
    )?;

    if let Err(e) = commands::handle_command(cli.command).await {
        eprintln!("Error: {}", e.user_message());
        tracing::error!(error = %e, "Command failed");
        std::process::exit(1);
    }

    Ok(())
}

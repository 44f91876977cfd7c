//! Tideshift CLI - Command-line interface
//!
//! Records channels through the time-shift engine and inspects playlists.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use tideshift_core::TideshiftConfig;
use tideshift_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "tideshift")]
#[command(about = "IPTV streaming cache and time-shift engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level
    #[arg(long, global = true, default_value = "info")]
    log_level: CliLogLevel,

    /// JSON settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for the debug log file
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    let config = match &cli.config {
        Some(path) => TideshiftConfig::from_json_file(path)?,
        None => TideshiftConfig::from_env(),
    };

    commands::handle_command(cli.command, config).await
}

//! Tributary CLI - Command-line interface
//!
//! Runs the extraction pipeline against local files, with the outbox
//! directory standing in for the chat.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use tributary_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "tributary")]
#[command(about = "Extract audio and subtitle streams from video files")]
struct Cli {
    /// Console log level
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Working directory for staged files (overrides TRIBUTARY_WORK_DIR)
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)?;

    commands::handle_command(cli.command, cli.work_dir).await
}

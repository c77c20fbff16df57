//! pairsync: keep pairs of directories in two-way sync.
//!
//! # Usage
//!
//! ```text
//! pairsync run [--json-logs] [--config <path>]
//! pairsync validate [--config <path>]
//! pairsync sync [job] [--dry-run] [--config <path>]
//! pairsync status [--json]
//! pairsync stop
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{daemon::RunArgs, status::StatusArgs, sync::SyncArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "pairsync",
    version,
    about = "Keep pairs of directories in two-way sync",
    long_about = None,
)]
struct Cli {
    /// Config file to use instead of ~/.pairsync/config.yaml.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync daemon in the foreground.
    Run(RunArgs),

    /// Check every configured job and report the ones that cannot run.
    Validate,

    /// Run one cycle for a job, or for every job.
    Sync(SyncArgs),

    /// Show daemon and per-job status.
    Status(StatusArgs),

    /// Ask a running daemon to shut down.
    Stop,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();
    match cli.command {
        Commands::Run(args) => args.run(config),
        Commands::Validate => commands::validate::run(config),
        Commands::Sync(args) => args.run(config),
        Commands::Status(args) => args.run(),
        Commands::Stop => commands::daemon::stop(),
    }
}

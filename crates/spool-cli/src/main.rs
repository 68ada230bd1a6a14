//! Spool CLI - inspect and administer a spool job store
//!
//! # Usage
//!
//! ```bash
//! # List failed deploy jobs
//! spool list --status failed --type deploy
//!
//! # Queue a job for the next scheduler start
//! spool enqueue nightly-build codegen --priority high --payload '{"target": "web"}'
//!
//! # Drop finished jobs older than a week
//! spool purge --older-than-hours 168
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::{info, jobs};

/// Spool - background job scheduler tooling
///
/// Commands operate on the file store directly. Jobs enqueued here are
/// picked up by a scheduler process when it recovers the store.
#[derive(Parser)]
#[command(name = "spool", version, about = "Spool CLI - job store administration")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Directory holding the file store
    #[arg(long, env = "SPOOL_DATA_DIR", default_value = "./spool-data", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored jobs
    #[command(name = "list")]
    List(jobs::ListArgs),

    /// Show one job as JSON
    #[command(name = "show")]
    Show(jobs::ShowArgs),

    /// Store a new PENDING job
    #[command(name = "enqueue")]
    Enqueue(jobs::EnqueueArgs),

    /// Cancel a job that has not finished
    #[command(name = "cancel")]
    Cancel(jobs::CancelArgs),

    /// Delete finished jobs past a retention age
    #[command(name = "purge")]
    Purge(jobs::PurgeArgs),

    /// Show effective configuration
    #[command(name = "info")]
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::List(args) => jobs::list(&cli.data_dir, args).await,
        Commands::Show(args) => jobs::show(&cli.data_dir, args).await,
        Commands::Enqueue(args) => jobs::enqueue(&cli.data_dir, args).await,
        Commands::Cancel(args) => jobs::cancel(&cli.data_dir, args).await,
        Commands::Purge(args) => jobs::purge(&cli.data_dir, args).await,
        Commands::Info => info::run(&cli.data_dir).await,
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();
}

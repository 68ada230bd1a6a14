//! Info command - Show effective configuration
//!
//! Usage:
//! ```bash
//! spool info
//! ```

use anyhow::Result;
use colored::Colorize;
use spool_queue::QueueConfig;
use spool_store::{FileBackend, StorageBackend};
use std::path::Path;

/// Run the info command
pub async fn run(data_dir: &Path) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");

    println!("{}", "Spool - background job scheduler".bold().cyan());
    println!("{}", "═".repeat(50).cyan());
    println!();

    println!("{}", "Version:".bold());
    println!("  {} {}", "CLI Version:".dimmed(), version.green());
    println!();

    println!("{}", "Store:".bold());
    println!("  {} {}", "Data dir:".dimmed(), data_dir.display());
    let backend = FileBackend::open(data_dir).await?;
    let health = if backend.is_healthy().await {
        "healthy".green()
    } else {
        "unavailable".red()
    };
    println!("  {} {} ({})", "Backend:".dimmed(), backend.name(), health);
    println!();

    println!("{}", "Scheduler defaults (SPOOL_* environment):".bold());
    match QueueConfig::from_env() {
        Ok(config) => {
            println!("  {} {}", "Concurrency:".dimmed(), config.concurrency);
            println!(
                "  {} {}ms",
                "Default timeout:".dimmed(),
                config.default_timeout.as_millis()
            );
            println!("  {} {}", "Default retries:".dimmed(), config.default_max_retries);
            println!("  {} {}", "Autostart:".dimmed(), config.autostart);
            println!(
                "  {} {}ms",
                "Sweep interval:".dimmed(),
                config.sweep_interval.as_millis()
            );
        }
        Err(e) => println!("  {} {}", "✗".red(), e),
    }
    println!();

    Ok(())
}

//! Job commands - list, inspect, enqueue, cancel and purge stored jobs
//!
//! Usage:
//! ```bash
//! spool list --status pending
//! spool show 3f0c9a7e-...
//! spool enqueue release deploy --payload '{"env": "prod"}'
//! spool cancel 3f0c9a7e-...
//! spool purge --older-than-hours 24
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use spool_queue::{Job, JobCreationParams, JobFilter, JobId, JobStatus, JobStore, Priority, QueueConfig};
use spool_store::FileBackend;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

#[derive(Args)]
pub struct ListArgs {
    /// Only jobs in this status (pending, running, completed, failed, cancelled)
    #[arg(long)]
    status: Option<JobStatus>,

    /// Only jobs of this type
    #[arg(long = "type")]
    job_type: Option<String>,

    /// Only jobs with this priority
    #[arg(long)]
    priority: Option<Priority>,
}

#[derive(Args)]
pub struct ShowArgs {
    /// Job id
    id: JobId,
}

#[derive(Args)]
pub struct EnqueueArgs {
    /// Human-readable job name
    name: String,

    /// Job type, matched against registered handlers
    #[arg(value_name = "TYPE")]
    job_type: String,

    /// low, normal, high or critical
    #[arg(long, default_value = "normal")]
    priority: Priority,

    /// JSON payload handed to the handler
    #[arg(long, default_value = "null")]
    payload: String,

    /// Retry ceiling (defaults to SPOOL_RETRIES or 3)
    #[arg(long)]
    max_retries: Option<u32>,

    /// Running-time limit in milliseconds (defaults to SPOOL_TIMEOUT_MS or 30 minutes)
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Args)]
pub struct CancelArgs {
    /// Job id
    id: JobId,
}

#[derive(Args)]
pub struct PurgeArgs {
    /// Delete finished jobs completed more than this many hours ago
    #[arg(long, default_value_t = 168)]
    older_than_hours: u64,
}

async fn open_store(data_dir: &Path) -> Result<JobStore> {
    debug!(data_dir = %data_dir.display(), "Opening job store");
    let backend = FileBackend::open(data_dir)
        .await
        .with_context(|| format!("Cannot open store at {}", data_dir.display()))?;
    Ok(JobStore::new(Arc::new(backend)))
}

fn status_cell(status: JobStatus) -> Cell {
    let color = match status {
        JobStatus::Pending => Color::Yellow,
        JobStatus::Running => Color::Blue,
        JobStatus::Completed => Color::Green,
        JobStatus::Failed => Color::Red,
        JobStatus::Cancelled => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}

/// List stored jobs in a table
pub async fn list(data_dir: &Path, args: ListArgs) -> Result<()> {
    let store = open_store(data_dir).await?;
    let filter = JobFilter {
        status: args.status,
        job_type: args.job_type,
        priority: args.priority,
    };
    let jobs = store.list(&filter).await?;

    if jobs.is_empty() {
        println!("{}", "No jobs found.".dimmed());
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Type").fg(Color::Cyan),
            Cell::new("Priority").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Progress").fg(Color::Cyan),
            Cell::new("Retries").fg(Color::Cyan),
            Cell::new("Created").fg(Color::Cyan),
        ]);

    for job in &jobs {
        table.add_row(vec![
            Cell::new(job.id),
            Cell::new(&job.name),
            Cell::new(&job.job_type),
            Cell::new(job.priority),
            status_cell(job.status),
            Cell::new(format!("{}%", job.progress)),
            Cell::new(format!("{}/{}", job.retries, job.max_retries)),
            Cell::new(job.created_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!("{table}");
    println!("{} {}", "Total:".dimmed(), jobs.len());
    Ok(())
}

/// Print a single job as JSON
pub async fn show(data_dir: &Path, args: ShowArgs) -> Result<()> {
    let store = open_store(data_dir).await?;
    let job = store
        .load(args.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Job '{}' not found", args.id))?;

    println!("{}", serde_json::to_string_pretty(&job)?);
    if let Some(error) = &job.error {
        println!();
        println!("{} {}", "Last error:".red().bold(), error);
    }
    Ok(())
}

/// Store a new PENDING job
pub async fn enqueue(data_dir: &Path, args: EnqueueArgs) -> Result<()> {
    let store = open_store(data_dir).await?;
    let config = QueueConfig::from_env()?;

    let payload: serde_json::Value = serde_json::from_str(&args.payload)
        .with_context(|| format!("Invalid JSON payload: {}", args.payload))?;

    let mut params = JobCreationParams::new(args.name, args.job_type)
        .priority(args.priority)
        .payload(payload)
        .metadata("source", "spool-cli");
    params.max_retries = args.max_retries;
    params.timeout = args.timeout_ms;

    let job = Job::from_params(params, &config)?;
    store.insert(&job).await?;

    println!(
        "{} Enqueued {} ({}, {})",
        "✓".green(),
        job.id.to_string().bold(),
        job.job_type,
        job.priority
    );
    Ok(())
}

/// Mark a stored job CANCELLED
pub async fn cancel(data_dir: &Path, args: CancelArgs) -> Result<()> {
    let store = open_store(data_dir).await?;
    let mut job = store
        .load(args.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Job '{}' not found", args.id))?;

    if job.cancel() {
        store.save(&job).await?;
        println!("{} Cancelled {}", "✓".green(), job.id);
    } else {
        println!(
            "{} Job {} already finished ({})",
            "ℹ".blue(),
            job.id,
            job.status
        );
    }
    Ok(())
}

/// `now` minus `hours`, or an error when that falls outside the representable range
fn retention_cutoff(now: DateTime<Utc>, hours: u64) -> Result<DateTime<Utc>> {
    let too_large = || anyhow::anyhow!("Retention age of {}h is too large", hours);
    let hours = i64::try_from(hours).map_err(|_| too_large())?;
    let age = chrono::Duration::try_hours(hours).ok_or_else(too_large)?;
    now.checked_sub_signed(age).ok_or_else(too_large)
}

/// Delete finished jobs past the retention age
pub async fn purge(data_dir: &Path, args: PurgeArgs) -> Result<()> {
    let cutoff = retention_cutoff(Utc::now(), args.older_than_hours)?;
    let store = open_store(data_dir).await?;

    let removed = store.purge_finished_before(cutoff, &[]).await?;
    println!(
        "{} Purged {} finished job(s) older than {}h",
        "✓".green(),
        removed,
        args.older_than_hours
    );
    Ok(())
}

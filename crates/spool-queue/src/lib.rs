//! # Spool Queue
//!
//! Single-process background job scheduler.
//!
//! Features:
//! - Priority dispatch (CRITICAL first, FIFO within a tier)
//! - Bounded concurrency
//! - Automatic retries through the PENDING state
//! - Polling timeout sweep
//! - Progress reporting from handlers
//! - Every transition persisted through a pluggable [`spool_store::StorageBackend`]
//!
//! ```ignore
//! use std::sync::Arc;
//! use spool_queue::{handler_fn, JobCreationParams, JobQueue, QueueConfig};
//! use spool_store::FileBackend;
//!
//! let store = Arc::new(FileBackend::open("./spool-data").await?);
//! let queue = JobQueue::open(store, QueueConfig::from_env()?).await?;
//! queue.register_handler("deploy", handler_fn(|job, progress| async move {
//!     progress.report(50).await;
//!     Ok(serde_json::json!({ "deployed": job.name }))
//! }));
//! let job = queue.enqueue(JobCreationParams::new("release", "deploy")).await?;
//! ```

pub mod config;
pub mod error;
pub mod job;
pub mod queue;
pub mod registry;
pub mod store;

pub use config::{ConfigError, QueueConfig};
pub use error::QueueError;
pub use job::{Job, JobCreationParams, JobId, JobStatus, Metadata, Priority};
pub use queue::{JobQueue, ProgressReporter, QueueStats, RecoveryReport};
pub use registry::{handler_fn, HandlerRegistry, JobHandler};
pub use store::{JobFilter, JobStore, JOBS_COLLECTION};

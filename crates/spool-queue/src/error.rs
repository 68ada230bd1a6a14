//! Queue error types

use spool_store::StorageError;

use crate::config::ConfigError;
use crate::job::JobId;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Malformed job creation input, rejected before any state exists
    #[error("Invalid job: {0}")]
    Admission(String),
    /// A value that cannot be parsed or is out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

//! Job persistence over the generic storage backend

use chrono::{DateTime, Utc};
use spool_store::{Filter, StorageBackend, StorageError, StorageExt};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::job::{Job, JobId, JobStatus, Priority};

/// Collection holding job records
pub const JOBS_COLLECTION: &str = "jobs";

/// Criteria for listing jobs. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub priority: Option<Priority>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.job_type.as_deref().map_or(true, |t| job.job_type == t)
            && self.priority.map_or(true, |p| job.priority == p)
    }

    fn to_storage_filter(&self) -> Filter {
        let mut filter = Filter::new();
        if let Some(status) = self.status {
            filter = filter.eq("status", status.as_str());
        }
        if let Some(job_type) = &self.job_type {
            filter = filter.eq("type", job_type.as_str());
        }
        if let Some(priority) = self.priority {
            filter = filter.eq("priority", priority.as_str());
        }
        filter
    }
}

/// Job store for persistence
#[derive(Debug, Clone)]
pub struct JobStore {
    backend: Arc<dyn StorageBackend>,
    collection: String,
}

impl JobStore {
    /// Create a new job store over the `jobs` collection
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_collection(backend, JOBS_COLLECTION)
    }

    /// Create with a custom collection name
    pub fn with_collection(backend: Arc<dyn StorageBackend>, collection: &str) -> Self {
        Self {
            backend,
            collection: collection.to_string(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Write the full job record, creating it if needed
    pub async fn save(&self, job: &Job) -> Result<(), StorageError> {
        self.backend
            .upsert(&self.collection, &job.id.to_string(), job)
            .await
    }

    /// Insert a job that must not exist yet
    pub async fn insert(&self, job: &Job) -> Result<(), StorageError> {
        self.backend.create_typed(&self.collection, job).await
    }

    pub async fn load(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        self.backend.get(&self.collection, &id.to_string()).await
    }

    /// Stored jobs matching `filter`, oldest first.
    /// Records that do not decode as a job are skipped.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StorageError> {
        let records = self
            .backend
            .find(&self.collection, &filter.to_storage_filter())
            .await?;

        let mut jobs = Vec::with_capacity(records.len());
        for record in records {
            let id = record.get("id").cloned().unwrap_or_default();
            match serde_json::from_value::<Job>(record) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!(collection = %self.collection, id = %id, error = %e, "Skipping malformed job record");
                }
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    /// Every stored job that has not reached a terminal state
    pub async fn list_active(&self) -> Result<Vec<Job>, StorageError> {
        let mut jobs = self.list(&JobFilter::new().status(JobStatus::Pending)).await?;
        jobs.extend(self.list(&JobFilter::new().status(JobStatus::Running)).await?);
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    pub async fn delete(&self, id: JobId) -> Result<bool, StorageError> {
        self.backend
            .delete_by_id(&self.collection, &id.to_string())
            .await
    }

    /// Delete terminal jobs that finished before `cutoff`, skipping `keep`
    pub async fn purge_finished_before(
        &self,
        cutoff: DateTime<Utc>,
        keep: &[JobId],
    ) -> Result<u64, StorageError> {
        let mut removed = 0;
        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for job in self.list(&JobFilter::new().status(status)).await? {
                let expired = job.completed_at.is_some_and(|at| at < cutoff);
                if expired && !keep.contains(&job.id) && self.delete(job.id).await? {
                    debug!(job_id = %job.id, status = %job.status, "Purged job record");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

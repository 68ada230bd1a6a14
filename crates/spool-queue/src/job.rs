//! Job definitions and lifecycle transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;

/// Job Identifier
pub type JobId = Uuid;

/// Free-form key/value annotations attached to a job
pub type Metadata = BTreeMap<String, Value>;

/// Scheduling priority. Higher variants are dispatched first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "NORMAL" => Ok(Self::Normal),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(QueueError::InvalidArgument(format!("unknown priority: {}", other))),
        }
    }
}

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for a concurrency slot (fresh or retrying)
    Pending,
    /// Handler invoked, not yet settled
    Running,
    /// Handler returned a result
    Completed,
    /// Failed with no retries remaining
    Failed,
    /// Cancelled before completion
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(QueueError::InvalidArgument(format!("unknown status: {}", other))),
        }
    }
}

/// Input for [`crate::JobQueue::enqueue`]
///
/// Unset fields fall back to the queue's configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCreationParams {
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Milliseconds a dispatch may run before the sweep fails it
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl JobCreationParams {
    pub fn new(name: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_millis() as u64);
        self
    }

    /// Reject malformed input before any state is created
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.name.trim().is_empty() {
            return Err(QueueError::Admission("job name must not be empty".into()));
        }
        if self.job_type.trim().is_empty() {
            return Err(QueueError::Admission("job type must not be empty".into()));
        }
        if self.timeout == Some(0) {
            return Err(QueueError::Admission("job timeout must be positive".into()));
        }
        Ok(())
    }
}

/// One schedulable unit of asynchronous work
///
/// Transitions:
/// `PENDING -> RUNNING -> {COMPLETED, FAILED, CANCELLED}`, plus
/// `RUNNING -> PENDING` when a failure still has retries left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub priority: Priority,
    pub payload: Value,
    #[serde(default)]
    pub metadata: Metadata,
    pub status: JobStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retries: u32,
    pub max_retries: u32,
    /// Maximum wall-clock time in RUNNING, in milliseconds
    pub timeout_ms: u64,
}

impl Job {
    /// Build a PENDING job, filling unset fields from `config`
    pub fn from_params(params: JobCreationParams, config: &QueueConfig) -> Result<Self, QueueError> {
        params.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            name: params.name,
            job_type: params.job_type,
            priority: params.priority.unwrap_or_default(),
            payload: params.payload,
            metadata: params.metadata,
            status: JobStatus::Pending,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retries: 0,
            max_retries: params.max_retries.unwrap_or(config.default_max_retries),
            timeout_ms: params
                .timeout
                .unwrap_or(config.default_timeout.as_millis() as u64),
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// PENDING -> RUNNING. The caller guarantees the job is pending.
    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.progress = 0;
    }

    /// -> COMPLETED with `result`
    pub fn complete(&mut self, result: Value) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.progress = 100;
        self.result = Some(result);
        self.error = None;
    }

    /// Record a failure.
    ///
    /// With retries left the job goes back to PENDING with `retries`
    /// incremented and both timestamps cleared; otherwise it ends FAILED.
    /// Returns `true` if the job will be retried.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        self.error = Some(error.into());
        self.result = None;
        self.completed_at = Some(Utc::now());

        if self.retries < self.max_retries {
            self.retries += 1;
            self.status = JobStatus::Pending;
            self.started_at = None;
            self.completed_at = None;
            true
        } else {
            self.status = JobStatus::Failed;
            false
        }
    }

    /// -> CANCELLED from PENDING or RUNNING. Terminal jobs are left untouched.
    pub fn cancel(&mut self) -> bool {
        if self.is_complete() {
            return false;
        }
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Store `value` clamped into [0, 100]
    pub fn update_progress(&mut self, value: i64) {
        self.progress = value.clamp(0, 100) as u8;
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Running)
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_timed_out(&self) -> bool {
        self.has_timed_out_at(Utc::now())
    }

    pub fn has_timed_out_at(&self, now: DateTime<Utc>) -> bool {
        match self.started_at {
            Some(started) => {
                let elapsed = (now - started).num_milliseconds();
                elapsed > 0 && elapsed as u64 > self.timeout_ms
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(max_retries: u32) -> Job {
        Job::from_params(
            JobCreationParams::new("build", "codegen").max_retries(max_retries),
            &QueueConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let job = Job::from_params(
            JobCreationParams::new("build", "codegen"),
            &QueueConfig::default(),
        )
        .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.timeout_ms, 1_800_000);
        assert_eq!(job.progress, 0);
        assert!(job.started_at.is_none());
        assert!(job.is_active());
    }

    #[test]
    fn test_admission_rejects_malformed_params() {
        let config = QueueConfig::default();
        for params in [
            JobCreationParams::new("", "codegen"),
            JobCreationParams::new("build", "  "),
            JobCreationParams::new("build", "codegen").timeout(Duration::ZERO),
        ] {
            let err = Job::from_params(params, &config).unwrap_err();
            assert!(matches!(err, QueueError::Admission(_)));
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Critical);
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
        assert!(matches!(
            "urgent".parse::<Priority>(),
            Err(QueueError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert_eq!(" CANCELLED ".parse::<JobStatus>().unwrap(), JobStatus::Cancelled);
        let err = "stalled".parse::<JobStatus>().unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));
        assert!(err.to_string().contains("unknown status: STALLED"));
    }

    #[test]
    fn test_progress_clamping() {
        let mut job = job(0);
        for (input, expected) in [(-5, 0), (0, 0), (42, 42), (100, 100), (250, 100), (i64::MIN, 0)] {
            job.update_progress(input);
            assert_eq!(job.progress, expected, "input {}", input);
        }
    }

    #[test]
    fn test_start_resets_progress() {
        let mut job = job(0);
        job.update_progress(30);
        job.start();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress, 0);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn test_complete_sets_result_only() {
        let mut job = job(1);
        job.start();
        job.fail("first attempt broke");
        job.start();
        job.complete(json!({"files": 3}));

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());
        assert_eq!(job.result, Some(json!({"files": 3})));
        assert!(job.error.is_none());
    }

    #[test]
    fn test_retry_bound() {
        let mut job = job(3);
        for attempt in 1..=3 {
            job.start();
            assert!(job.fail(format!("attempt {}", attempt)));
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.retries, attempt);
            assert!(job.started_at.is_none());
            assert!(job.completed_at.is_none());
        }

        job.start();
        assert!(!job.fail("attempt 4"));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retries, 3);
        assert!(job.completed_at.is_some());
        assert!(job.result.is_none());
        assert_eq!(job.error.as_deref(), Some("attempt 4"));
        assert!(job.is_complete());
    }

    #[test]
    fn test_cancel_is_noop_when_terminal() {
        let mut job = job(0);
        job.start();
        job.complete(json!(null));
        let completed_at = job.completed_at;

        assert!(!job.cancel());
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_at, completed_at);

        let mut pending = self::job(0);
        assert!(pending.cancel());
        assert_eq!(pending.status, JobStatus::Cancelled);
        assert!(pending.completed_at.is_some());
    }

    #[test]
    fn test_has_timed_out() {
        let mut job = Job::from_params(
            JobCreationParams::new("deploy", "deploy").timeout(Duration::from_millis(100)),
            &QueueConfig::default(),
        )
        .unwrap();
        assert!(!job.has_timed_out());

        job.start();
        let started = job.started_at.unwrap();
        assert!(!job.has_timed_out_at(started + chrono::Duration::milliseconds(100)));
        assert!(job.has_timed_out_at(started + chrono::Duration::milliseconds(101)));
    }

    #[test]
    fn test_serialized_shape() {
        let job = job(2);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "PENDING");
        assert_eq!(value["priority"], "NORMAL");
        assert_eq!(value["type"], "codegen");
        assert_eq!(value["id"], job.id.to_string());

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }
}

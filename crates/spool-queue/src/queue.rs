//! Job scheduler: admission, priority dispatch, retries and timeout sweeps

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use spool_store::StorageBackend;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::job::{Job, JobCreationParams, JobId, JobStatus, Priority};
use crate::registry::{HandlerRegistry, JobHandler};
use crate::store::{JobFilter, JobStore};

/// Heap entry: highest priority first, then oldest, then first admitted
#[derive(Debug, Clone, Eq, PartialEq)]
struct PendingEntry {
    priority: Priority,
    created_at: DateTime<Utc>,
    seq: u64,
    id: JobId,
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bookkeeping mutated by ticks, settlements, sweeps and cancellation.
/// Always accessed under one lock, never across an await.
#[derive(Debug, Default)]
struct SchedulerState {
    /// Every job that is still PENDING or RUNNING
    jobs: HashMap<JobId, Job>,
    pending: BinaryHeap<PendingEntry>,
    /// RUNNING jobs mapped to the token of their current dispatch
    running: HashMap<JobId, u64>,
    /// Latest snapshots not yet written to storage
    outbox: HashMap<JobId, Job>,
    next_token: u64,
    next_seq: u64,
}

impl SchedulerState {
    fn push_pending(&mut self, job: &Job) {
        self.next_seq += 1;
        self.pending.push(PendingEntry {
            priority: job.priority,
            created_at: job.created_at,
            seq: self.next_seq,
            id: job.id,
        });
    }

    fn record(&mut self, job: &Job) {
        self.outbox.insert(job.id, job.clone());
    }

    /// Route a failure through `Job::fail`, re-queueing or retiring the job
    fn fail_job(&mut self, id: JobId, error: String) -> Option<Job> {
        self.running.remove(&id);
        let job = self.jobs.get_mut(&id)?;
        let retrying = job.fail(error);
        let snapshot = job.clone();

        if retrying {
            warn!(
                job_id = %id,
                job_type = %snapshot.job_type,
                retries = snapshot.retries,
                max_retries = snapshot.max_retries,
                error = snapshot.error.as_deref().unwrap_or_default(),
                "Job failed, re-queueing for retry"
            );
            self.push_pending(&snapshot);
        } else {
            error!(
                job_id = %id,
                job_type = %snapshot.job_type,
                retries = snapshot.retries,
                error = snapshot.error.as_deref().unwrap_or_default(),
                "Job failed permanently"
            );
            self.jobs.remove(&id);
        }
        self.record(&snapshot);
        Some(snapshot)
    }

    fn complete_job(&mut self, id: JobId, result: Value) -> Option<Job> {
        self.running.remove(&id);
        let mut job = self.jobs.remove(&id)?;
        job.complete(result);
        info!(job_id = %id, job_type = %job.job_type, retries = job.retries, "Job completed");
        self.record(&job);
        Some(job)
    }
}

/// Point-in-time scheduler counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    /// Snapshots waiting for a successful storage write
    pub unsaved: usize,
    pub concurrency: usize,
    pub started: bool,
}

/// Outcome of [`JobQueue::recover`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// PENDING records put back in the pending set
    pub requeued: usize,
    /// RUNNING records whose dispatch was lost with the previous process
    pub interrupted: usize,
    /// Records already tracked in memory
    pub skipped: usize,
}

struct Inner {
    config: QueueConfig,
    store: JobStore,
    registry: HandlerRegistry,
    state: Mutex<SchedulerState>,
    /// Serializes storage writes so snapshots land in order
    persist_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handed to a handler to report progress on its job.
///
/// Reports are ignored once the dispatch that created the reporter no longer
/// owns the job (it timed out, was cancelled, or the queue was dropped).
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Weak<Inner>,
    job_id: JobId,
    token: u64,
}

impl ProgressReporter {
    /// A reporter that is not attached to any queue
    pub fn detached(job_id: JobId) -> Self {
        Self {
            inner: Weak::new(),
            job_id,
            token: 0,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Store `value` (clamped to 0..=100) and persist it.
    /// Returns `false` if the report was discarded.
    pub async fn report(&self, value: i64) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        {
            let mut state = inner.lock_state();
            if state.running.get(&self.job_id) != Some(&self.token) {
                return false;
            }
            let Some(job) = state.jobs.get_mut(&self.job_id) else {
                return false;
            };
            job.update_progress(value);
            let snapshot = job.clone();
            debug!(job_id = %self.job_id, progress = snapshot.progress, "Job progress");
            state.record(&snapshot);
        }
        inner.flush().await;
        true
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .field("token", &self.token)
            .finish()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write every outstanding snapshot.
    ///
    /// A snapshot leaves the outbox only once it is stored and nothing newer
    /// replaced it meanwhile. Failures stay queued for the next flush; the
    /// in-memory state stays authoritative.
    async fn flush(&self) {
        let _guard = self.persist_lock.lock().await;
        let batch: Vec<Job> = {
            let state = self.lock_state();
            state.outbox.values().cloned().collect()
        };

        for job in batch {
            match self.store.save(&job).await {
                Ok(()) => {
                    let mut state = self.lock_state();
                    if state.outbox.get(&job.id) == Some(&job) {
                        state.outbox.remove(&job.id);
                    }
                }
                Err(e) => {
                    error!(job_id = %job.id, status = %job.status, error = %e, "Failed to persist job, will retry");
                }
            }
        }
    }

    /// One scheduling tick: fill free slots from the pending set
    fn dispatch_ready(self: &Arc<Self>) -> usize {
        let mut dispatched = 0;
        let mut state = self.lock_state();

        while state.running.len() < self.config.concurrency {
            let Some(entry) = state.pending.pop() else {
                break;
            };
            let id = entry.id;
            // Cancelled or already settled since it was queued.
            let is_pending = state
                .jobs
                .get(&id)
                .is_some_and(|job| job.status == JobStatus::Pending);
            if !is_pending || state.running.contains_key(&id) {
                continue;
            }

            let job_type = state.jobs[&id].job_type.clone();
            let Some(handler) = self.registry.get(&job_type) else {
                warn!(job_id = %id, job_type = %job_type, "No handler registered for job type");
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.start();
                }
                state.fail_job(id, format!("No handler registered for job type: {}", job_type));
                continue;
            };

            state.next_token += 1;
            let token = state.next_token;
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            job.start();
            let snapshot = job.clone();
            state.running.insert(id, token);
            state.record(&snapshot);

            info!(
                job_id = %id,
                job_type = %snapshot.job_type,
                priority = %snapshot.priority,
                attempt = snapshot.retries + 1,
                "Dispatching job"
            );
            self.spawn_handler(handler, snapshot, token);
            dispatched += 1;
        }

        dispatched
    }

    fn spawn_handler(self: &Arc<Self>, handler: Arc<dyn JobHandler>, job: Job, token: u64) {
        let inner = Arc::downgrade(self);
        let id = job.id;
        let progress = ProgressReporter {
            inner: Arc::downgrade(self),
            job_id: id,
            token,
        };

        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler.handle(job, progress))
                .catch_unwind()
                .await;
            let outcome = match outcome {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(_) => Err("handler panicked".to_string()),
            };
            match inner.upgrade() {
                Some(inner) => inner.settle(id, token, outcome).await,
                None => debug!(job_id = %id, "Queue dropped before job settled"),
            }
        });
    }

    /// Apply a handler's outcome if its dispatch still owns the job
    async fn settle(&self, id: JobId, token: u64, outcome: Result<Value, String>) {
        {
            let mut state = self.lock_state();
            if state.running.get(&id) != Some(&token) {
                debug!(job_id = %id, "Discarding outcome of a cancelled or timed-out dispatch");
                return;
            }
            match outcome {
                Ok(result) => {
                    state.complete_job(id, result);
                }
                Err(error) => {
                    state.fail_job(id, error);
                }
            }
        }
        self.flush().await;
        self.wake.notify_one();
    }

    /// Fail every RUNNING job whose dispatch exceeded its timeout
    fn sweep_timeouts(&self) -> usize {
        let now = Utc::now();
        let mut state = self.lock_state();
        let expired: Vec<(JobId, u64)> = state
            .running
            .keys()
            .filter_map(|id| {
                state
                    .jobs
                    .get(id)
                    .filter(|job| job.has_timed_out_at(now))
                    .map(|job| (*id, job.timeout_ms))
            })
            .collect();

        for (id, timeout_ms) in &expired {
            warn!(job_id = %id, timeout_ms = timeout_ms, "Job timed out");
            state.fail_job(*id, format!("Job timed out after {}ms", timeout_ms));
        }
        expired.len()
    }

    /// Scheduling loop. Holds the queue only for one pass at a time and
    /// exits once every `JobQueue` handle is gone.
    async fn run_scheduler(queue: Weak<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let Some(inner) = queue.upgrade() else {
                break;
            };
            if *shutdown.borrow() {
                break;
            }
            inner.flush().await;
            let dispatched = inner.dispatch_ready();
            if dispatched > 0 {
                inner.flush().await;
            }

            tokio::select! {
                _ = inner.wake.notified() => {}
                _ = tokio::time::sleep(inner.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("Scheduler stopped");
    }

    async fn run_sweeper(
        queue: Weak<Self>,
        sweep_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            // Resolves immediately once the sender is dropped with the queue.
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            let Some(inner) = queue.upgrade() else {
                break;
            };
            let expired = inner.sweep_timeouts();
            inner.flush().await;
            if expired > 0 {
                inner.wake.notify_one();
            }
        }
    }
}

/// Single-process job scheduler.
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    fn build(backend: Arc<dyn StorageBackend>, config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store: JobStore::new(backend),
                registry: HandlerRegistry::new(),
                state: Mutex::new(SchedulerState::default()),
                persist_lock: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Create a scheduler over `backend`. Starts immediately when
    /// `config.autostart` is set and a Tokio runtime is available.
    pub fn new(backend: Arc<dyn StorageBackend>, config: QueueConfig) -> Result<Self, QueueError> {
        let queue = Self::build(backend, config)?;
        if queue.inner.config.autostart {
            if tokio::runtime::Handle::try_current().is_ok() {
                queue.start();
            } else {
                warn!("autostart requested outside a Tokio runtime; call start() explicitly");
            }
        }
        Ok(queue)
    }

    /// Create a scheduler, recover persisted jobs, then honor `autostart`
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        let queue = Self::build(backend, config)?;
        let report = queue.recover().await?;
        info!(
            requeued = report.requeued,
            interrupted = report.interrupted,
            skipped = report.skipped,
            "Recovered persisted jobs"
        );
        if queue.inner.config.autostart {
            queue.start();
        }
        Ok(queue)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    /// Register the handler for `job_type`, replacing any previous one
    pub fn register_handler<H>(&self, job_type: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        let job_type = job_type.into();
        if self.inner.registry.register(job_type.clone(), Arc::new(handler)) {
            warn!(job_type = %job_type, "Replaced existing job handler");
        } else {
            debug!(job_type = %job_type, "Registered job handler");
        }
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.inner.registry.types()
    }

    /// Admit a new job. Returns once it is persisted and in the pending set;
    /// never waits for execution.
    pub async fn enqueue(&self, params: JobCreationParams) -> Result<Job, QueueError> {
        let job = Job::from_params(params, &self.inner.config)?;
        {
            let mut state = self.inner.lock_state();
            state.jobs.insert(job.id, job.clone());
            state.push_pending(&job);
            state.record(&job);
        }
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = %job.priority,
            "Job enqueued"
        );

        self.inner.flush().await;
        self.inner.wake.notify_one();
        Ok(job)
    }

    /// Begin the scheduling loop and the timeout sweep. No-op if running.
    pub fn start(&self) {
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !tasks.is_empty() {
            return;
        }

        self.inner.shutdown.send_replace(false);
        info!(concurrency = self.inner.config.concurrency, "Scheduler started");
        tasks.push(tokio::spawn(Inner::run_scheduler(
            Arc::downgrade(&self.inner),
            self.inner.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(Inner::run_sweeper(
            Arc::downgrade(&self.inner),
            self.inner.config.sweep_interval,
            self.inner.shutdown.subscribe(),
        )));
    }

    /// Stop dispatching. In-flight handlers keep running and their outcomes
    /// are still recorded.
    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.drain(..).collect()
        };
        self.inner.shutdown.send_replace(true);
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Scheduler task ended abnormally");
            }
        }
        self.inner.flush().await;
    }

    pub fn is_started(&self) -> bool {
        !self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_empty()
    }

    /// Cancel a PENDING or RUNNING job.
    ///
    /// A running handler is not interrupted; its eventual outcome is
    /// discarded. Cancelling a job that already finished leaves it unchanged.
    pub async fn cancel(&self, id: JobId) -> Result<Job, QueueError> {
        let cancelled = {
            let mut state = self.inner.lock_state();
            match state.jobs.remove(&id) {
                Some(mut job) => {
                    let was_running = state.running.remove(&id).is_some();
                    job.cancel();
                    info!(job_id = %id, was_running = was_running, "Job cancelled");
                    state.record(&job);
                    Some(job)
                }
                None => None,
            }
        };

        if let Some(job) = cancelled {
            self.inner.flush().await;
            self.inner.wake.notify_one();
            return Ok(job);
        }

        // Not tracked in memory: either finished, or persisted by another
        // process and never recovered here.
        let mut job = self.get_job(id).await?.ok_or(QueueError::NotFound(id))?;
        if job.cancel() {
            info!(job_id = %id, "Cancelled untracked stored job");
            self.inner.store.save(&job).await?;
        }
        Ok(job)
    }

    /// Current view of a job: in-memory state first, then storage
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        {
            let state = self.inner.lock_state();
            if let Some(job) = state.jobs.get(&id).or_else(|| state.outbox.get(&id)) {
                return Ok(Some(job.clone()));
            }
        }
        Ok(self.inner.store.load(id).await?)
    }

    /// Jobs matching `filter`, oldest first, with in-memory state overriding
    /// what is stored
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        let stored = self.inner.store.list(filter).await?;
        let mut merged: HashMap<JobId, Job> =
            stored.into_iter().map(|job| (job.id, job)).collect();
        {
            let state = self.inner.lock_state();
            for job in state.outbox.values().chain(state.jobs.values()) {
                merged.insert(job.id, job.clone());
            }
        }

        let mut jobs: Vec<Job> = merged
            .into_values()
            .filter(|job| filter.matches(job))
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock_state();
        QueueStats {
            pending: state
                .jobs
                .values()
                .filter(|job| job.status == JobStatus::Pending)
                .count(),
            running: state.running.len(),
            unsaved: state.outbox.len(),
            concurrency: self.inner.config.concurrency,
            started: self.is_started(),
        }
    }

    /// Reload non-terminal jobs persisted by a previous process.
    ///
    /// PENDING jobs rejoin the pending set. RUNNING jobs lost their handler
    /// with the old process and are failed, consuming one retry.
    pub async fn recover(&self) -> Result<RecoveryReport, QueueError> {
        let mut report = RecoveryReport::default();
        {
            // No flush may run between reading storage and checking memory:
            // a job settled meanwhile must still be found in the outbox.
            let _persist = self.inner.persist_lock.lock().await;
            let stored = self.inner.store.list_active().await?;
            let mut state = self.inner.lock_state();
            for job in stored {
                if state.jobs.contains_key(&job.id) || state.outbox.contains_key(&job.id) {
                    report.skipped += 1;
                    continue;
                }
                let id = job.id;
                match job.status {
                    JobStatus::Running => {
                        state.jobs.insert(id, job);
                        state.fail_job(id, "Job interrupted by process restart".to_string());
                        report.interrupted += 1;
                    }
                    _ => {
                        state.push_pending(&job);
                        state.jobs.insert(id, job);
                        report.requeued += 1;
                    }
                }
            }
        }

        self.inner.flush().await;
        self.inner.wake.notify_one();
        Ok(report)
    }

    /// Delete stored terminal jobs that finished more than `older_than` ago
    pub async fn purge(&self, older_than: Duration) -> Result<u64, QueueError> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| QueueError::InvalidArgument(format!("retention too large: {}", e)))?;
        let cutoff = Utc::now().checked_sub_signed(age).ok_or_else(|| {
            QueueError::InvalidArgument(format!("retention too large: {:?}", older_than))
        })?;
        let keep: Vec<JobId> = {
            let state = self.inner.lock_state();
            state.jobs.keys().chain(state.outbox.keys()).copied().collect()
        };
        let removed = self.inner.store.purge_finished_before(cutoff, &keep).await?;
        if removed > 0 {
            info!(removed = removed, "Purged finished jobs");
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::handler_fn;
    use serde_json::json;
    use spool_store::MemoryBackend;

    fn queue(config: QueueConfig) -> JobQueue {
        JobQueue::new(Arc::new(MemoryBackend::new()), config).unwrap()
    }

    #[test]
    fn test_pending_entry_order() {
        let t = Utc::now();
        let entry = |priority, offset_ms: i64, seq| PendingEntry {
            priority,
            created_at: t + chrono::Duration::milliseconds(offset_ms),
            seq,
            id: JobId::new_v4(),
        };

        let mut heap = BinaryHeap::new();
        let a = entry(Priority::Normal, 1, 1);
        let b = entry(Priority::Critical, 2, 2);
        let c = entry(Priority::High, 3, 3);
        let d = entry(Priority::Normal, 1, 4);
        for e in [a.clone(), b.clone(), c.clone(), d.clone()] {
            heap.push(e);
        }

        let order: Vec<JobId> = std::iter::from_fn(|| heap.pop().map(|e| e.id)).collect();
        assert_eq!(order, vec![b.id, c.id, a.id, d.id]);
    }

    #[tokio::test]
    async fn test_enqueue_persists_pending_job() {
        let queue = queue(QueueConfig::default().with_autostart(false));
        let job = queue
            .enqueue(JobCreationParams::new("gen", "codegen").payload(json!({"x": 1})))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        let stored = queue.store().load(job.id).await.unwrap().unwrap();
        assert_eq!(stored, job);
        assert_eq!(queue.stats().pending, 1);
        assert_eq!(queue.stats().running, 0);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_malformed_params() {
        let queue = queue(QueueConfig::default().with_autostart(false));
        let err = queue
            .enqueue(JobCreationParams::new("", "codegen"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Admission(_)));
        assert!(queue.list_jobs(&JobFilter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tick_respects_concurrency() {
        let queue = queue(
            QueueConfig::default()
                .with_autostart(false)
                .with_concurrency(2),
        );
        queue.register_handler(
            "stuck",
            handler_fn(|_job, _progress| async {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }),
        );
        for i in 0..5 {
            queue
                .enqueue(JobCreationParams::new(format!("job-{}", i), "stuck"))
                .await
                .unwrap();
        }

        assert_eq!(queue.inner.dispatch_ready(), 2);
        assert_eq!(queue.inner.dispatch_ready(), 0);
        let stats = queue.stats();
        assert_eq!(stats.running, 2);
        assert_eq!(stats.pending, 3);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_only_that_job() {
        let queue = queue(QueueConfig::default().with_autostart(false));
        let orphan = queue
            .enqueue(JobCreationParams::new("orphan", "nonexistent").max_retries(0))
            .await
            .unwrap();

        queue.inner.dispatch_ready();
        let job = queue.get_job(orphan.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("nonexistent"));
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_sweep_fails_timed_out_dispatch() {
        let queue = queue(QueueConfig::default().with_autostart(false));
        queue.register_handler(
            "stuck",
            handler_fn(|_job, _progress| async {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }),
        );
        let job = queue
            .enqueue(
                JobCreationParams::new("slow", "stuck")
                    .timeout(Duration::from_millis(20))
                    .max_retries(2),
            )
            .await
            .unwrap();

        queue.inner.dispatch_ready();
        assert_eq!(queue.inner.sweep_timeouts(), 0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(queue.inner.sweep_timeouts(), 1);

        let job = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retries, 1);
        assert!(job.started_at.is_none());
        assert!(job.error.unwrap().contains("timed out"));
        assert_eq!(queue.stats().running, 0);
    }

    #[tokio::test]
    async fn test_stale_settlement_is_discarded() {
        let queue = queue(QueueConfig::default().with_autostart(false));
        let job = queue
            .enqueue(JobCreationParams::new("gen", "codegen"))
            .await
            .unwrap();
        {
            let mut state = queue.inner.lock_state();
            state.jobs.get_mut(&job.id).unwrap().start();
            state.running.insert(job.id, 7);
        }

        queue.inner.settle(job.id, 6, Ok(json!("late"))).await;
        let current = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Running);

        queue.inner.settle(job.id, 7, Ok(json!("done"))).await;
        let current = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Completed);
        assert_eq!(current.result, Some(json!("done")));
    }

    #[tokio::test]
    async fn test_dropped_queue_releases_its_tasks() {
        let queue = queue(
            QueueConfig::default()
                .with_poll_interval(Duration::from_millis(10))
                .with_sweep_interval(Duration::from_millis(10)),
        );
        queue.register_handler(
            "stuck",
            handler_fn(|_job, _progress| async {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }),
        );
        queue
            .enqueue(JobCreationParams::new("slow", "stuck"))
            .await
            .unwrap();
        while queue.stats().running == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let weak = Arc::downgrade(&queue.inner);
        drop(queue);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while weak.strong_count() > 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "scheduler still alive after every handle was dropped"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_purge_rejects_unrepresentable_retention() {
        let queue = queue(QueueConfig::default().with_autostart(false));
        for age in [Duration::MAX, Duration::from_secs(9_000_000_000_000)] {
            let err = queue.purge(age).await.unwrap_err();
            assert!(matches!(err, QueueError::InvalidArgument(_)), "{:?}", err);
        }
    }

    #[tokio::test]
    async fn test_detached_reporter_is_ignored() {
        let reporter = ProgressReporter::detached(JobId::new_v4());
        assert!(!reporter.report(50).await);
    }
}

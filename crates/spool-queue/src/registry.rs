//! Handler registry: job type -> async processing function

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use crate::job::Job;
use crate::queue::ProgressReporter;

/// Performs the work for one job type.
///
/// Handlers report progress through the [`ProgressReporter`] and return an
/// error instead of swallowing failures; errors are turned into retries by
/// the scheduler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job, progress: ProgressReporter) -> anyhow::Result<Value>;
}

/// Adapter that lets a plain async closure act as a [`JobHandler`]
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler
///
/// ```ignore
/// queue.register_handler("deploy", handler_fn(|job, progress| async move {
///     progress.report(50).await;
///     Ok(serde_json::json!({ "deployed": job.name }))
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, job: Job, progress: ProgressReporter) -> anyhow::Result<Value> {
        (self.0)(job, progress).await
    }
}

/// One handler per job type. Registering an existing type replaces it.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning `true` if it replaced an earlier one
    pub fn register(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(job_type.into(), handler)
            .is_some()
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(job_type)
            .cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.get(job_type).is_some()
    }

    /// Registered job types, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::job::JobCreationParams;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_lookup_and_overwrite() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("codegen").is_none());

        let first = registry.register(
            "codegen",
            Arc::new(handler_fn(|_job, _progress| async { Ok(json!(1)) })),
        );
        assert!(!first);
        let replaced = registry.register(
            "codegen",
            Arc::new(handler_fn(|_job, _progress| async { Ok(json!(2)) })),
        );
        assert!(replaced);
        assert_eq!(registry.types(), vec!["codegen".to_string()]);

        let job = Job::from_params(
            JobCreationParams::new("gen", "codegen"),
            &QueueConfig::default(),
        )
        .unwrap();
        let handler = registry.get("codegen").unwrap();
        let out = handler
            .handle(job.clone(), ProgressReporter::detached(job.id))
            .await
            .unwrap();
        assert_eq!(out, json!(2));
    }
}

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{LockConfig, RetryConfig};
use crate::job::{ExecutionId, FencingToken, JobId};
use crate::lock::LockHandle;
use crate::retry::RetryPredicate;

use super::schedule::Schedule;

/// Body of a scheduled job.
///
/// The runner only calls `run` while holding the job's lease. Handlers
/// doing long work should poll [`JobContext::is_held`] and stop once it
/// turns false; handlers writing to shared state should check
/// [`JobContext::is_fence_current`] (or pass the fencing token along)
/// before committing.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()>;
}

/// Per-attempt view handed to a [`JobHandler`].
#[derive(Clone, Debug)]
pub struct JobContext {
    pub job_id: JobId,
    pub execution_id: ExecutionId,
    /// 1-based attempt number within this execution.
    pub attempt: u32,
    pub fencing_token: FencingToken,
    pub payload: Value,
    lock: LockHandle,
}

impl JobContext {
    pub(crate) fn new(execution_id: ExecutionId, attempt: u32, payload: Value, lock: LockHandle) -> Self {
        Self {
            job_id: lock.job_id().clone(),
            execution_id,
            attempt,
            fencing_token: lock.fencing_token(),
            payload,
            lock,
        }
    }

    pub fn lock(&self) -> &LockHandle {
        &self.lock
    }

    pub fn is_held(&self) -> bool {
        self.lock.is_held()
    }

    pub async fn is_fence_current(&self) -> bool {
        self.lock.is_fence_current().await
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Wraps an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A job registered with the runner.
#[derive(Clone)]
pub struct JobDefinition {
    pub id: JobId,
    pub schedule: Arc<dyn Schedule>,
    pub handler: Arc<dyn JobHandler>,
    /// Overrides the runner's retry policy.
    pub retry: Option<RetryConfig>,
    /// Overrides the lock manager's configuration.
    pub lock: Option<LockConfig>,
    /// Circuit breaker guarding the job's external dependency.
    pub breaker: Option<String>,
    /// Handler errors for which this returns `false` fail the execution
    /// without further attempts. Unset, every handler error is retried.
    pub retry_if: Option<RetryPredicate<anyhow::Error>>,
    pub payload: Value,
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("id", &self.id)
            .field("schedule", &self.schedule)
            .field("retry", &self.retry)
            .field("lock", &self.lock)
            .field("breaker", &self.breaker)
            .field("retry_if", &self.retry_if.is_some())
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

impl JobDefinition {
    pub fn new(id: impl Into<JobId>, schedule: impl Schedule + 'static, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            id: id.into(),
            schedule: Arc::new(schedule),
            handler,
            retry: None,
            lock: None,
            breaker: None,
            retry_if: None,
            payload: Value::Null,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_breaker(mut self, breaker: impl Into<String>) -> Self {
        self.breaker = Some(breaker.into());
        self
    }

    /// Restricts retries to handler errors matching `predicate`.
    pub fn with_retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::backoff::BackoffKind;
use crate::circuit::{CircuitBreaker, CircuitBreakerError, CircuitBreakerRegistry};
use crate::config::{RetryConfig, RunnerConfig};
use crate::dead_letter::{DeadLetterEntry, DeadLetterId, DeadLetterQueue};
use crate::events::{EventPayload, SharedPublisher, WardenEvent};
use crate::job::{ExecutionId, FencingToken, InstanceId, JobExecution, JobId, JobStatus};
use crate::lock::{LockHandle, LockManager, panic_message};
use crate::retry::{RetryError, RetryOptions, with_retry};
use crate::telemetry;

use super::handler::{JobContext, JobDefinition, JobHandler};

/// Failure of a single handler attempt.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("{0:#}")]
    Failed(anyhow::Error),
    #[error("lease lost before attempt {attempt}")]
    LeaseLost { attempt: u32 },
}

/// Counters for one job.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct JobCounters {
    pub executions: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub skipped: u64,
    pub retries: u64,
}

impl JobCounters {
    fn record(&mut self, execution: &JobExecution) {
        self.executions += 1;
        match execution.status {
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Skipped => self.skipped += 1,
            JobStatus::Pending | JobStatus::Running => {}
        }
        if execution.dead_letter_id.is_some() {
            self.dead_lettered += 1;
        }
        self.retries += u64::from(execution.attempts.saturating_sub(1));
    }
}

/// Snapshot returned by [`JobRunner::stats`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunnerStats {
    pub totals: JobCounters,
    pub per_job: BTreeMap<JobId, JobCounters>,
    /// Jobs with an execution in flight on this instance, sorted.
    pub running: Vec<JobId>,
    pub registered_jobs: usize,
}

struct ScheduledJob {
    definition: JobDefinition,
    next_due: Mutex<Option<DateTime<Utc>>>,
}

impl ScheduledJob {
    fn new(definition: JobDefinition, now: DateTime<Utc>) -> Self {
        let next_due = definition.schedule.next_after(now);
        Self {
            definition,
            next_due: Mutex::new(next_due),
        }
    }

    /// Claims the current fire time if it has passed.
    fn take_if_due(&self, now: DateTime<Utc>) -> bool {
        let mut next_due = self.next_due.lock();
        match *next_due {
            Some(due) if due <= now => {
                *next_due = self.definition.schedule.next_after(now);
                true
            }
            _ => false,
        }
    }
}

pub(super) struct RunnerParts {
    pub config: RunnerConfig,
    pub retry: RetryConfig,
    pub locks: LockManager,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub dead_letters: Arc<dyn DeadLetterQueue>,
    pub events: SharedPublisher,
    pub jobs: Vec<JobDefinition>,
}

struct RunnerInner {
    config: RunnerConfig,
    retry: RetryConfig,
    locks: LockManager,
    breakers: Arc<CircuitBreakerRegistry>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    events: SharedPublisher,
    jobs: RwLock<BTreeMap<JobId, Arc<ScheduledJob>>>,
    running: Mutex<HashSet<JobId>>,
    permits: Semaphore,
    counters: Mutex<RunnerStats>,
    history: Mutex<VecDeque<JobExecution>>,
    shutdown: CancellationToken,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

/// Marks a job as in flight on this instance until dropped.
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<JobId>>,
    job_id: JobId,
}

impl<'a> RunningGuard<'a> {
    fn enter(running: &'a Mutex<HashSet<JobId>>, job_id: &JobId) -> Option<Self> {
        running.lock().insert(job_id.clone()).then(|| Self {
            running,
            job_id: job_id.clone(),
        })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.job_id);
    }
}

/// Runs registered jobs under their distributed lease.
///
/// Every process of a deployment runs its own `JobRunner` against the same
/// store; the lease decides which one executes a given fire time.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("instance_id", self.inner.locks.instance_id())
            .field("config", &self.inner.config)
            .field("jobs", &self.job_ids())
            .field("started", &self.inner.tick_task.lock().is_some())
            .field("shutdown", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl JobRunner {
    pub(super) fn from_parts(parts: RunnerParts) -> Self {
        let now = Utc::now();
        let jobs = parts
            .jobs
            .into_iter()
            .map(|definition| (definition.id.clone(), Arc::new(ScheduledJob::new(definition, now))))
            .collect();

        Self {
            inner: Arc::new(RunnerInner {
                permits: Semaphore::new(parts.config.max_concurrent_jobs),
                config: parts.config,
                retry: parts.retry,
                locks: parts.locks,
                breakers: parts.breakers,
                dead_letters: parts.dead_letters,
                events: parts.events,
                jobs: RwLock::new(jobs),
                running: Mutex::new(HashSet::new()),
                counters: Mutex::new(RunnerStats::default()),
                history: Mutex::new(VecDeque::new()),
                shutdown: CancellationToken::new(),
                tick_task: Mutex::new(None),
            }),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.inner.locks.instance_id()
    }

    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.inner.breakers
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterQueue> {
        &self.inner.dead_letters
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    /// Adds or replaces a job. Its first fire time is computed from now.
    pub fn register(&self, definition: JobDefinition) {
        let id = definition.id.clone();
        let job = Arc::new(ScheduledJob::new(definition, Utc::now()));
        if self.inner.jobs.write().insert(id.clone(), job).is_some() {
            tracing::info!(job_id = %id, "replaced job definition");
        } else {
            tracing::debug!(job_id = %id, "registered job");
        }
    }

    pub fn unregister(&self, job_id: &JobId) -> bool {
        self.inner.jobs.write().remove(job_id).is_some()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.inner.jobs.read().keys().cloned().collect()
    }

    pub fn next_due(&self, job_id: &JobId) -> Option<DateTime<Utc>> {
        self.inner.jobs.read().get(job_id).and_then(|job| *job.next_due.lock())
    }

    fn job(&self, job_id: &JobId) -> Option<Arc<ScheduledJob>> {
        self.inner.jobs.read().get(job_id).cloned()
    }

    /// Runs one job now, regardless of its schedule.
    ///
    /// # Errors
    ///
    /// Returns an error only if `job_id` is not registered. Every other
    /// outcome, including lock contention, is reported in the returned
    /// [`JobExecution`].
    pub async fn run_job(&self, job_id: &JobId) -> anyhow::Result<JobExecution> {
        let job = self
            .job(job_id)
            .ok_or_else(|| anyhow::anyhow!("job {job_id} is not registered"))?;
        let payload = job.definition.payload.clone();
        Ok(self.execute(&job.definition, payload).await)
    }

    /// Runs every job due at `now` concurrently and returns their
    /// executions. Each due fire time is claimed once per process.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<JobExecution> {
        let due: Vec<Arc<ScheduledJob>> = self
            .inner
            .jobs
            .read()
            .values()
            .filter(|job| job.take_if_due(now))
            .cloned()
            .collect();

        if due.is_empty() {
            return Vec::new();
        }
        tracing::trace!(due = due.len(), "running due jobs");

        join_all(
            due.iter()
                .map(|job| self.execute(&job.definition, job.definition.payload.clone())),
        )
        .await
    }

    /// Spawns the tick loop.
    ///
    /// # Errors
    ///
    /// Fails if the runner is already started or has been shut down.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut task = self.inner.tick_task.lock();
        if self.inner.shutdown.is_cancelled() {
            anyhow::bail!("job runner has been shut down");
        }
        if task.is_some() {
            anyhow::bail!("job runner already started");
        }

        let runner = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let interval = self.inner.config.tick_interval();
        let span = tracing::info_span!("warden.runner", instance_id = %self.instance_id());

        *task = Some(tokio::spawn(
            async move { Self::tick_loop(runner, shutdown, interval).await }.instrument(span),
        ));
        tracing::info!(
            instance_id = %self.instance_id(),
            tick_interval_ms = self.inner.config.tick_interval_ms,
            "job runner started"
        );
        Ok(())
    }

    async fn tick_loop(runner: Weak<RunnerInner>, shutdown: CancellationToken, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("tick loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(inner) = runner.upgrade() else { break };
                    let runner = JobRunner { inner };
                    // Long jobs must not delay other jobs' fire times; the
                    // running set keeps a job from overlapping itself.
                    tokio::spawn(async move {
                        runner.tick(Utc::now()).await;
                    }.in_current_span());
                }
            }
        }
    }

    /// Stops the tick loop, waits up to `shutdown_grace_ms` for in-flight
    /// executions, then releases every lease this instance still holds.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!(instance_id = %self.instance_id(), "shutting down job runner");
        self.inner.shutdown.cancel();

        let task = self.inner.tick_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!("tick loop task failed: {err}");
            }
        }

        let all_permits = u32::try_from(self.inner.config.max_concurrent_jobs).unwrap_or(u32::MAX);
        match tokio::time::timeout(
            self.inner.config.shutdown_grace(),
            self.inner.permits.acquire_many(all_permits),
        )
        .await
        {
            Ok(Ok(_permits)) => {}
            Ok(Err(err)) => tracing::warn!("failed to wait for in-flight jobs: {err}"),
            Err(_) => tracing::warn!(
                running = ?self.running(),
                "in-flight jobs did not finish within the shutdown grace period"
            ),
        }

        let released = self.inner.locks.release_all().await;
        tracing::info!(released, "job runner shutdown complete");
        Ok(())
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Runs a dead-lettered job once with the entry's payload.
    ///
    /// The entry is removed only once the replay succeeded or its failure
    /// was recorded as a new entry; a skipped or aborted replay leaves it
    /// in place.
    pub async fn replay(&self, entry_id: DeadLetterId) -> anyhow::Result<JobExecution> {
        let entry = self
            .inner
            .dead_letters
            .get(entry_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("dead letter entry {entry_id} not found"))?;
        let job = self
            .job(&entry.job_id)
            .ok_or_else(|| anyhow::anyhow!("job {} is not registered", entry.job_id))?;

        tracing::info!(
            job_id = %entry.job_id,
            entry_id = %entry_id,
            attempts = entry.attempts,
            "replaying dead-lettered job"
        );
        let execution = self.execute(&job.definition, entry.payload).await;

        let settled = execution.status == JobStatus::Succeeded || execution.dead_letter_id.is_some();
        if !settled {
            tracing::warn!(
                job_id = %entry.job_id,
                entry_id = %entry_id,
                status = execution.status.as_str(),
                "replay did not settle; keeping dead letter entry"
            );
            return Ok(execution);
        }

        if self.inner.dead_letters.remove(entry_id).await?.is_none() {
            tracing::debug!(entry_id = %entry_id, "dead letter entry was already removed");
        }
        Ok(execution)
    }

    pub fn stats(&self) -> RunnerStats {
        let mut stats = self.inner.counters.lock().clone();
        stats.running = self.running();
        stats.registered_jobs = self.inner.jobs.read().len();
        stats
    }

    /// Most recent executions, newest first, at most `limit`.
    pub fn recent_executions(&self, limit: usize) -> Vec<JobExecution> {
        self.inner.history.lock().iter().rev().take(limit).cloned().collect()
    }

    fn running(&self) -> Vec<JobId> {
        let mut running: Vec<JobId> = self.inner.running.lock().iter().cloned().collect();
        running.sort();
        running
    }

    async fn execute(&self, job: &JobDefinition, payload: Value) -> JobExecution {
        let mut execution = JobExecution::pending(job.id.clone());
        let span = telemetry::job_run_span(&job.id, execution.id.to_string());
        self.execute_inner(job, payload, &mut execution).instrument(span).await;
        self.record(&execution);
        execution
    }

    async fn execute_inner(&self, job: &JobDefinition, payload: Value, execution: &mut JobExecution) {
        let Some(_running) = RunningGuard::enter(&self.inner.running, &job.id) else {
            tracing::debug!(job_id = %job.id, "job already running on this instance");
            self.skip(execution);
            return;
        };

        let Ok(_permit) = self.inner.permits.acquire().await else {
            self.skip(execution);
            return;
        };
        if self.inner.shutdown.is_cancelled() {
            tracing::debug!(job_id = %job.id, "runner shutting down; not starting job");
            self.skip(execution);
            return;
        }

        let lock_config = job.lock.clone().unwrap_or_else(|| self.inner.locks.config().clone());
        let Some(lock) = self.inner.locks.acquire_with(&job.id, &lock_config).await else {
            self.skip(execution);
            return;
        };

        execution.status = JobStatus::Running;
        execution.fencing_token = Some(lock.fencing_token());
        self.emit(
            execution.id,
            EventPayload::JobStarted {
                job_id: job.id.clone(),
                execution_id: execution.id,
                fencing_token: lock.fencing_token(),
            },
        );

        let timing = telemetry::record_job_start(&job.id);
        let status = self.attempt_with_retries(job, &payload, &lock, execution).await;
        lock.release().await;

        let duration = telemetry::record_job_end(timing, status);
        execution.finish(status);
        if status == JobStatus::Succeeded {
            self.emit(
                execution.id,
                EventPayload::JobSucceeded {
                    job_id: job.id.clone(),
                    execution_id: execution.id,
                    attempts: execution.attempts,
                    duration_ms: duration.as_millis() as u64,
                },
            );
        }
    }

    async fn attempt_with_retries(
        &self,
        job: &JobDefinition,
        payload: &Value,
        lock: &LockHandle,
        execution: &mut JobExecution,
    ) -> JobStatus {
        let execution_id = execution.id;
        let attempts = Arc::new(AtomicU32::new(0));
        let first_failed_at: Arc<Mutex<Option<DateTime<Utc>>>> = Arc::new(Mutex::new(None));
        let breaker: Option<CircuitBreaker> = job
            .breaker
            .as_deref()
            .map(|name| self.inner.breakers.get_or_create(name));

        let events = self.inner.events.clone();
        let instance_id = self.instance_id().clone();
        let job_id = job.id.clone();
        let retryable = job.retry_if.clone();
        let options = RetryOptions::new(job.retry.clone().unwrap_or_else(|| self.inner.retry.clone()))
            .with_label(job.id.as_str())
            .with_cancellation(self.inner.shutdown.child_token())
            .retry_if(move |err: &AttemptError| match err {
                AttemptError::Failed(inner) => retryable.as_ref().is_none_or(|retry_if| retry_if(inner)),
                AttemptError::LeaseLost { .. } => false,
            })
            .on_retry(move |attempt, delay, err: &AttemptError| {
                let error = err.to_string();
                telemetry::record_retry(&job_id, attempt, delay, &error);
                publish(
                    events.as_ref(),
                    &instance_id,
                    execution_id,
                    EventPayload::JobRetrying {
                        job_id: job_id.clone(),
                        execution_id,
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error,
                    },
                );
            });

        let outcome = with_retry(
            |attempt| {
                attempts.store(attempt, Ordering::SeqCst);
                let ctx = JobContext::new(execution_id, attempt, payload.clone(), lock.clone());
                let handler = job.handler.clone();
                let breaker = breaker.clone();
                let first_failed_at = first_failed_at.clone();
                async move {
                    if !ctx.is_held() {
                        return Err(AttemptError::LeaseLost { attempt });
                    }
                    let result = match breaker {
                        Some(breaker) => breaker
                            .fire(|| run_handler(handler, ctx))
                            .await
                            .map_err(|err| match err {
                                CircuitBreakerError::Failed(inner) => inner,
                                other => anyhow::Error::new(other),
                            }),
                        None => run_handler(handler, ctx).await,
                    };
                    result.map_err(|err| {
                        first_failed_at.lock().get_or_insert_with(Utc::now);
                        AttemptError::Failed(err)
                    })
                }
            },
            &options,
        )
        .await;

        execution.attempts = attempts.load(Ordering::SeqCst);
        let err = match outcome {
            Ok(()) => return JobStatus::Succeeded,
            Err(err) => err,
        };

        let error_text = err
            .last_error()
            .map_or_else(|| err.to_string(), ToString::to_string);
        execution.error = Some(error_text.clone());

        // Exhausted retries and handler errors excluded from retrying are
        // permanent; a lost lease or a shutdown is not the job's failure.
        let permanent = match &err {
            RetryError::Exhausted { .. } => true,
            RetryError::Aborted { source, .. } => matches!(source, AttemptError::Failed(_)),
            RetryError::Cancelled { .. } => false,
        };
        if permanent {
            let attempts = err.attempts();
            let first_failed_at = first_failed_at.lock().unwrap_or_else(Utc::now);
            let entry = DeadLetterEntry::new(
                job.id.clone(),
                payload.clone(),
                error_text.clone(),
                attempts,
                first_failed_at,
                Utc::now(),
            )
            .with_fencing_token(lock.fencing_token())
            .with_execution(execution_id, self.instance_id().clone());
            execution.dead_letter_id = self.dead_letter(entry, lock.fencing_token()).await;
        } else {
            tracing::warn!(
                job_id = %job.id,
                attempts = execution.attempts,
                "job failed without retry: {error_text}"
            );
        }

        self.emit(
            execution_id,
            EventPayload::JobFailed {
                job_id: job.id.clone(),
                execution_id,
                attempts: execution.attempts,
                error: error_text,
            },
        );
        if let Some(entry_id) = execution.dead_letter_id {
            self.emit(
                execution_id,
                EventPayload::JobDeadLettered {
                    job_id: job.id.clone(),
                    execution_id,
                    entry_id,
                    attempts: execution.attempts,
                },
            );
        }
        JobStatus::Failed
    }

    /// Records an exhausted execution, retrying the write itself briefly.
    async fn dead_letter(&self, entry: DeadLetterEntry, fencing_token: FencingToken) -> Option<DeadLetterId> {
        let job_id = entry.job_id.clone();
        let attempts = entry.attempts;
        let error = entry.error.clone();
        let options = RetryOptions::new(
            RetryConfig::default()
                .with_max_retries(3)
                .with_strategy(BackoffKind::Exponential, 50)
                .with_max_delay_ms(1_000),
        )
        .with_label("dead_letter.record");

        let recorded = with_retry(
            |_| {
                let queue = self.inner.dead_letters.clone();
                let entry = entry.clone();
                async move { queue.record(entry).await }
            },
            &options,
        )
        .await;

        match recorded {
            Ok(entry_id) => {
                telemetry::record_dead_letter(&job_id, attempts, &error);
                Some(entry_id)
            }
            Err(err) => {
                tracing::error!(
                    job_id = %job_id,
                    fencing_token = fencing_token.value(),
                    "failed to record dead letter: {err}"
                );
                None
            }
        }
    }

    fn skip(&self, execution: &mut JobExecution) {
        execution.finish(JobStatus::Skipped);
        self.emit(
            execution.id,
            EventPayload::JobSkipped {
                job_id: execution.job_id.clone(),
                execution_id: execution.id,
            },
        );
    }

    fn record(&self, execution: &JobExecution) {
        {
            let mut stats = self.inner.counters.lock();
            stats.totals.record(execution);
            stats
                .per_job
                .entry(execution.job_id.clone())
                .or_default()
                .record(execution);
        }

        let mut history = self.inner.history.lock();
        history.push_back(execution.clone());
        while history.len() > self.inner.config.history_limit {
            history.pop_front();
        }
    }

    fn emit(&self, execution_id: ExecutionId, payload: EventPayload) {
        publish(self.inner.events.as_ref(), self.instance_id(), execution_id, payload);
    }
}

fn publish(
    publisher: &dyn crate::events::EventPublisher,
    instance_id: &InstanceId,
    execution_id: ExecutionId,
    payload: EventPayload,
) {
    let name = payload.name();
    let event = WardenEvent::correlated(instance_id.clone(), execution_id, payload);
    if let Err(err) = publisher.publish(event) {
        tracing::warn!(event = name, "failed to publish event: {err}");
    }
}

async fn run_handler(handler: Arc<dyn JobHandler>, ctx: JobContext) -> anyhow::Result<()> {
    match AssertUnwindSafe(handler.run(ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!("job handler panicked: {message}");
            Err(anyhow::anyhow!("job handler panicked: {message}"))
        }
    }
}

use std::fmt;
use std::sync::Arc;

use crate::circuit::CircuitBreakerRegistry;
use crate::config::{
    CircuitBreakerConfig, DeadLetterConfig, LockConfig, RetryConfig, RunnerConfig, WardenConfig,
};
use crate::dead_letter::{DeadLetterQueue, InMemoryDeadLetterQueue};
use crate::events::{SharedPublisher, noop_publisher};
use crate::job::InstanceId;
use crate::lock::LockManager;
use crate::store::KeyValueStore;

use super::handler::JobDefinition;
use super::runner::{JobRunner, RunnerParts};

/// Builder for constructing a [`JobRunner`] with explicit dependencies.
///
/// The store is the only required dependency. The dead letter queue
/// defaults to an [`InMemoryDeadLetterQueue`], events to a no-op
/// publisher, the instance id to [`InstanceId::generate`], and the breaker
/// registry to one sharing the runner's publisher.
///
/// # Example
///
/// ```ignore
/// use warden::*;
///
/// let runner = JobRunnerBuilder::from_config(config)
///     .with_store(store)
///     .with_events(bus)
///     .with_job(JobDefinition::new("daily-report", schedule, handler))
///     .build()?;
/// runner.start()?;
/// ```
#[derive(Default)]
pub struct JobRunnerBuilder {
    runner: RunnerConfig,
    retry: RetryConfig,
    lock: LockConfig,
    circuit: CircuitBreakerConfig,
    dead_letter: DeadLetterConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    dead_letters: Option<Arc<dyn DeadLetterQueue>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    events: Option<SharedPublisher>,
    instance_id: Option<InstanceId>,
    jobs: Vec<JobDefinition>,
}

impl fmt::Debug for JobRunnerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunnerBuilder")
            .field("runner", &self.runner)
            .field("retry", &self.retry)
            .field("lock", &self.lock)
            .field("circuit", &self.circuit)
            .field("dead_letter", &self.dead_letter)
            .field("store_set", &self.store.is_some())
            .field("dead_letters_set", &self.dead_letters.is_some())
            .field("breakers_set", &self.breakers.is_some())
            .field("events_set", &self.events.is_some())
            .field("instance_id", &self.instance_id)
            .field("jobs", &self.jobs.iter().map(|job| &job.id).collect::<Vec<_>>())
            .finish()
    }
}

impl JobRunnerBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder taking every configuration section from `config`.
    pub fn from_config(config: WardenConfig) -> Self {
        Self {
            runner: config.runner,
            retry: config.retry,
            lock: config.lock,
            circuit: config.circuit,
            dead_letter: config.dead_letter,
            ..Self::default()
        }
    }

    /// Set the key-value store backing the distributed locks.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the dead letter queue.
    pub fn with_dead_letters(mut self, dead_letters: Arc<dyn DeadLetterQueue>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Set the circuit breaker registry.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Set the event publisher.
    pub fn with_events(mut self, events: SharedPublisher) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the instance id used as lock owner prefix and event source.
    pub fn with_instance_id(mut self, instance_id: InstanceId) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn with_runner_config(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }

    /// Set the default retry policy for jobs without their own.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lock_config(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Set the configuration of breakers the registry creates on demand.
    /// Ignored when a registry is supplied.
    pub fn with_circuit_config(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.circuit = circuit;
        self
    }

    /// Set the retention of the default dead letter queue. Ignored when a
    /// queue is supplied.
    pub fn with_dead_letter_config(mut self, dead_letter: DeadLetterConfig) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    /// Register a job.
    pub fn with_job(mut self, job: JobDefinition) -> Self {
        self.jobs.push(job);
        self
    }

    /// Build the `JobRunner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is missing, a configuration section is
    /// invalid, or two jobs share an id.
    pub fn build(self) -> anyhow::Result<JobRunner> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;

        self.runner.validate()?;
        self.retry.validate()?;
        self.lock.validate()?;
        self.circuit.validate()?;
        self.dead_letter.validate()?;
        for job in &self.jobs {
            if let Some(retry) = &job.retry {
                retry.validate()?;
            }
            if let Some(lock) = &job.lock {
                lock.validate()?;
            }
        }

        let mut seen = std::collections::HashSet::new();
        if let Some(duplicate) = self.jobs.iter().find(|job| !seen.insert(&job.id)) {
            anyhow::bail!("job {} registered twice", duplicate.id);
        }

        let instance_id = self.instance_id.unwrap_or_default();
        let events = self.events.unwrap_or_else(noop_publisher);
        let dead_letters = self
            .dead_letters
            .unwrap_or_else(|| Arc::new(InMemoryDeadLetterQueue::new(self.dead_letter.clone())));
        let breakers = self.breakers.unwrap_or_else(|| {
            Arc::new(
                CircuitBreakerRegistry::new(self.circuit.clone())
                    .with_events(events.clone(), instance_id.clone()),
            )
        });
        let locks = LockManager::with_identity(store, self.lock, instance_id, events.clone());

        tracing::debug!(
            instance_id = %locks.instance_id(),
            jobs = self.jobs.len(),
            native_atomics = locks.store().atomic().is_some(),
            "built job runner"
        );

        Ok(JobRunner::from_parts(RunnerParts {
            config: self.runner,
            retry: self.retry,
            locks,
            breakers,
            dead_letters,
            events,
            jobs: self.jobs,
        }))
    }
}

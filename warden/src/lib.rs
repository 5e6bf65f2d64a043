//! Warden - resilient distributed execution of scheduled jobs.
//!
//! Several processes run the same job schedule against a shared key-value
//! store; warden makes sure each fire time is executed by exactly one of
//! them and that failures are retried, contained and recorded.
//!
//! # Core Concepts
//!
//! - **Locks**: The [`LockManager`] grants TTL leases on `lock:<job_id>`
//!   keys. Every acquisition mints a strictly increasing [`FencingToken`]
//!   so a holder whose lease expired can detect that it is stale.
//!
//! - **Stores**: The [`KeyValueStore`] trait abstracts the coordination
//!   backend. Stores that also implement [`AtomicLockStore`] get
//!   server-side compare-and-set; others use a weaker fallback.
//!
//! - **Retries**: [`with_retry`] re-runs a fallible operation according to
//!   a [`BackoffStrategy`], with optional jitter, predicate and
//!   cancellation.
//!
//! - **Circuit breakers**: [`CircuitBreaker`] stops calls to a failing
//!   dependency; [`CircuitBreakerRegistry`] shares breakers by name.
//!
//! - **Dead letters**: Executions that exhaust their retries are recorded
//!   in a [`DeadLetterQueue`] for inspection and replay.
//!
//! - **Runner**: The [`JobRunner`] ties everything together: it ticks
//!   schedules, takes the lease, runs the handler through the retry
//!   engine and breaker, dead-letters exhausted executions and emits
//!   lifecycle events.
//!
//! # Feature Flags
//!
//! - `redis` - Redis-backed store via [`persistence::RedisStore`]
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use warden::*;
//!
//! let runner = JobRunnerBuilder::from_config(WardenConfig::load(None)?)
//!     .with_store(Arc::new(MemoryStore::new()))
//!     .with_job(JobDefinition::new(
//!         "daily-report",
//!         DailySchedule::at(6, 0).expect("valid time"),
//!         handler_fn(|ctx| async move {
//!             tracing::info!(token = %ctx.fencing_token, "building report");
//!             Ok(())
//!         }),
//!     ))
//!     .build()?;
//! runner.start()?;
//! ```

/// Delay computation for retries and lock acquisition.
///
/// The `backoff` module provides the pure delay functions
/// ([`exponential_backoff`], [`linear_backoff`], [`fixed_delay`]),
/// [`apply_jitter`] and the [`BackoffStrategy`] that combines them.
pub mod backoff;

/// Circuit breakers and their registry.
pub mod circuit;

/// Configuration structures for every component.
///
/// The `config` module defines [`LockConfig`], [`RetryConfig`],
/// [`CircuitBreakerConfig`], [`DeadLetterConfig`], [`RunnerConfig`] and the
/// aggregate [`WardenConfig`], loadable from TOML and environment.
pub mod config;

/// Dead letter records, queries and statistics.
pub mod dead_letter;

/// Event publishing and subscription system.
///
/// The `events` module provides traits and types for lifecycle events:
/// - [`EventPublisher`] and [`EventSubscriber`] for pub/sub patterns
/// - [`WardenEvent`] and [`EventPayload`] for event data
/// - [`InProcEventBus`] for in-process event broadcasting
pub mod events;

/// Core identifiers and execution records.
///
/// The `job` module defines [`JobId`], [`InstanceId`], [`FencingToken`],
/// [`ExecutionId`], [`JobStatus`] and [`JobExecution`].
pub mod job;

/// Distributed lock manager.
///
/// The `lock` module provides [`LockManager`], [`LockHandle`] and
/// [`WithLockOutcome`].
pub mod lock;

#[cfg(feature = "metrics")]
/// Prometheus metrics for locks, jobs and breakers.
pub mod metrics;

#[cfg(feature = "redis")]
/// Redis persistence implementation.
///
/// The `persistence` module provides a Redis-backed store when the `redis`
/// feature is enabled.
pub mod persistence;

/// Generic retry engine.
pub mod retry;

/// Job runner, handlers and schedules.
///
/// The `runtime` module provides the [`JobRunner`] and everything it
/// needs:
/// - [`JobRunnerBuilder`] - validated construction
/// - [`JobHandler`] and [`JobContext`] - the job body and its view of the lease
/// - [`JobDefinition`] - a job with its schedule and policies
/// - [`Schedule`] with [`IntervalSchedule`], [`DailySchedule`] and [`ManualSchedule`]
/// - [`RunnerStats`] - execution counters
pub mod runtime;

/// Key-value store contract and the in-memory store.
pub mod store;

/// Tracing spans and `record_*` helpers.
pub mod telemetry;

pub use backoff::*;
pub use circuit::*;
pub use config::*;
pub use dead_letter::*;
pub use events::*;
pub use job::*;
pub use lock::{LockHandle, LockManager, WithLockOutcome};
pub use retry::*;
pub use runtime::*;
pub use store::*;

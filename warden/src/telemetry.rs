//! Tracing and telemetry instrumentation for warden.
//!
//! Span constructors and `record_*` helpers used by the lock manager, the
//! circuit breaker and the job runner. The helpers log through `tracing`
//! and, with the `metrics` feature, also update the Prometheus collectors
//! in [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use warden::telemetry::job_run_span;
//! use tracing::Instrument;
//!
//! runner.run_job(&job_id).instrument(job_run_span(&job_id, "manual")).await;
//! ```

use std::time::Duration;

use tracing::{Span, info_span};

use crate::circuit::CircuitState;
use crate::events::LockFailReason;
use crate::job::{FencingToken, JobStatus};

/// Span covering one `acquire` call, including its retries.
#[must_use]
pub fn lock_acquire_span(job_id: impl AsRef<str>) -> Span {
    info_span!("warden.lock.acquire", job_id = %job_id.as_ref())
}

/// Span covering one job execution, from locking to release.
#[must_use]
pub fn job_run_span(job_id: impl AsRef<str>, execution_id: impl AsRef<str>) -> Span {
    info_span!(
        "warden.job.run",
        job_id = %job_id.as_ref(),
        execution_id = %execution_id.as_ref(),
    )
}

/// Span covering a retried operation.
#[must_use]
pub fn retry_span(operation: impl AsRef<str>, max_attempts: u32) -> Span {
    info_span!(
        "warden.retry",
        operation = %operation.as_ref(),
        max_attempts = max_attempts,
    )
}

/// Span covering one call through a circuit breaker.
#[must_use]
pub fn circuit_fire_span(breaker: impl AsRef<str>) -> Span {
    info_span!("warden.circuit.fire", breaker = %breaker.as_ref())
}

pub fn record_lock_acquired(job_id: impl AsRef<str>, fencing_token: FencingToken, attempts: u32) {
    tracing::debug!(
        job_id = %job_id.as_ref(),
        fencing_token = fencing_token.value(),
        attempts = attempts,
        "lock acquired"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_lock_acquisition(job_id.as_ref(), "acquired");
}

/// Contention is expected in a multi-instance deployment and logs at debug;
/// store errors log at warn.
pub fn record_lock_failed(job_id: impl AsRef<str>, reason: LockFailReason, attempts: u32) {
    match reason {
        LockFailReason::StoreError => tracing::warn!(
            job_id = %job_id.as_ref(),
            reason = reason.as_str(),
            attempts = attempts,
            "lock not acquired"
        ),
        LockFailReason::Contended | LockFailReason::HeldLocally => tracing::debug!(
            job_id = %job_id.as_ref(),
            reason = reason.as_str(),
            attempts = attempts,
            "lock not acquired"
        ),
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_lock_acquisition(job_id.as_ref(), reason.as_str());
}

pub fn record_lock_lost(job_id: impl AsRef<str>, fencing_token: FencingToken) {
    tracing::warn!(
        job_id = %job_id.as_ref(),
        fencing_token = fencing_token.value(),
        "lease lost; holder must stop acting on job state"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_lock_lost(job_id.as_ref());
}

pub fn record_retry(job_id: impl AsRef<str>, attempt: u32, delay: Duration, error: &str) {
    tracing::info!(
        job_id = %job_id.as_ref(),
        attempt = attempt,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "job attempt failed; retrying"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_retry(job_id.as_ref());
}

pub fn record_job_completed(job_id: impl AsRef<str>, status: JobStatus, duration: Duration) {
    tracing::info!(
        job_id = %job_id.as_ref(),
        status = status.as_str(),
        duration_ms = duration.as_millis() as u64,
        "job finished"
    );

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_job_completed(job_id.as_ref(), status.as_str());
        crate::metrics::observe_job_duration(
            job_id.as_ref(),
            status.as_str(),
            duration.as_secs_f64(),
        );
    }
}

pub fn record_dead_letter(job_id: impl AsRef<str>, attempts: u32, error: &str) {
    tracing::error!(
        job_id = %job_id.as_ref(),
        attempts = attempts,
        error = %error,
        "job exhausted retries; dead-lettered"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_dead_letter(job_id.as_ref());
}

pub fn record_circuit_transition(breaker: impl AsRef<str>, from: CircuitState, to: CircuitState) {
    match to {
        CircuitState::Open => tracing::warn!(
            breaker = %breaker.as_ref(),
            from = from.as_str(),
            to = to.as_str(),
            "circuit breaker opened"
        ),
        CircuitState::HalfOpen | CircuitState::Closed => tracing::info!(
            breaker = %breaker.as_ref(),
            from = from.as_str(),
            to = to.as_str(),
            "circuit breaker state changed"
        ),
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_circuit_transition(breaker.as_ref(), to.as_str(), to.as_gauge());
}

pub fn record_circuit_rejected(breaker: impl AsRef<str>, state: CircuitState) {
    tracing::debug!(
        breaker = %breaker.as_ref(),
        state = state.as_str(),
        "call rejected by circuit breaker"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_circuit_rejection(breaker.as_ref());
}

/// Start timing a job execution.
pub fn record_job_start(job_id: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: tokio::time::Instant::now(),
    }
}

/// Finish timing a job execution and report its terminal status.
pub fn record_job_end(handle: JobTimingHandle, status: JobStatus) -> Duration {
    let duration = handle.elapsed();
    record_job_completed(&handle.job_id, status, duration);
    duration
}

/// Opaque handle returned by [`record_job_start`].
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: tokio::time::Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            assert_eq!(
                lock_acquire_span("daily-report").metadata().map(|m| m.name()),
                Some("warden.lock.acquire")
            );
            assert_eq!(
                job_run_span("daily-report", "exec-1").metadata().map(|m| m.name()),
                Some("warden.job.run")
            );
            assert_eq!(
                retry_span("dead_letter.record", 3).metadata().map(|m| m.name()),
                Some("warden.retry")
            );
            assert_eq!(
                circuit_fire_span("mailer").metadata().map(|m| m.name()),
                Some("warden.circuit.fire")
            );
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_timing_handle() {
        let handle = record_job_start("job-123");
        assert_eq!(handle.job_id(), "job-123");

        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(handle.elapsed() >= Duration::from_millis(5));

        let duration = record_job_end(handle, JobStatus::Succeeded);
        assert!(duration >= Duration::from_millis(5));
    }
}

//! Prometheus metrics instrumentation for warden.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `warden_lock_acquisitions_total` - Lock acquisition attempts by outcome
//! - `warden_lock_lost_total` - Leases lost while held
//! - `warden_jobs_completed_total` - Job executions by terminal status
//! - `warden_dead_letters_total` - Entries recorded in the dead letter queue
//! - `warden_retries_total` - Retried handler attempts
//! - `warden_circuit_transitions_total` - Breaker state transitions
//! - `warden_circuit_rejections_total` - Calls rejected by an open breaker
//!
//! ## Gauges
//! - `warden_circuit_state` - Current breaker state (0 closed, 1 half-open, 2 open)
//!
//! ## Histograms
//! - `warden_job_duration_seconds` - Job execution duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for warden metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels:
/// - `job_id`: The job identifier
/// - `outcome`: acquired, contended, store_error, held_locally
pub static LOCK_ACQUISITIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "warden_lock_acquisitions_total",
        "Lock acquisition attempts by outcome",
    );
    CounterVec::new(opts, &["job_id", "outcome"])
        .expect("warden_lock_acquisitions_total metric creation failed")
});

pub static LOCK_LOST_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("warden_lock_lost_total", "Leases lost while held");
    CounterVec::new(opts, &["job_id"]).expect("warden_lock_lost_total metric creation failed")
});

/// Labels:
/// - `job_id`: The job identifier
/// - `status`: succeeded, failed, skipped
pub static JOBS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "warden_jobs_completed_total",
        "Job executions by terminal status",
    );
    CounterVec::new(opts, &["job_id", "status"])
        .expect("warden_jobs_completed_total metric creation failed")
});

pub static DEAD_LETTERS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "warden_dead_letters_total",
        "Entries recorded in the dead letter queue",
    );
    CounterVec::new(opts, &["job_id"]).expect("warden_dead_letters_total metric creation failed")
});

pub static RETRIES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("warden_retries_total", "Retried handler attempts");
    CounterVec::new(opts, &["job_id"]).expect("warden_retries_total metric creation failed")
});

/// Labels:
/// - `breaker`: The breaker name
/// - `to`: closed, open, half_open
pub static CIRCUIT_TRANSITIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "warden_circuit_transitions_total",
        "Circuit breaker state transitions",
    );
    CounterVec::new(opts, &["breaker", "to"])
        .expect("warden_circuit_transitions_total metric creation failed")
});

pub static CIRCUIT_REJECTIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "warden_circuit_rejections_total",
        "Calls rejected without reaching the protected operation",
    );
    CounterVec::new(opts, &["breaker"])
        .expect("warden_circuit_rejections_total metric creation failed")
});

pub static CIRCUIT_STATE: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "warden_circuit_state",
        "Current breaker state (0 closed, 1 half-open, 2 open)",
    );
    GaugeVec::new(opts, &["breaker"]).expect("warden_circuit_state metric creation failed")
});

pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 18).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "warden_job_duration_seconds",
        "Job execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["job_id", "status"])
        .expect("warden_job_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry.
///
/// Idempotent; calling it multiple times is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(LOCK_ACQUISITIONS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(LOCK_LOST_TOTAL.clone()),
        Box::new(JOBS_COMPLETED_TOTAL.clone()),
        Box::new(DEAD_LETTERS_TOTAL.clone()),
        Box::new(RETRIES_TOTAL.clone()),
        Box::new(CIRCUIT_TRANSITIONS_TOTAL.clone()),
        Box::new(CIRCUIT_REJECTIONS_TOTAL.clone()),
        Box::new(CIRCUIT_STATE.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_lock_acquisition(job_id: &str, outcome: &str) {
    LOCK_ACQUISITIONS_TOTAL
        .with_label_values(&[job_id, outcome])
        .inc();
}

pub fn record_lock_lost(job_id: &str) {
    LOCK_LOST_TOTAL.with_label_values(&[job_id]).inc();
}

pub fn record_job_completed(job_id: &str, status: &str) {
    JOBS_COMPLETED_TOTAL
        .with_label_values(&[job_id, status])
        .inc();
}

pub fn record_dead_letter(job_id: &str) {
    DEAD_LETTERS_TOTAL.with_label_values(&[job_id]).inc();
}

pub fn record_retry(job_id: &str) {
    RETRIES_TOTAL.with_label_values(&[job_id]).inc();
}

pub fn record_circuit_transition(breaker: &str, to: &str, state_value: f64) {
    CIRCUIT_TRANSITIONS_TOTAL
        .with_label_values(&[breaker, to])
        .inc();
    CIRCUIT_STATE.with_label_values(&[breaker]).set(state_value);
}

pub fn record_circuit_rejection(breaker: &str) {
    CIRCUIT_REJECTIONS_TOTAL.with_label_values(&[breaker]).inc();
}

pub fn observe_job_duration(job_id: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[job_id, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should be a no-op");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_lock_acquisition("daily-report", "acquired");
        record_job_completed("daily-report", "succeeded");
        record_circuit_transition("mailer", "open", 2.0);
        observe_job_duration("daily-report", "succeeded", 0.5);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("warden_lock_acquisitions_total"));
        assert!(output.contains("warden_jobs_completed_total"));
        assert!(output.contains("warden_circuit_state"));
        assert!(output.contains("warden_job_duration_seconds"));
    }
}

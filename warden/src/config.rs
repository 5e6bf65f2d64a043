use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{BackoffKind, BackoffStrategy};

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Lease settings for the distributed lock manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease time-to-live in milliseconds.
    pub ttl_ms: u64,
    /// Extra acquisition attempts after the first one.
    pub retries: u32,
    /// Delay between acquisition attempts in milliseconds.
    pub retry_delay_ms: u64,
    /// Double the delay after every failed attempt.
    pub exponential_backoff: bool,
    /// Cap for the exponential delay in milliseconds.
    pub max_retry_delay_ms: u64,
    /// Auto-extension cadence in milliseconds; 0 disables it.
    pub auto_extend_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            retries: 0,
            retry_delay_ms: 100,
            exponential_backoff: false,
            max_retry_delay_ms: 5_000,
            auto_extend_ms: 0,
        }
    }
}

impl LockConfig {
    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn with_retries(mut self, retries: u32, retry_delay_ms: u64) -> Self {
        self.retries = retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn with_exponential_backoff(mut self, max_retry_delay_ms: u64) -> Self {
        self.exponential_backoff = true;
        self.max_retry_delay_ms = max_retry_delay_ms;
        self
    }

    pub fn with_auto_extend_ms(mut self, auto_extend_ms: u64) -> Self {
        self.auto_extend_ms = auto_extend_ms;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn auto_extend(&self) -> Option<Duration> {
        (self.auto_extend_ms > 0).then(|| Duration::from_millis(self.auto_extend_ms))
    }

    /// Delay before acquisition attempt `attempt + 1`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.retry_delay_ms);
        if self.exponential_backoff {
            BackoffStrategy::exponential(base, 2.0, Duration::from_millis(self.max_retry_delay_ms))
                .delay(attempt)
        } else {
            base
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_ms == 0 {
            return Err(invalid("lock.ttl_ms", "must be greater than zero"));
        }
        if self.auto_extend_ms > 0 && self.auto_extend_ms >= self.ttl_ms {
            return Err(invalid(
                "lock.auto_extend_ms",
                format!("must be shorter than ttl_ms ({})", self.ttl_ms),
            ));
        }
        if self.exponential_backoff && self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(invalid(
                "lock.max_retry_delay_ms",
                "must not be smaller than retry_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Retry policy for job handlers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffKind,
    /// Growth factor for the exponential strategy.
    pub factor: f64,
    /// Multiply each delay by a random factor in `[0.5, 1.5]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            strategy: BackoffKind::Exponential,
            factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffKind, base_delay_ms: u64) -> Self {
        self.strategy = strategy;
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn backoff(&self) -> BackoffStrategy {
        let base = Duration::from_millis(self.base_delay_ms);
        match self.strategy {
            BackoffKind::Exponential => BackoffStrategy::exponential(base, self.factor, self.max_delay()),
            BackoffKind::Linear => BackoffStrategy::linear(base, self.max_delay()),
            BackoffKind::Fixed => BackoffStrategy::fixed(base),
            BackoffKind::None => BackoffStrategy::none(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(invalid("retry.max_retries", "must allow at least one attempt"));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(invalid("retry.factor", "must be a finite value >= 1.0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(invalid("retry.max_delay_ms", "must not be smaller than base_delay_ms"));
        }
        Ok(())
    }
}

/// Thresholds for a circuit breaker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside `failure_window_ms` that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
    pub failure_window_ms: u64,
    pub call_timeout_ms: u64,
    /// Calls required since the last close before the circuit may open.
    pub volume_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 30_000,
            failure_window_ms: 60_000,
            call_timeout_ms: 10_000,
            volume_threshold: 10,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_thresholds(mut self, failure_threshold: u32, success_threshold: u32, volume_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold;
        self.success_threshold = success_threshold;
        self.volume_threshold = volume_threshold;
        self
    }

    pub fn with_reset_timeout_ms(mut self, reset_timeout_ms: u64) -> Self {
        self.reset_timeout_ms = reset_timeout_ms;
        self
    }

    pub fn with_call_timeout_ms(mut self, call_timeout_ms: u64) -> Self {
        self.call_timeout_ms = call_timeout_ms;
        self
    }

    pub fn with_failure_window_ms(mut self, failure_window_ms: u64) -> Self {
        self.failure_window_ms = failure_window_ms;
        self
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(invalid("circuit.failure_threshold", "must be greater than zero"));
        }
        if self.success_threshold == 0 {
            return Err(invalid("circuit.success_threshold", "must be greater than zero"));
        }
        if self.call_timeout_ms == 0 {
            return Err(invalid("circuit.call_timeout_ms", "must be greater than zero"));
        }
        if self.failure_window_ms == 0 {
            return Err(invalid("circuit.failure_window_ms", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Retention policy for the in-memory dead letter queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub retention_count: usize,
    /// Entries whose last failure is older than this are pruned; 0 keeps
    /// entries forever.
    pub retention_ttl_ms: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            retention_count: 10_000,
            retention_ttl_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

impl DeadLetterConfig {
    pub fn retention_ttl(&self) -> Option<Duration> {
        (self.retention_ttl_ms > 0).then(|| Duration::from_millis(self.retention_ttl_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention_count == 0 {
            return Err(invalid("dead_letter.retention_count", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Scheduling and lifecycle settings for the job runner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub tick_interval_ms: u64,
    pub max_concurrent_jobs: usize,
    /// Number of finished executions kept for inspection.
    pub history_limit: usize,
    pub shutdown_grace_ms: u64,
    pub event_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            max_concurrent_jobs: 16,
            history_limit: 256,
            shutdown_grace_ms: 30_000,
            event_capacity: 1_024,
        }
    }
}

impl RunnerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(invalid("runner.tick_interval_ms", "must be greater than zero"));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(invalid("runner.max_concurrent_jobs", "must be greater than zero"));
        }
        if self.event_capacity == 0 {
            return Err(invalid("runner.event_capacity", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Aggregate configuration for every component.
///
/// Loaded from an optional TOML file layered with `WARDEN__<SECTION>__<KEY>`
/// environment variables, e.g. `WARDEN__LOCK__TTL_MS=60000`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub lock: LockConfig,
    pub retry: RetryConfig,
    pub circuit: CircuitBreakerConfig,
    pub dead_letter: DeadLetterConfig,
    pub runner: RunnerConfig,
}

impl WardenConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let cfg: WardenConfig = builder
            .add_source(
                config::Environment::with_prefix("WARDEN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let cfg: WardenConfig = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.lock.validate()?;
        self.retry.validate()?;
        self.circuit.validate()?;
        self.dead_letter.validate()?;
        self.runner.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        WardenConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = WardenConfig::from_toml_str(
            r#"
            [lock]
            ttl_ms = 60000
            auto_extend_ms = 20000

            [retry]
            max_retries = 5
            strategy = "linear"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.lock.ttl_ms, 60_000);
        assert_eq!(cfg.lock.auto_extend(), Some(Duration::from_secs(20)));
        assert_eq!(cfg.lock.retries, LockConfig::default().retries);
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.strategy, BackoffKind::Linear);
        assert_eq!(cfg.circuit, CircuitBreakerConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = WardenConfig::from_toml_str("[lock]\nttl_ms = 1000\nauto_extend_ms = 1000\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "lock.auto_extend_ms", .. }));

        let err = WardenConfig::from_toml_str("[retry]\nmax_retries = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "retry.max_retries", .. }));

        let err = WardenConfig::from_toml_str("[runner]\nmax_concurrent_jobs = 0\n").unwrap_err();
        assert!(err.to_string().contains("runner.max_concurrent_jobs"));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("warden-config-{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(&path, "[circuit]\nfailure_threshold = 3\nvolume_threshold = 3\n").unwrap();

        let cfg = WardenConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.circuit.failure_threshold, 3);
        assert_eq!(cfg.circuit.volume_threshold, 3);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = WardenConfig::load(Some(Path::new("/nonexistent/warden.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_lock_retry_delay() {
        let fixed = LockConfig::default().with_retries(3, 100);
        assert_eq!(fixed.retry_delay(0), Duration::from_millis(100));
        assert_eq!(fixed.retry_delay(3), Duration::from_millis(100));

        let exp = fixed.with_exponential_backoff(300);
        assert_eq!(exp.retry_delay(0), Duration::from_millis(100));
        assert_eq!(exp.retry_delay(1), Duration::from_millis(200));
        assert_eq!(exp.retry_delay(2), Duration::from_millis(300));
    }

    #[test]
    fn test_retry_backoff_selection() {
        let cfg = RetryConfig::default()
            .with_strategy(BackoffKind::Fixed, 250)
            .with_jitter(false);
        assert_eq!(cfg.backoff().delay(4), Duration::from_millis(250));

        let cfg = RetryConfig::default().with_strategy(BackoffKind::None, 250);
        assert_eq!(cfg.backoff().delay(0), Duration::ZERO);
    }
}

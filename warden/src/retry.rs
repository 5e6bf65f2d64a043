//! Retry engine with pluggable backoff.
//!
//! [`with_retry`] knows nothing about locks or schedules. Wrap
//! [`CircuitBreaker::fire`](crate::circuit::CircuitBreaker::fire) inside the
//! retried operation to combine the two.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::backoff::apply_jitter;
use crate::config::RetryConfig;
use crate::telemetry;

pub type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Called before each backoff sleep with the failed attempt (1-based), the
/// delay about to be slept and the error.
pub type RetryObserver<E> = Arc<dyn Fn(u32, Duration, &E) + Send + Sync>;

pub struct RetryOptions<E> {
    pub config: RetryConfig,
    label: String,
    retry_if: Option<RetryPredicate<E>>,
    on_retry: Option<RetryObserver<E>>,
    cancel: Option<CancellationToken>,
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            label: self.label.clone(),
            retry_if: self.retry_if.clone(),
            on_retry: self.on_retry.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("config", &self.config)
            .field("label", &self.label)
            .field("retry_if", &self.retry_if.is_some())
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl<E> RetryOptions<E> {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            label: "operation".to_string(),
            retry_if: None,
            on_retry: None,
            cancel: None,
        }
    }

    /// Name recorded on the `warden.retry` span.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Only errors for which `predicate` returns `true` are retried. By
    /// default every error is.
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    pub fn on_retry<O>(mut self, observer: O) -> Self
    where
        O: Fn(u32, Duration, &E) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    /// Cancelling `token` interrupts a pending backoff sleep.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_retryable(&self, err: &E) -> bool {
        self.retry_if.as_ref().is_none_or(|predicate| predicate(err))
    }

    /// Delay after the 0-based failed `attempt`, jittered and capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.config.backoff().delay(attempt);
        let delay = if self.config.jitter {
            apply_jitter(delay)
        } else {
            delay
        };
        delay.min(self.config.max_delay())
    }
}

/// Terminal outcome of [`with_retry`].
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every permitted attempt failed.
    Exhausted { attempts: u32, source: E },
    /// The predicate declared the error not retryable.
    Aborted { attempts: u32, source: E },
    /// Cancellation arrived during a backoff sleep.
    Cancelled { attempts: u32, last_error: Option<E> },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Aborted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    /// The last error returned by the operation.
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Aborted { source, .. } => Some(source),
            RetryError::Cancelled { last_error, .. } => last_error,
        }
    }

    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Aborted { source, .. } => Some(source),
            RetryError::Cancelled { last_error, .. } => last_error.as_ref(),
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, source } => {
                write!(f, "retries exhausted after {attempts} attempts: {source}")
            }
            RetryError::Aborted { attempts, source } => {
                write!(f, "non-retryable error on attempt {attempts}: {source}")
            }
            RetryError::Cancelled { attempts, .. } => {
                write!(f, "retry cancelled after {attempts} attempts")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Calls `op(attempt)` (1-based) until it succeeds, fails with a
/// non-retryable error, or `config.max_retries` attempts have been made.
pub async fn with_retry<T, E, F, Fut>(mut op: F, options: &RetryOptions<E>) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = options.config.max_retries.max(1);
    let span = telemetry::retry_span(&options.label, max_attempts);

    async move {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(attempt, "succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !options.is_retryable(&err) {
                tracing::warn!(attempt, "non-retryable error: {err}");
                return Err(RetryError::Aborted {
                    attempts: attempt,
                    source: err,
                });
            }

            if attempt >= max_attempts {
                tracing::warn!(attempt, "retries exhausted: {err}");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = options.delay_for(attempt - 1);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "attempt failed: {err}");
            if let Some(observer) = &options.on_retry {
                observer(attempt, delay, &err);
            }

            match &options.cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::debug!(attempt, "retry cancelled during backoff");
                            return Err(RetryError::Cancelled {
                                attempts: attempt,
                                last_error: Some(err),
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffKind;
    use crate::circuit::{CircuitBreaker, CircuitBreakerError};
    use crate::config::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn options(max_retries: u32) -> RetryOptions<anyhow::Error> {
        RetryOptions::new(
            RetryConfig::default()
                .with_max_retries(max_retries)
                .with_strategy(BackoffKind::Exponential, 100)
                .with_jitter(false),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let started = Instant::now();
        let result = with_retry(
            |attempt| async move {
                if attempt < 3 {
                    Err(anyhow::anyhow!("transient {attempt}"))
                } else {
                    Ok(attempt)
                }
            },
            &options(5),
        )
        .await
        .unwrap();

        assert_eq!(result, 3);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts_and_last_error() {
        let calls = AtomicU32::new(0);
        let err = with_retry(
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(anyhow::anyhow!("failure {attempt}")) }
            },
            &options(3),
        )
        .await
        .unwrap_err();

        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("failure 3"));
        assert_eq!(err.into_source().unwrap().to_string(), "failure 3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_aborts_non_retryable() {
        let opts = options(5).retry_if(|err: &anyhow::Error| !err.to_string().contains("fatal"));
        let err = with_retry(
            |_| async { Err::<(), _>(anyhow::anyhow!("fatal: bad input")) },
            &opts,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RetryError::Aborted { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        let opts = RetryOptions::new(
            RetryConfig::default()
                .with_max_retries(5)
                .with_strategy(BackoffKind::Fixed, 60_000)
                .with_jitter(false),
        )
        .with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let err = with_retry(|_| async { Err::<(), _>(anyhow::anyhow!("down")) }, &opts)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, RetryError::Cancelled { attempts: 1, .. }));
        assert!(err.last_error().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_each_retry() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let opts = options(3).on_retry(move |attempt, delay, _err: &anyhow::Error| {
            sink.lock().push((attempt, delay));
        });

        let _ = with_retry(|_| async { Err::<(), _>(anyhow::anyhow!("x")) }, &opts).await;

        assert_eq!(
            *seen.lock(),
            vec![
                (1, Duration::from_millis(100)),
                (2, Duration::from_millis(200)),
            ]
        );
    }

    #[test]
    fn test_delay_is_capped() {
        let opts: RetryOptions<anyhow::Error> = RetryOptions::new(
            RetryConfig::default()
                .with_strategy(BackoffKind::Linear, 1_000)
                .with_max_delay_ms(1_500),
        );
        for attempt in 0..10 {
            assert!(opts.delay_for(attempt) <= Duration::from_millis(1_500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_composes_with_circuit_breaker() {
        let breaker = CircuitBreaker::new(
            "flaky",
            CircuitBreakerConfig::default().with_thresholds(2, 1, 2),
        );
        let calls = AtomicU32::new(0);

        let opts = RetryOptions::new(
            RetryConfig::default()
                .with_max_retries(4)
                .with_strategy(BackoffKind::Fixed, 10)
                .with_jitter(false),
        );

        let err = with_retry(
            |_| {
                breaker.fire(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("unavailable"))
                })
            },
            &opts,
        )
        .await
        .unwrap_err();

        // The breaker opens after two failures; later attempts never reach
        // the dependency.
        assert_eq!(err.attempts(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            err.into_source(),
            Some(CircuitBreakerError::Open { .. })
        ));
    }
}

//! Delay functions for retries and lock acquisition.
//!
//! Every function takes the 0-based attempt number and returns the wait
//! before the next attempt. [`BackoffStrategy`] selects one of them from
//! configuration.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Lower bound of the multiplicative jitter range.
pub const JITTER_MIN_FACTOR: f64 = 0.5;
/// Upper bound of the multiplicative jitter range.
pub const JITTER_MAX_FACTOR: f64 = 1.5;

/// Returns `base` for every attempt.
pub fn fixed_delay(base: Duration) -> Duration {
    base
}

/// Computes `base * (attempt + 1)` for the 0-based `attempt`.
///
/// Saturates at [`Duration::MAX`] rather than overflowing.
pub fn linear_backoff(base: Duration, attempt: u32) -> Duration {
    base.checked_mul(attempt.saturating_add(1))
        .unwrap_or(Duration::MAX)
}

/// Computes `min(base * factor^attempt, cap)` for the 0-based `attempt`.
///
/// Any non-finite or overflowing intermediate clamps to `cap`, as does a
/// `factor` below 1.0 that would otherwise be rejected upstream.
pub fn exponential_backoff(base: Duration, factor: f64, cap: Duration, attempt: u32) -> Duration {
    let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
    let scaled_nanos = (base.as_nanos() as f64) * factor.powi(exp);

    if !scaled_nanos.is_finite() || scaled_nanos < 0.0 || scaled_nanos >= cap.as_nanos() as f64 {
        return cap;
    }

    Duration::from_nanos(scaled_nanos.round() as u64).min(cap)
}

/// Always zero.
pub fn no_delay() -> Duration {
    Duration::ZERO
}

/// Multiplies `delay` by a uniformly random factor in `[0.5, 1.5]`.
pub fn apply_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::rng().random_range(JITTER_MIN_FACTOR..=JITTER_MAX_FACTOR);
    delay.mul_f64(factor)
}

/// Selects one of the backoff functions.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Linear,
    Fixed,
    None,
}

impl BackoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffKind::Exponential => "exponential",
            BackoffKind::Linear => "linear",
            BackoffKind::Fixed => "fixed",
            BackoffKind::None => "none",
        }
    }
}

/// A fully parameterised backoff strategy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffStrategy {
    pub kind: BackoffKind,
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
}

impl BackoffStrategy {
    pub fn exponential(base: Duration, factor: f64, cap: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base,
            factor,
            cap,
        }
    }

    pub fn linear(base: Duration, cap: Duration) -> Self {
        Self {
            kind: BackoffKind::Linear,
            base,
            factor: 1.0,
            cap,
        }
    }

    pub fn fixed(base: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base,
            factor: 1.0,
            cap: base,
        }
    }

    pub fn none() -> Self {
        Self {
            kind: BackoffKind::None,
            base: Duration::ZERO,
            factor: 1.0,
            cap: Duration::ZERO,
        }
    }

    /// Delay before retrying after the 0-based `attempt` failed.
    ///
    /// The result never exceeds `cap` for the linear and exponential kinds.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.kind {
            BackoffKind::Exponential => exponential_backoff(self.base, self.factor, self.cap, attempt),
            BackoffKind::Linear => linear_backoff(self.base, attempt).min(self.cap),
            BackoffKind::Fixed => fixed_delay(self.base),
            BackoffKind::None => no_delay(),
        }
    }
}

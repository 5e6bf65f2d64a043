//! Circuit breaker for calls to unreliable dependencies.
//!
//! Three states: `Closed` (calls flow), `Open` (calls fail fast) and
//! `HalfOpen` (a bounded number of probe calls test recovery). A breaker is
//! cheap to clone; clones share state.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::CircuitBreakerConfig;
use crate::events::{EventPayload, SharedPublisher, emit, noop_publisher};
use crate::job::InstanceId;
use crate::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding used for the state gauge.
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    /// The breaker rejected the call without running it.
    #[error("circuit breaker {breaker} is open")]
    Open { breaker: String },
    #[error("call through circuit breaker {breaker} timed out after {timeout:?}")]
    Timeout { breaker: String, timeout: Duration },
    /// The protected operation returned an error.
    #[error(transparent)]
    Failed(anyhow::Error),
}

impl CircuitBreakerError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }
}

/// Decides whether an error counts against the breaker. Returning `false`
/// treats the call as successful.
pub type ErrorFilter = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Point-in-time view of a breaker for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    /// Failures inside the sliding window.
    pub recent_failures: usize,
    /// Calls completed since the breaker last closed.
    pub total_calls: u64,
    pub lifetime_calls: u64,
    pub lifetime_failures: u64,
    pub rejections: u64,
    pub timeouts: u64,
    pub failure_rate: f64,
    pub ms_since_state_change: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Lifetime {
    calls: u64,
    successes: u64,
    failures: u64,
    rejections: u64,
    timeouts: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    consecutive_successes: u32,
    consecutive_failures: u32,
    total_calls: u64,
    half_open_in_flight: u32,
    last_state_change: Instant,
    opened_at: Option<Instant>,
    epoch: u64,
    reset_timer: Option<CancellationToken>,
    lifetime: Lifetime,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            consecutive_successes: 0,
            consecutive_failures: 0,
            total_calls: 0,
            half_open_in_flight: 0,
            last_state_change: now,
            opened_at: None,
            epoch: 0,
            reset_timer: None,
            lifetime: Lifetime::default(),
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// A state change to announce once the state lock is released.
struct Transition {
    from: CircuitState,
    to: CircuitState,
    /// Set when the breaker entered `Open` and needs a reset timer.
    timer: Option<CancellationToken>,
}

struct BreakerInner {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    error_filter: Option<ErrorFilter>,
    events: SharedPublisher,
    instance_id: InstanceId,
}

impl BreakerInner {
    fn transition(&self, st: &mut BreakerState, to: CircuitState, now: Instant) -> Option<Transition> {
        let from = st.state;
        if from == to {
            return None;
        }

        st.state = to;
        st.last_state_change = now;
        st.epoch += 1;
        st.half_open_in_flight = 0;
        if let Some(timer) = st.reset_timer.take() {
            timer.cancel();
        }

        let mut timer = None;
        match to {
            CircuitState::Open => {
                st.opened_at = Some(now);
                st.consecutive_successes = 0;
                let token = CancellationToken::new();
                st.reset_timer = Some(token.clone());
                timer = Some(token);
            }
            CircuitState::HalfOpen => {
                st.opened_at = None;
                st.consecutive_successes = 0;
                st.consecutive_failures = 0;
            }
            CircuitState::Closed => {
                st.opened_at = None;
                st.failures.clear();
                st.total_calls = 0;
                st.consecutive_failures = 0;
            }
        }

        Some(Transition { from, to, timer })
    }

    /// Moves an expired `Open` breaker to `HalfOpen`.
    fn refresh(&self, st: &mut BreakerState, now: Instant) -> Option<Transition> {
        match (st.state, st.opened_at) {
            (CircuitState::Open, Some(opened_at))
                if now.saturating_duration_since(opened_at) >= self.config.reset_timeout() =>
            {
                self.transition(st, CircuitState::HalfOpen, now)
            }
            _ => None,
        }
    }
}

/// Ticket for one admitted call. An unsettled probe (the caller's future
/// was dropped mid-call) returns its half-open slot on drop.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    epoch: u64,
    settled: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.release_probe(self.epoch);
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state.lock().state)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::builder(name).with_config(config).build()
    }

    pub fn builder(name: impl Into<String>) -> CircuitBreakerBuilder {
        CircuitBreakerBuilder {
            name: name.into(),
            config: CircuitBreakerConfig::default(),
            error_filter: None,
            events: None,
            instance_id: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Current state. An open breaker whose reset timeout elapsed reports
    /// (and becomes) `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut st = self.inner.state.lock();
            let transition = self.inner.refresh(&mut st, Instant::now());
            (st.state, transition)
        };
        self.announce(transition);
        state
    }

    /// Runs `op` through the breaker.
    ///
    /// Open breakers reject without calling `op`. Admitted calls race
    /// against `call_timeout`; a timeout counts as a failure and the
    /// operation's future is dropped.
    pub async fn fire<T, F, Fut>(&self, op: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let span = telemetry::circuit_fire_span(&self.inner.name);
        async move {
            let mut admission = self.admit()?;
            let timeout = self.inner.config.call_timeout();

            match tokio::time::timeout(timeout, op()).await {
                Ok(Ok(value)) => {
                    self.settle(&mut admission, true, false);
                    Ok(value)
                }
                Ok(Err(err)) => {
                    let counts = self.inner.error_filter.as_ref().is_none_or(|filter| filter(&err));
                    self.settle(&mut admission, !counts, false);
                    Err(CircuitBreakerError::Failed(err))
                }
                Err(_) => {
                    self.settle(&mut admission, false, true);
                    Err(CircuitBreakerError::Timeout {
                        breaker: self.inner.name.clone(),
                        timeout,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Forces the breaker open. The usual reset timeout still applies.
    pub fn trip_open(&self) {
        let transition = {
            let mut st = self.inner.state.lock();
            self.inner.transition(&mut st, CircuitState::Open, Instant::now())
        };
        self.announce(transition);
    }

    /// Forces the breaker closed and clears its counters.
    pub fn reset(&self) {
        let transition = {
            let mut st = self.inner.state.lock();
            let transition = self.inner.transition(&mut st, CircuitState::Closed, Instant::now());
            st.failures.clear();
            st.total_calls = 0;
            st.consecutive_failures = 0;
            st.consecutive_successes = 0;
            transition
        };
        self.announce(transition);
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let (snapshot, transition) = {
            let mut st = self.inner.state.lock();
            let transition = self.inner.refresh(&mut st, now);
            st.prune(now, self.inner.config.failure_window());
            let failure_rate = if st.lifetime.calls == 0 {
                0.0
            } else {
                st.lifetime.failures as f64 / st.lifetime.calls as f64
            };
            let snapshot = CircuitSnapshot {
                name: self.inner.name.clone(),
                state: st.state,
                consecutive_successes: st.consecutive_successes,
                consecutive_failures: st.consecutive_failures,
                recent_failures: st.failures.len(),
                total_calls: st.total_calls,
                lifetime_calls: st.lifetime.calls,
                lifetime_failures: st.lifetime.failures,
                rejections: st.lifetime.rejections,
                timeouts: st.lifetime.timeouts,
                failure_rate,
                ms_since_state_change: now.saturating_duration_since(st.last_state_change).as_millis()
                    as u64,
            };
            (snapshot, transition)
        };
        self.announce(transition);
        snapshot
    }

    fn admit(&self) -> Result<Admission<'_>, CircuitBreakerError> {
        let (admitted, transition) = {
            let mut st = self.inner.state.lock();
            let transition = self.inner.refresh(&mut st, Instant::now());
            let admitted = match st.state {
                CircuitState::Closed => Ok(Admission {
                    breaker: self,
                    probe: false,
                    epoch: st.epoch,
                    settled: false,
                }),
                CircuitState::HalfOpen if st.half_open_in_flight < self.inner.config.success_threshold => {
                    st.half_open_in_flight += 1;
                    Ok(Admission {
                        breaker: self,
                        probe: true,
                        epoch: st.epoch,
                        settled: false,
                    })
                }
                state => {
                    st.lifetime.rejections += 1;
                    Err(state)
                }
            };
            (admitted, transition)
        };
        self.announce(transition);

        admitted.map_err(|state| {
            telemetry::record_circuit_rejected(&self.inner.name, state);
            emit(
                self.inner.events.as_ref(),
                &self.inner.instance_id,
                EventPayload::CircuitRejected {
                    breaker: self.inner.name.clone(),
                    state,
                },
            );
            CircuitBreakerError::Open {
                breaker: self.inner.name.clone(),
            }
        })
    }

    fn settle(&self, admission: &mut Admission<'_>, success: bool, timed_out: bool) {
        admission.settled = true;
        let now = Instant::now();
        let config = &self.inner.config;

        let transition = {
            let mut st = self.inner.state.lock();
            let current_probe = admission.probe && admission.epoch == st.epoch;
            if current_probe {
                st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
            }
            st.lifetime.calls += 1;

            if st.state == CircuitState::HalfOpen && !current_probe {
                // Admitted before this half-open period; only probes decide it.
                if success {
                    st.lifetime.successes += 1;
                } else {
                    st.lifetime.failures += 1;
                    if timed_out {
                        st.lifetime.timeouts += 1;
                    }
                }
                None
            } else if success {
                st.total_calls += 1;
                st.lifetime.successes += 1;
                st.consecutive_successes = st.consecutive_successes.saturating_add(1);
                st.consecutive_failures = 0;
                if st.state == CircuitState::HalfOpen && st.consecutive_successes >= config.success_threshold {
                    self.inner.transition(&mut st, CircuitState::Closed, now)
                } else {
                    None
                }
            } else {
                st.total_calls += 1;
                st.lifetime.failures += 1;
                if timed_out {
                    st.lifetime.timeouts += 1;
                }
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                st.consecutive_successes = 0;
                st.failures.push_back(now);
                st.prune(now, config.failure_window());

                match st.state {
                    CircuitState::HalfOpen => self.inner.transition(&mut st, CircuitState::Open, now),
                    CircuitState::Closed
                        if st.total_calls >= u64::from(config.volume_threshold)
                            && st.failures.len() >= config.failure_threshold as usize =>
                    {
                        self.inner.transition(&mut st, CircuitState::Open, now)
                    }
                    _ => None,
                }
            }
        };
        self.announce(transition);
    }

    fn release_probe(&self, epoch: u64) {
        let mut st = self.inner.state.lock();
        if epoch == st.epoch {
            st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
        }
    }

    fn announce(&self, transition: Option<Transition>) {
        let Some(Transition { from, to, timer }) = transition else {
            return;
        };

        telemetry::record_circuit_transition(&self.inner.name, from, to);
        emit(
            self.inner.events.as_ref(),
            &self.inner.instance_id,
            EventPayload::CircuitStateChanged {
                breaker: self.inner.name.clone(),
                from,
                to,
            },
        );

        if let Some(cancel) = timer {
            self.schedule_half_open(cancel);
        }
    }

    /// Moves the breaker to `HalfOpen` once the reset timeout elapses, even
    /// if nobody calls it. Without a runtime the transition happens lazily.
    fn schedule_half_open(&self, cancel: CancellationToken) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak: Weak<BreakerInner> = Arc::downgrade(&self.inner);
        let delay = self.inner.config.reset_timeout();

        handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(inner) = weak.upgrade() {
                        CircuitBreaker { inner }.state();
                    }
                }
            }
        });
    }
}

pub struct CircuitBreakerBuilder {
    name: String,
    config: CircuitBreakerConfig,
    error_filter: Option<ErrorFilter>,
    events: Option<SharedPublisher>,
    instance_id: Option<InstanceId>,
}

impl CircuitBreakerBuilder {
    pub fn with_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Only errors for which `filter` returns `true` count as failures.
    pub fn with_error_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.error_filter = Some(Arc::new(filter));
        self
    }

    pub fn with_events(mut self, events: SharedPublisher, instance_id: InstanceId) -> Self {
        self.events = Some(events);
        self.instance_id = Some(instance_id);
        self
    }

    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker {
            inner: Arc::new(BreakerInner {
                name: self.name,
                config: self.config,
                state: Mutex::new(BreakerState::new(Instant::now())),
                error_filter: self.error_filter,
                events: self.events.unwrap_or_else(noop_publisher),
                instance_id: self.instance_id.unwrap_or_default(),
            }),
        }
    }
}

/// Named breakers shared across the process.
///
/// Built once and passed around by `Arc`; breakers are created on first
/// use with the registry's default configuration.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
    events: SharedPublisher,
    instance_id: InstanceId,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.names())
            .field("default_config", &self.default_config)
            .finish()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
            events: noop_publisher(),
            instance_id: InstanceId::default(),
        }
    }

    pub fn with_events(mut self, events: SharedPublisher, instance_id: InstanceId) -> Self {
        self.events = events;
        self.instance_id = instance_id;
        self
    }

    pub fn get_or_create(&self, name: &str) -> CircuitBreaker {
        if let Some(breaker) = self.breakers.read().get(name) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                CircuitBreaker::builder(name)
                    .with_config(self.default_config.clone())
                    .with_events(self.events.clone(), self.instance_id.clone())
                    .build()
            })
            .clone()
    }

    /// Adds a breaker with custom settings, replacing any existing one of
    /// the same name.
    pub fn register(&self, breaker: CircuitBreaker) {
        self.breakers
            .write()
            .insert(breaker.name().to_string(), breaker);
    }

    /// A builder pre-wired with the registry's events and default config.
    pub fn builder(&self, name: &str) -> CircuitBreakerBuilder {
        CircuitBreaker::builder(name)
            .with_config(self.default_config.clone())
            .with_events(self.events.clone(), self.instance_id.clone())
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<CircuitBreaker> = self.breakers.read().values().cloned().collect();
        let mut snapshots: Vec<CircuitSnapshot> = breakers.iter().map(CircuitBreaker::snapshot).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Returns `false` if no breaker has that name.
    pub fn trip_open(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.trip_open();
                true
            }
            None => false,
        }
    }

    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        let breakers: Vec<CircuitBreaker> = self.breakers.read().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventSubscriber, InProcEventBus};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_thresholds(3, 2, 3)
            .with_reset_timeout_ms(1_000)
            .with_call_timeout_ms(100)
    }

    async fn fail(breaker: &CircuitBreaker) -> CircuitBreakerError {
        breaker
            .fire(|| async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .await
            .unwrap_err()
    }

    async fn succeed(breaker: &CircuitBreaker) {
        breaker.fire(|| async { Ok(()) }).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_state_machine() {
        let breaker = CircuitBreaker::new("mailer", config());

        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, CircuitBreakerError::Failed(_)));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let called = AtomicBool::new(false);
        let err = breaker
            .fire(|| async {
                called.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.is_rejection());
        assert!(!called.load(Ordering::SeqCst));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.total_calls, 0);
        assert_eq!(snapshot.recent_failures, 0);
        assert_eq!(snapshot.rejections, 1);
        assert_eq!(snapshot.lifetime_calls, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_threshold_gates_opening() {
        let cfg = config().with_thresholds(2, 1, 5);
        let breaker = CircuitBreaker::new("db", cfg);

        for _ in 0..4 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_are_forgotten() {
        let cfg = config().with_thresholds(3, 1, 1).with_failure_window_ms(500);
        let breaker = CircuitBreaker::new("db", cfg);

        fail(&breaker).await;
        fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(600)).await;
        fail(&breaker).await;

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().recent_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cfg = config().with_thresholds(1, 1, 1);
        let breaker = CircuitBreaker::new("slow", cfg);

        let err = breaker
            .fire(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CircuitBreakerError::Timeout { .. }));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_filter_ignores_expected_errors() {
        let breaker = CircuitBreaker::builder("api")
            .with_config(config().with_thresholds(1, 1, 1))
            .with_error_filter(|err| !err.to_string().contains("404"))
            .build();

        for _ in 0..5 {
            let err = breaker
                .fire(|| async { Err::<(), _>(anyhow::anyhow!("404 not found")) })
                .await
                .unwrap_err();
            assert!(matches!(err, CircuitBreakerError::Failed(_)));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_probes() {
        let cfg = config().with_thresholds(1, 1, 1).with_call_timeout_ms(10_000);
        let breaker = CircuitBreaker::new("probe", cfg);
        breaker.trip_open();
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let probe = breaker.clone();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            probe
                .fire(|| async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
                .await
        });
        started_rx.await.unwrap();

        let err = breaker.fire(|| async { Ok(()) }).await.unwrap_err();
        assert!(err.is_rejection());

        handle.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_admitted_before_half_open_do_not_settle_it() {
        let cfg = config().with_thresholds(1, 1, 1).with_call_timeout_ms(10_000);
        let breaker = CircuitBreaker::new("slow", cfg);

        let mut slow_calls = Vec::new();
        for succeeds in [true, false] {
            let slow = breaker.clone();
            let (started_tx, started_rx) = tokio::sync::oneshot::channel();
            slow_calls.push(tokio::spawn(async move {
                slow.fire(|| async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_millis(1_500)).await;
                    if succeeds { Ok(()) } else { Err(anyhow::anyhow!("late failure")) }
                })
                .await
            }));
            started_rx.await.unwrap();
        }

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        for call in slow_calls {
            let _ = call.await.unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().lifetime_calls, 3);

        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_timer_moves_to_half_open_without_calls() {
        let bus = Arc::new(InProcEventBus::new(16));
        let mut rx = bus.subscribe();
        let breaker = CircuitBreaker::builder("timer")
            .with_config(config())
            .with_events(bus.clone(), InstanceId::new("test"))
            .build();

        breaker.trip_open();

        let seen = tokio::time::timeout(Duration::from_secs(5), async {
            let mut seen = Vec::new();
            while let Ok(event) = rx.recv().await {
                if let EventPayload::CircuitStateChanged { to, .. } = event.payload {
                    seen.push(to);
                    if to == CircuitState::HalfOpen {
                        break;
                    }
                }
            }
            seen
        })
        .await
        .unwrap();

        assert_eq!(seen, vec![CircuitState::Open, CircuitState::HalfOpen]);
    }

    #[tokio::test]
    async fn test_rejections_emit_events() {
        let bus = Arc::new(InProcEventBus::new(16));
        let mut rx = bus.subscribe();
        let breaker = CircuitBreaker::builder("reject")
            .with_config(config().with_reset_timeout_ms(60_000))
            .with_events(bus.clone(), InstanceId::new("test"))
            .build();
        breaker.trip_open();
        let _ = breaker.fire(|| async { Ok(()) }).await;

        let mut rejected = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.payload, EventPayload::CircuitRejected { .. }) {
                rejected = true;
            }
        }
        assert!(rejected);
    }

    #[tokio::test]
    async fn test_registry_operations() {
        let registry = CircuitBreakerRegistry::new(config());
        let a = registry.get_or_create("a");
        let again = registry.get_or_create("a");
        registry.get_or_create("b");

        a.trip_open();
        assert_eq!(again.state(), CircuitState::Open);
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].state, CircuitState::Open);

        assert!(registry.trip_open("b"));
        assert!(!registry.trip_open("missing"));
        registry.reset_all();
        assert_eq!(registry.get("a").unwrap().state(), CircuitState::Closed);
        assert_eq!(registry.get("b").unwrap().state(), CircuitState::Closed);
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_reset_clears_counters() {
        let calls = AtomicU32::new(0);
        let breaker = CircuitBreaker::new("r", config());
        for _ in 0..2 {
            let _ = breaker
                .fire(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("x"))
                })
                .await;
        }
        breaker.reset();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.recent_failures, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

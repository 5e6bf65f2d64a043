use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use warden::{ExecutionId, FencingToken, JobContext, JobHandler, JobId};

/// What a [`ScriptedHandler`] does on one call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Fail(String),
    Panic(String),
}

#[derive(Clone, Debug)]
pub struct CallRecord {
    pub job_id: JobId,
    pub execution_id: ExecutionId,
    pub attempt: u32,
    pub fencing_token: FencingToken,
    /// Whether the lease was held when the call started.
    pub held: bool,
}

/// Job handler that plays back a script of outcomes and records every call.
///
/// Once the script is exhausted every call returns the fallback outcome.
#[derive(Clone)]
pub struct ScriptedHandler {
    calls: Arc<Mutex<Vec<CallRecord>>>,
    script: Arc<Mutex<VecDeque<Outcome>>>,
    fallback: Arc<Mutex<Outcome>>,
    delay: Option<Duration>,
}

impl ScriptedHandler {
    pub fn always_ok() -> Self {
        Self::with_fallback(Outcome::Succeed)
    }

    pub fn always_fail(message: impl Into<String>) -> Self {
        Self::with_fallback(Outcome::Fail(message.into()))
    }

    /// Fails `times` calls, then succeeds.
    pub fn fail_times(times: usize, message: impl Into<String>) -> Self {
        let message = message.into();
        let handler = Self::always_ok();
        handler
            .script
            .lock()
            .extend(std::iter::repeat_n(Outcome::Fail(message), times));
        handler
    }

    pub fn with_fallback(fallback: Outcome) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(fallback)),
            delay: None,
        }
    }

    /// Sleep for `delay` on every call before producing the outcome.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Append `outcome` to the script.
    pub fn then(self, outcome: Outcome) -> Self {
        self.script.lock().push_back(outcome);
        self
    }

    pub fn set_fallback(&self, outcome: Outcome) {
        *self.fallback.lock() = outcome;
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn fencing_tokens(&self) -> Vec<FencingToken> {
        self.calls.lock().iter().map(|call| call.fencing_token).collect()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(actual, expected, "Expected {expected} handler calls, got {actual}");
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn next_outcome(&self) -> Outcome {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone())
    }
}

impl Default for ScriptedHandler {
    fn default() -> Self {
        Self::always_ok()
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        self.calls.lock().push(CallRecord {
            job_id: ctx.job_id.clone(),
            execution_id: ctx.execution_id,
            attempt: ctx.attempt,
            fencing_token: ctx.fencing_token,
            held: ctx.is_held(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_outcome() {
            Outcome::Succeed => Ok(()),
            Outcome::Fail(message) => Err(anyhow::anyhow!(message)),
            Outcome::Panic(message) => panic!("{message}"),
        }
    }
}

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DeadLetterConfig;
use crate::job::{ExecutionId, FencingToken, InstanceId, JobId};

/// Unique identifier of a dead-letter entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(pub Uuid);

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadLetterId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for DeadLetterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Record of a job execution that exhausted its retries.
///
/// Entries are never mutated after they are recorded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub job_id: JobId,
    /// Payload the job ran with, replayed verbatim.
    pub payload: serde_json::Value,
    /// Error returned by the final attempt.
    pub error: String,
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    /// Token of the lease the final attempt ran under.
    pub fencing_token: Option<FencingToken>,
    pub execution_id: Option<ExecutionId>,
    pub instance_id: Option<InstanceId>,
}

impl DeadLetterEntry {
    pub fn new(
        job_id: JobId,
        payload: serde_json::Value,
        error: impl Into<String>,
        attempts: u32,
        first_failed_at: DateTime<Utc>,
        last_failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeadLetterId::new(),
            job_id,
            payload,
            error: error.into(),
            attempts,
            first_failed_at,
            last_failed_at,
            fencing_token: None,
            execution_id: None,
            instance_id: None,
        }
    }

    pub fn with_fencing_token(mut self, token: FencingToken) -> Self {
        self.fencing_token = Some(token);
        self
    }

    pub fn with_execution(mut self, execution_id: ExecutionId, instance_id: InstanceId) -> Self {
        self.execution_id = Some(execution_id);
        self.instance_id = Some(instance_id);
        self
    }
}

/// Selects entries for [`DeadLetterQueue::query`]. Time bounds apply to
/// `last_failed_at` and are inclusive.
#[derive(Clone, Debug, Default)]
pub struct DeadLetterFilter {
    pub job_id: Option<JobId>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl DeadLetterFilter {
    pub fn for_job(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.job_id.as_ref().is_none_or(|id| *id == entry.job_id)
            && self.since.is_none_or(|since| entry.last_failed_at >= since)
            && self.until.is_none_or(|until| entry.last_failed_at <= until)
    }
}

/// Entry counts by age of the last failure.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct AgeBuckets {
    pub under_hour: usize,
    pub under_day: usize,
    pub under_week: usize,
    pub older: usize,
}

impl AgeBuckets {
    fn add(&mut self, age: Duration) {
        if age < Duration::hours(1) {
            self.under_hour += 1;
        } else if age < Duration::days(1) {
            self.under_day += 1;
        } else if age < Duration::days(7) {
            self.under_week += 1;
        } else {
            self.older += 1;
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub by_job: BTreeMap<JobId, usize>,
    pub by_age: AgeBuckets,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl DeadLetterStats {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a DeadLetterEntry>, now: DateTime<Utc>) -> Self {
        let mut stats = DeadLetterStats::default();
        for entry in entries {
            stats.total += 1;
            *stats.by_job.entry(entry.job_id.clone()).or_insert(0) += 1;
            stats.by_age.add(now - entry.last_failed_at);
            stats.oldest = Some(stats.oldest.map_or(entry.last_failed_at, |t| t.min(entry.last_failed_at)));
            stats.newest = Some(stats.newest.map_or(entry.last_failed_at, |t| t.max(entry.last_failed_at)));
        }
        stats
    }
}

/// Storage for retry-exhausted executions.
///
/// Recording a failure and recovering from it are separate concerns: the
/// queue never retries anything itself. Replay goes through the job runner.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn record(&self, entry: DeadLetterEntry) -> anyhow::Result<DeadLetterId>;

    /// Matching entries, newest first.
    async fn query(&self, filter: &DeadLetterFilter) -> anyhow::Result<Vec<DeadLetterEntry>>;

    async fn stats(&self) -> anyhow::Result<DeadLetterStats>;

    async fn get(&self, id: DeadLetterId) -> anyhow::Result<Option<DeadLetterEntry>>;

    /// Removes and returns an entry.
    async fn remove(&self, id: DeadLetterId) -> anyhow::Result<Option<DeadLetterEntry>>;

    async fn len(&self) -> anyhow::Result<usize>;
}

/// Bounded in-process dead letter queue.
///
/// Retention is enforced when entries are written: entries older than
/// `retention_ttl_ms` are dropped, then the oldest entries beyond
/// `retention_count`.
#[derive(Debug)]
pub struct InMemoryDeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    config: DeadLetterConfig,
}

impl Default for InMemoryDeadLetterQueue {
    fn default() -> Self {
        Self::new(DeadLetterConfig::default())
    }
}

impl InMemoryDeadLetterQueue {
    pub fn new(config: DeadLetterConfig) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            config,
        }
    }

    fn prune(&self, entries: &mut VecDeque<DeadLetterEntry>, now: DateTime<Utc>) -> usize {
        let before = entries.len();
        if let Some(ttl) = self.config.retention_ttl() {
            entries.retain(|entry| {
                (now - entry.last_failed_at)
                    .to_std()
                    .map_or(true, |age| age <= ttl)
            });
        }
        while entries.len() > self.config.retention_count.max(1) {
            entries.pop_front();
        }
        before - entries.len()
    }
}

#[async_trait]
impl DeadLetterQueue for InMemoryDeadLetterQueue {
    async fn record(&self, entry: DeadLetterEntry) -> anyhow::Result<DeadLetterId> {
        let id = entry.id;
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        let pruned = self.prune(&mut entries, Utc::now());
        if pruned > 0 {
            tracing::debug!(pruned, retained = entries.len(), "pruned dead letter entries");
        }
        Ok(id)
    }

    async fn query(&self, filter: &DeadLetterFilter) -> anyhow::Result<Vec<DeadLetterEntry>> {
        let entries = self.entries.lock();
        let mut matching: Vec<&DeadLetterEntry> = entries.iter().rev().filter(|e| filter.matches(e)).collect();
        // Stable sort keeps newer insertions first among equal timestamps.
        matching.sort_by(|a, b| b.last_failed_at.cmp(&a.last_failed_at));
        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn stats(&self) -> anyhow::Result<DeadLetterStats> {
        let entries = self.entries.lock();
        Ok(DeadLetterStats::from_entries(entries.iter(), Utc::now()))
    }

    async fn get(&self, id: DeadLetterId) -> anyhow::Result<Option<DeadLetterEntry>> {
        Ok(self.entries.lock().iter().find(|e| e.id == id).cloned())
    }

    async fn remove(&self, id: DeadLetterId) -> anyhow::Result<Option<DeadLetterEntry>> {
        let mut entries = self.entries.lock();
        Ok(entries
            .iter()
            .position(|e| e.id == id)
            .and_then(|index| entries.remove(index)))
    }

    async fn len(&self) -> anyhow::Result<usize> {
        Ok(self.entries.lock().len())
    }
}

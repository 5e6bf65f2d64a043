//! Key-value store contract used for cross-process coordination.
//!
//! The lock manager only needs `get`/`set`/`delete`; stores that can run
//! compare-and-set logic server side additionally expose
//! [`AtomicLockStore`] through [`KeyValueStore::atomic`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::job::FencingToken;

/// Minimal async key-value contract.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Writes `value`, replacing any previous value. `ttl = None` persists
    /// the key until it is deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    async fn exists(&self, key: &str) -> anyhow::Result<bool>;

    /// Native atomic lock operations, when the backend supports them.
    fn atomic(&self) -> Option<&dyn AtomicLockStore> {
        None
    }
}

/// Result of an atomic acquisition attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockGrant {
    /// The key was absent or expired and now belongs to the caller. A new
    /// fencing token was minted.
    Acquired(FencingToken),
    /// The caller already owned the key; its TTL was reset and the current
    /// token is reported unchanged.
    Refreshed(FencingToken),
    /// Someone else owns the key.
    Held,
}

impl LockGrant {
    pub fn fencing_token(&self) -> Option<FencingToken> {
        match self {
            LockGrant::Acquired(token) | LockGrant::Refreshed(token) => Some(*token),
            LockGrant::Held => None,
        }
    }

    pub fn is_acquired(&self) -> bool {
        !matches!(self, LockGrant::Held)
    }
}

/// Server-side atomic lock primitives.
#[async_trait]
pub trait AtomicLockStore: Send + Sync {
    /// Sets `key` to `owner` with `ttl` if it is absent, expired or already
    /// owned by `owner`. A fresh acquisition increments `fence_key`.
    async fn acquire_lock(
        &self,
        key: &str,
        fence_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> anyhow::Result<LockGrant>;

    /// Resets the TTL only if `key` is still owned by `owner`.
    async fn extend_lock(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Deletes `key` only if it is still owned by `owner`.
    async fn release_lock(&self, key: &str, owner: &str) -> anyhow::Result<bool>;
}

/// Parses a stored fencing counter. Missing keys read as token 0.
pub fn parse_fence(raw: Option<&str>) -> anyhow::Result<FencingToken> {
    match raw {
        None => Ok(FencingToken(0)),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(FencingToken)
            .map_err(|err| anyhow::anyhow!("corrupt fencing counter {raw:?}: {err}")),
    }
}

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process store for single-node deployments and tests.
///
/// TTLs follow `tokio::time`, so they respect paused test clocks. Native
/// atomics can be switched off to exercise the get/set fallback path.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    native_atomics: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            native_atomics: true,
        }
    }

    /// A store that only offers the plain key-value contract.
    pub fn without_atomics() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            native_atomics: false,
        }
    }

    /// Remaining time to live of `key`, if it is live and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key, Instant::now()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()> {
        let now = Instant::now();
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key, Instant::now()).is_some())
    }

    fn atomic(&self) -> Option<&dyn AtomicLockStore> {
        if self.native_atomics {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl AtomicLockStore for MemoryStore {
    async fn acquire_lock(
        &self,
        key: &str,
        fence_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> anyhow::Result<LockGrant> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let current = Self::live_value(&mut entries, key, now);
        let fence = parse_fence(Self::live_value(&mut entries, fence_key, now).as_deref())?;

        let grant = match current {
            Some(holder) if holder != owner => return Ok(LockGrant::Held),
            Some(_) => LockGrant::Refreshed(fence),
            None => {
                let next = fence.next();
                entries.insert(
                    fence_key.to_string(),
                    Entry {
                        value: next.to_string(),
                        expires_at: None,
                    },
                );
                LockGrant::Acquired(next)
            }
        };

        entries.insert(
            key.to_string(),
            Entry {
                value: owner.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(grant)
    }

    async fn extend_lock(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.value == owner => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, key: &str, owner: &str) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) && entry.value == owner => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_get_with_ttl() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_millis(101)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_reports_removal() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_atomic_acquire_mints_tokens_only_on_fresh_acquisition() {
        let store = MemoryStore::new();
        let atomic = store.atomic().unwrap();
        let ttl = Duration::from_secs(1);

        let first = atomic.acquire_lock("lock:a", "fence:a", "one", ttl).await.unwrap();
        assert_eq!(first, LockGrant::Acquired(FencingToken(1)));

        let again = atomic.acquire_lock("lock:a", "fence:a", "one", ttl).await.unwrap();
        assert_eq!(again, LockGrant::Refreshed(FencingToken(1)));

        let other = atomic.acquire_lock("lock:a", "fence:a", "two", ttl).await.unwrap();
        assert_eq!(other, LockGrant::Held);
        assert!(!other.is_acquired());

        assert!(atomic.release_lock("lock:a", "one").await.unwrap());
        let second = atomic.acquire_lock("lock:a", "fence:a", "two", ttl).await.unwrap();
        assert_eq!(second.fencing_token(), Some(FencingToken(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_atomic_acquire_after_expiry() {
        let store = MemoryStore::new();
        let atomic = store.atomic().unwrap();
        let ttl = Duration::from_millis(50);

        atomic.acquire_lock("lock:a", "fence:a", "one", ttl).await.unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;

        assert!(!atomic.extend_lock("lock:a", "one", ttl).await.unwrap());
        let grant = atomic.acquire_lock("lock:a", "fence:a", "two", ttl).await.unwrap();
        assert_eq!(grant, LockGrant::Acquired(FencingToken(2)));
    }

    #[tokio::test]
    async fn test_release_requires_owner() {
        let store = MemoryStore::new();
        let atomic = store.atomic().unwrap();
        atomic
            .acquire_lock("lock:a", "fence:a", "one", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!atomic.release_lock("lock:a", "two").await.unwrap());
        assert!(store.exists("lock:a").await.unwrap());
    }

    #[test]
    fn test_without_atomics() {
        assert!(MemoryStore::without_atomics().atomic().is_none());
    }

    #[test]
    fn test_parse_fence() {
        assert_eq!(parse_fence(None).unwrap(), FencingToken(0));
        assert_eq!(parse_fence(Some("42")).unwrap(), FencingToken(42));
        assert!(parse_fence(Some("nope")).is_err());
    }
}

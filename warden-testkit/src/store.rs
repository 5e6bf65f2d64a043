use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use warden::{AtomicLockStore, KeyValueStore, LockGrant, MemoryStore};

/// Store wrapper that injects failures and latency.
///
/// Faults apply to every operation, including the atomic lock operations
/// of the wrapped store.
pub struct FaultyStore {
    inner: Arc<dyn KeyValueStore>,
    failing: AtomicBool,
    fail_next: AtomicUsize,
    hide_atomics: bool,
    latency: Option<Duration>,
    operations: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
            hide_atomics: false,
            latency: None,
            operations: AtomicUsize::new(0),
        }
    }

    /// Wraps a fresh [`MemoryStore`].
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Report no native atomics, forcing the fallback lock path.
    pub fn without_atomics(mut self) -> Self {
        self.hide_atomics = true;
        self
    }

    /// Sleep before every operation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail every operation until turned off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `count` operations.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &Arc<dyn KeyValueStore> {
        &self.inner
    }

    async fn check(&self, op: &str) -> anyhow::Result<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("injected store fault during {op}");
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            anyhow::bail!("injected store fault during {op}");
        }
        Ok(())
    }

    fn inner_atomic(&self) -> anyhow::Result<&dyn AtomicLockStore> {
        self.inner
            .atomic()
            .ok_or_else(|| anyhow::anyhow!("wrapped store has no atomic operations"))
    }
}

#[async_trait]
impl KeyValueStore for FaultyStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.check("get").await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()> {
        self.check("set").await?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        self.check("delete").await?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        self.check("exists").await?;
        self.inner.exists(key).await
    }

    fn atomic(&self) -> Option<&dyn AtomicLockStore> {
        if self.hide_atomics || self.inner.atomic().is_none() {
            None
        } else {
            Some(self)
        }
    }
}

#[async_trait]
impl AtomicLockStore for FaultyStore {
    async fn acquire_lock(
        &self,
        key: &str,
        fence_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> anyhow::Result<LockGrant> {
        self.check("acquire_lock").await?;
        self.inner_atomic()?.acquire_lock(key, fence_key, owner, ttl).await
    }

    async fn extend_lock(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool> {
        self.check("extend_lock").await?;
        self.inner_atomic()?.extend_lock(key, owner, ttl).await
    }

    async fn release_lock(&self, key: &str, owner: &str) -> anyhow::Result<bool> {
        self.check("release_lock").await?;
        self.inner_atomic()?.release_lock(key, owner).await
    }
}

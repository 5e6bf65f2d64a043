use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;

use crate::job::FencingToken;
use crate::store::{AtomicLockStore, KeyValueStore, LockGrant};

const ACQUIRE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return {1, redis.call('INCR', KEYS[2])}
end
if current == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return {2, tonumber(redis.call('GET', KEYS[2]) or '0')}
end
return {0, 0}
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed store with server-side atomic lock operations.
///
/// Acquire, extend and release run as Lua scripts, so ownership checks and
/// writes cannot interleave with other clients. The fencing counter is a
/// plain `INCR` key.
///
/// The scripts touch both `lock:<job>` and `fence:<job>`; on Redis Cluster
/// use a key prefix containing a hash tag (e.g. `{warden}:`) so both keys
/// map to the same slot.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    acquire: Script,
    extend: Script,
    release: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).with_context(|| format!("invalid redis url {url}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: String::new(),
            acquire: Script::new(ACQUIRE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    /// Namespace every key under `prefix`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX rejects zero.
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("redis GET {key} failed"))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .with_context(|| format!("redis SET {key} failed"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("redis DEL {key} failed"))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("EXISTS")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("redis EXISTS {key} failed"))?;
        Ok(count > 0)
    }

    fn atomic(&self) -> Option<&dyn AtomicLockStore> {
        Some(self)
    }
}

#[async_trait]
impl AtomicLockStore for RedisStore {
    async fn acquire_lock(
        &self,
        key: &str,
        fence_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> anyhow::Result<LockGrant> {
        let mut conn = self.conn.clone();
        let (outcome, token): (i64, i64) = self
            .acquire
            .key(self.key(key))
            .key(self.key(fence_key))
            .arg(owner)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("redis acquire script failed for {key}"))?;

        let token = FencingToken(u64::try_from(token).context("negative fencing token")?);
        match outcome {
            1 => Ok(LockGrant::Acquired(token)),
            2 => Ok(LockGrant::Refreshed(token)),
            0 => Ok(LockGrant::Held),
            other => Err(anyhow::anyhow!("unexpected acquire script result: {other}")),
        }
    }

    async fn extend_lock(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend
            .key(self.key(key))
            .arg(owner)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("redis extend script failed for {key}"))?;
        Ok(extended == 1)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release
            .key(self.key(key))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("redis release script failed for {key}"))?;
        Ok(released == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(ttl_millis(Duration::MAX), u64::MAX);
    }
}

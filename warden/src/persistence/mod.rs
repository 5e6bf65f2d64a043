/// Redis-backed key-value store for distributed locks.
///
/// This module provides `RedisStore`, an implementation of both
/// [`KeyValueStore`](crate::store::KeyValueStore) and
/// [`AtomicLockStore`](crate::store::AtomicLockStore) that runs lock
/// acquisition, extension and release as server-side Lua scripts.
pub mod redis_store;

pub use redis_store::RedisStore;

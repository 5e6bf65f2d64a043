//! Benchmarks for lock manager operations using criterion.
//!
//! These benchmarks measure the lock hot paths against the in-memory store:
//! - Acquire + release through native atomics
//! - Acquire + release through the get/set fallback
//! - Contended acquire (lock held elsewhere)
//! - Lease extension

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tokio::runtime::Runtime;
use warden::{JobId, KeyValueStore, LockConfig, LockManager, MemoryStore};

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

/// Benchmark: Acquire then release one lease.
///
/// Compares the native atomic path with the fallback path.
fn bench_acquire_release(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("acquire_release");
    group.sample_size(100);

    for (name, store) in [
        ("native", Arc::new(MemoryStore::new())),
        ("fallback", Arc::new(MemoryStore::without_atomics())),
    ] {
        let locks = LockManager::new(store as Arc<dyn KeyValueStore>, LockConfig::default());
        let job = JobId::from("bench-job");

        group.bench_with_input(BenchmarkId::new("memory", name), &job, |b, job| {
            b.to_async(&rt).iter(|| async {
                let handle = locks.acquire(job).await.expect("lock should be free");
                assert!(handle.release().await);
            });
        });
    }

    group.finish();
}

/// Benchmark: Acquire attempt against a lease held by another instance.
fn bench_contended_acquire(c: &mut Criterion) {
    let rt = create_runtime();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let holder = LockManager::new(store.clone(), LockConfig::default());
    let contender = LockManager::new(store, LockConfig::default());
    let job = JobId::from("bench-job");
    let _held = rt
        .block_on(holder.acquire(&job))
        .expect("holder should acquire");

    c.bench_function("contended_acquire", |b| {
        b.to_async(&rt).iter(|| async {
            assert!(contender.acquire(&job).await.is_none());
        });
    });
}

/// Benchmark: Extend a held lease.
fn bench_extend(c: &mut Criterion) {
    let rt = create_runtime();
    let locks = LockManager::new(Arc::new(MemoryStore::new()), LockConfig::default());
    let handle = rt
        .block_on(locks.acquire(&JobId::from("bench-job")))
        .expect("lock should be free");

    c.bench_function("extend", |b| {
        b.to_async(&rt).iter(|| async {
            assert!(handle.extend(None).await);
        });
    });
}

criterion_group!(benches, bench_acquire_release, bench_contended_acquire, bench_extend);
criterion_main!(benches);

//! Distributed lock manager with fencing tokens.
//!
//! A lease on `lock:<job_id>` grants mutual exclusion across processes for
//! as long as its TTL holds. Every successful acquisition mints a fencing
//! token from `fence:<job_id>`; tokens strictly increase per job, so a
//! holder whose token is no longer the latest knows it is stale.
//!
//! Stores that implement [`AtomicLockStore`] get compare-and-set semantics
//! on the server. Plain key-value stores fall back to a get/set/read-back
//! sequence that leaves a narrow race window between the read and the
//! write; under that path the fencing token is the only protection
//! against a stale holder, so handlers must check
//! [`LockHandle::is_fence_current`] before committing side effects.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::events::{EventPayload, LockFailReason, SharedPublisher, emit, noop_publisher};
use crate::job::{FencingToken, InstanceId, JobId};
use crate::store::{KeyValueStore, parse_fence};
use crate::telemetry;

/// Outcome of [`LockManager::with_lock`].
#[derive(Debug)]
pub enum WithLockOutcome<T> {
    /// Another holder owns the lease; the closure did not run.
    NotAcquired,
    Completed(T),
    /// The closure returned an error or panicked. The lock was released.
    Failed(anyhow::Error),
}

impl<T> WithLockOutcome<T> {
    pub fn is_acquired(&self) -> bool {
        !matches!(self, WithLockOutcome::NotAcquired)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            WithLockOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Renders a panic payload for logs and error messages.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

enum Slot {
    /// An `acquire` call for the job is in progress.
    Acquiring,
    Held(Weak<LeaseState>),
}

struct ManagerShared {
    store: Arc<dyn KeyValueStore>,
    instance_id: InstanceId,
    events: SharedPublisher,
    slots: Mutex<HashMap<JobId, Slot>>,
}

impl ManagerShared {
    fn reserve<'a>(&'a self, job_id: &'a JobId) -> Option<Reservation<'a>> {
        let mut slots = self.slots.lock();
        let current = match slots.get(job_id) {
            Some(Slot::Acquiring) => return None,
            Some(Slot::Held(lease)) => lease.upgrade(),
            None => None,
        };
        if current.as_ref().is_some_and(|state| state.is_held()) {
            drop(slots);
            return None;
        }
        slots.insert(job_id.clone(), Slot::Acquiring);
        // Dropping the last strong reference runs `LeaseState::drop`, which
        // takes the slots lock itself.
        drop(slots);
        drop(current);
        Some(Reservation {
            shared: self,
            job_id,
            committed: false,
        })
    }

    /// Drops the local slot for `job_id` if it still points at `state`.
    fn forget(&self, job_id: &JobId, state: *const LeaseState) {
        let mut slots = self.slots.lock();
        if let Some(Slot::Held(lease)) = slots.get(job_id) {
            if std::ptr::eq(lease.as_ptr(), state) {
                slots.remove(job_id);
            }
        }
    }

    fn emit(&self, payload: EventPayload) {
        emit(self.events.as_ref(), &self.instance_id, payload);
    }
}

/// Local claim on a job while its acquisition is in flight.
struct Reservation<'a> {
    shared: &'a ManagerShared,
    job_id: &'a JobId,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, state: &Arc<LeaseState>) {
        self.shared
            .slots
            .lock()
            .insert(self.job_id.clone(), Slot::Held(Arc::downgrade(state)));
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut slots = self.shared.slots.lock();
        if matches!(slots.get(self.job_id), Some(Slot::Acquiring)) {
            slots.remove(self.job_id);
        }
    }
}

struct LeaseState {
    manager: Arc<ManagerShared>,
    job_id: JobId,
    lock_key: String,
    owner: String,
    fencing_token: FencingToken,
    ttl: Duration,
    acquired_at: Instant,
    expires_at: Mutex<Instant>,
    held: AtomicBool,
    released: AtomicBool,
    auto_extend: CancellationToken,
}

impl LeaseState {
    fn is_held(&self) -> bool {
        !self.released.load(Ordering::SeqCst)
            && self.held.load(Ordering::SeqCst)
            && Instant::now() < *self.expires_at.lock()
    }

    fn mark_lost(&self) {
        self.auto_extend.cancel();
        if self.held.swap(false, Ordering::SeqCst) {
            telemetry::record_lock_lost(&self.job_id, self.fencing_token);
            self.manager.emit(EventPayload::LockLost {
                job_id: self.job_id.clone(),
                fencing_token: self.fencing_token,
            });
        }
    }
}

impl Drop for LeaseState {
    fn drop(&mut self) {
        self.auto_extend.cancel();
        self.manager.forget(&self.job_id, self as *const LeaseState);
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        // No runtime means nobody can await a release; the TTL cleans up.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let store = self.manager.store.clone();
        let lock_key = self.lock_key.clone();
        let owner = self.owner.clone();
        let job_id = self.job_id.clone();
        handle.spawn(async move {
            match release_in_store(store.as_ref(), &lock_key, &owner).await {
                Ok(true) => tracing::debug!(job_id = %job_id, "released lease of dropped handle"),
                Ok(false) => {}
                Err(err) => tracing::warn!(
                    job_id = %job_id,
                    "failed to release lease of dropped handle; it will expire: {err}"
                ),
            }
        });
    }
}

async fn release_in_store(store: &dyn KeyValueStore, lock_key: &str, owner: &str) -> anyhow::Result<bool> {
    if let Some(atomic) = store.atomic() {
        return atomic.release_lock(lock_key, owner).await;
    }
    // Compare-and-delete emulation: the key can change hands between the
    // read and the delete.
    match store.get(lock_key).await? {
        Some(current) if current == owner => store.delete(lock_key).await,
        _ => Ok(false),
    }
}

async fn extend_in_store(store: &dyn KeyValueStore, lock_key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool> {
    if let Some(atomic) = store.atomic() {
        return atomic.extend_lock(lock_key, owner, ttl).await;
    }
    match store.get(lock_key).await? {
        Some(current) if current == owner => {
            store.set(lock_key, owner, Some(ttl)).await?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Set-if-absent emulated with get/set/read-back, then a fence increment.
async fn acquire_fallback(
    store: &dyn KeyValueStore,
    lock_key: &str,
    fence_key: &str,
    owner: &str,
    ttl: Duration,
) -> anyhow::Result<Option<FencingToken>> {
    if let Some(current) = store.get(lock_key).await? {
        if current != owner {
            return Ok(None);
        }
    }

    store.set(lock_key, owner, Some(ttl)).await?;
    if store.get(lock_key).await?.as_deref() != Some(owner) {
        return Ok(None);
    }

    let minted = async {
        let token = parse_fence(store.get(fence_key).await?.as_deref())?.next();
        store.set(fence_key, &token.to_string(), None).await?;
        anyhow::Ok(token)
    }
    .await;

    let token = match minted {
        Ok(token) => token,
        Err(err) => {
            // Do not keep a lease we cannot fence.
            let _ = release_in_store(store, lock_key, owner).await;
            return Err(err);
        }
    };

    // A racing writer may have overwritten the key while the token was
    // minted; only the current owner proceeds.
    if store.get(lock_key).await?.as_deref() != Some(owner) {
        return Ok(None);
    }
    Ok(Some(token))
}

/// Cloneable view over a held lease.
///
/// The lease is released by [`release`](Self::release) or, best effort,
/// when the last clone is dropped. Auto-extension stops at either point.
#[derive(Clone)]
pub struct LockHandle {
    state: Arc<LeaseState>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("job_id", &self.state.job_id)
            .field("lock_key", &self.state.lock_key)
            .field("fencing_token", &self.state.fencing_token)
            .field("is_held", &self.is_held())
            .finish()
    }
}

impl LockHandle {
    pub fn job_id(&self) -> &JobId {
        &self.state.job_id
    }

    pub fn lock_key(&self) -> &str {
        &self.state.lock_key
    }

    pub fn fencing_token(&self) -> FencingToken {
        self.state.fencing_token
    }

    /// Value stored under the lock key: `<instance_id>#<nonce>`.
    pub fn owner(&self) -> &str {
        &self.state.owner
    }

    /// Local view: false once released, once an extension failed, or once
    /// the TTL elapsed since the last successful extension.
    pub fn is_held(&self) -> bool {
        self.state.is_held()
    }

    pub fn held_for(&self) -> Duration {
        self.state.acquired_at.elapsed()
    }

    /// Resets the lease TTL (to `ttl`, or the acquisition TTL) if the store
    /// still names this handle as owner.
    ///
    /// Any failure, including a store error, marks the handle as no longer
    /// held and stops auto-extension.
    pub async fn extend(&self, ttl: Option<Duration>) -> bool {
        let state = &self.state;
        if state.released.load(Ordering::SeqCst) || !state.held.load(Ordering::SeqCst) {
            return false;
        }

        let ttl = ttl.unwrap_or(state.ttl);
        let started = Instant::now();
        match extend_in_store(state.manager.store.as_ref(), &state.lock_key, &state.owner, ttl).await {
            Ok(true) => {
                *state.expires_at.lock() = started + ttl;
                tracing::trace!(job_id = %state.job_id, ttl_ms = ttl.as_millis() as u64, "lease extended");
                state.manager.emit(EventPayload::LockExtended {
                    job_id: state.job_id.clone(),
                    fencing_token: state.fencing_token,
                    ttl_ms: ttl.as_millis() as u64,
                });
                true
            }
            Ok(false) => {
                state.mark_lost();
                false
            }
            Err(err) => {
                tracing::warn!(job_id = %state.job_id, "lease extension failed: {err}");
                state.mark_lost();
                false
            }
        }
    }

    /// Deletes the lease if the store still names this handle as owner.
    ///
    /// Ownership is checked against the store, never the local flag. Only
    /// the first call does any work; later calls return `false`, as does a
    /// store error (the lease then expires through its TTL).
    pub async fn release(&self) -> bool {
        let state = &self.state;
        if state.released.swap(true, Ordering::SeqCst) {
            tracing::debug!(job_id = %state.job_id, "lease already released");
            return false;
        }
        state.auto_extend.cancel();
        state.held.store(false, Ordering::SeqCst);
        state.manager.forget(&state.job_id, Arc::as_ptr(&self.state));

        match release_in_store(state.manager.store.as_ref(), &state.lock_key, &state.owner).await {
            Ok(true) => {
                let held_for_ms = state.acquired_at.elapsed().as_millis() as u64;
                tracing::debug!(
                    job_id = %state.job_id,
                    fencing_token = state.fencing_token.value(),
                    held_for_ms,
                    "lease released"
                );
                state.manager.emit(EventPayload::LockReleased {
                    job_id: state.job_id.clone(),
                    fencing_token: state.fencing_token,
                    held_for_ms,
                });
                true
            }
            Ok(false) => {
                tracing::debug!(job_id = %state.job_id, "lease was no longer owned at release");
                false
            }
            Err(err) => {
                tracing::warn!(
                    job_id = %state.job_id,
                    "failed to release lease; it will expire via TTL: {err}"
                );
                false
            }
        }
    }

    /// Whether this handle's token is still the latest issued for the job.
    /// Store errors read as `false`.
    pub async fn is_fence_current(&self) -> bool {
        let state = &self.state;
        match state.manager.store.get(&state.job_id.fence_key()).await {
            Ok(raw) => parse_fence(raw.as_deref()).is_ok_and(|latest| latest == state.fencing_token),
            Err(err) => {
                tracing::warn!(job_id = %state.job_id, "failed to read fencing token: {err}");
                false
            }
        }
    }

    fn spawn_auto_extend(&self, every: Duration) {
        let lease: Weak<LeaseState> = Arc::downgrade(&self.state);
        let cancel = self.state.auto_extend.clone();
        let span = tracing::debug_span!("warden.lock.auto_extend", job_id = %self.state.job_id);

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(state) = lease.upgrade() else { break };
                            if !(LockHandle { state }).extend(None).await {
                                break;
                            }
                        }
                    }
                }
                tracing::trace!("auto-extension stopped");
            }
            .instrument(span),
        );
    }
}

/// Acquires and tracks job leases for one process instance.
#[derive(Clone)]
pub struct LockManager {
    shared: Arc<ManagerShared>,
    config: LockConfig,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("instance_id", &self.shared.instance_id)
            .field("config", &self.config)
            .field("native_atomics", &self.shared.store.atomic().is_some())
            .field("held", &self.held_jobs())
            .finish()
    }
}

impl LockManager {
    pub fn new(store: Arc<dyn KeyValueStore>, config: LockConfig) -> Self {
        Self::with_identity(store, config, InstanceId::generate(), noop_publisher())
    }

    pub fn with_identity(
        store: Arc<dyn KeyValueStore>,
        config: LockConfig,
        instance_id: InstanceId,
        events: SharedPublisher,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                store,
                instance_id,
                events,
                slots: Mutex::new(HashMap::new()),
            }),
            config,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.shared.instance_id
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.shared.store
    }

    /// Acquires the lease for `job_id` with the manager's configuration.
    ///
    /// Returns `None` when the job is already held by this manager, when
    /// another owner holds it through every retry, or when the store fails.
    pub async fn acquire(&self, job_id: &JobId) -> Option<LockHandle> {
        let config = self.config.clone();
        self.acquire_with(job_id, &config).await
    }

    pub async fn acquire_with(&self, job_id: &JobId, config: &LockConfig) -> Option<LockHandle> {
        let span = telemetry::lock_acquire_span(job_id);
        self.acquire_inner(job_id, config).instrument(span).await
    }

    async fn acquire_inner(&self, job_id: &JobId, config: &LockConfig) -> Option<LockHandle> {
        let Some(reservation) = self.shared.reserve(job_id) else {
            telemetry::record_lock_failed(job_id, LockFailReason::HeldLocally, 0);
            self.shared.emit(EventPayload::LockFailed {
                job_id: job_id.clone(),
                reason: LockFailReason::HeldLocally,
                attempts: 0,
            });
            return None;
        };

        let owner = format!("{}#{}", self.shared.instance_id, Uuid::now_v7());
        let ttl = config.ttl();
        let max_attempts = config.retries.saturating_add(1);
        let mut reason = LockFailReason::Contended;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(config.retry_delay(attempt - 1)).await;
            }

            let started = Instant::now();
            match self.try_acquire(job_id, &owner, ttl).await {
                Ok(Some(token)) => {
                    let handle = self.install(job_id, owner, token, ttl, started, reservation);
                    if let Some(every) = config.auto_extend() {
                        handle.spawn_auto_extend(every);
                    }
                    telemetry::record_lock_acquired(job_id, token, attempt + 1);
                    self.shared.emit(EventPayload::LockAcquired {
                        job_id: job_id.clone(),
                        fencing_token: token,
                        attempts: attempt + 1,
                    });
                    return Some(handle);
                }
                Ok(None) => {
                    reason = LockFailReason::Contended;
                    tracing::trace!(job_id = %job_id, attempt = attempt + 1, "lease held elsewhere");
                }
                Err(err) => {
                    reason = LockFailReason::StoreError;
                    tracing::warn!(
                        job_id = %job_id,
                        attempt = attempt + 1,
                        "lock store error during acquire: {err}"
                    );
                }
            }
        }

        telemetry::record_lock_failed(job_id, reason, max_attempts);
        self.shared.emit(EventPayload::LockFailed {
            job_id: job_id.clone(),
            reason,
            attempts: max_attempts,
        });
        None
    }

    async fn try_acquire(&self, job_id: &JobId, owner: &str, ttl: Duration) -> anyhow::Result<Option<FencingToken>> {
        let store = self.shared.store.as_ref();
        let lock_key = job_id.lock_key();
        let fence_key = job_id.fence_key();

        match store.atomic() {
            Some(atomic) => Ok(atomic
                .acquire_lock(&lock_key, &fence_key, owner, ttl)
                .await?
                .fencing_token()),
            None => acquire_fallback(store, &lock_key, &fence_key, owner, ttl).await,
        }
    }

    fn install(
        &self,
        job_id: &JobId,
        owner: String,
        fencing_token: FencingToken,
        ttl: Duration,
        started: Instant,
        reservation: Reservation<'_>,
    ) -> LockHandle {
        let state = Arc::new(LeaseState {
            manager: self.shared.clone(),
            job_id: job_id.clone(),
            lock_key: job_id.lock_key(),
            owner,
            fencing_token,
            ttl,
            acquired_at: started,
            expires_at: Mutex::new(started + ttl),
            held: AtomicBool::new(true),
            released: AtomicBool::new(false),
            auto_extend: CancellationToken::new(),
        });
        reservation.commit(&state);
        LockHandle { state }
    }

    /// Runs `f` while holding the lease for `job_id` and releases it
    /// afterwards, including when `f` fails or panics.
    pub async fn with_lock<T, F, Fut>(&self, job_id: &JobId, f: F) -> WithLockOutcome<T>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let Some(handle) = self.acquire(job_id).await else {
            return WithLockOutcome::NotAcquired;
        };

        let guarded = handle.clone();
        let result = AssertUnwindSafe(async move { f(guarded).await })
            .catch_unwind()
            .await;
        handle.release().await;

        match result {
            Ok(Ok(value)) => WithLockOutcome::Completed(value),
            Ok(Err(err)) => WithLockOutcome::Failed(err),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(job_id = %job_id, "lock holder panicked: {message}");
                WithLockOutcome::Failed(anyhow::anyhow!("lock holder panicked: {message}"))
            }
        }
    }

    /// Whether any owner currently holds the lease.
    pub async fn is_locked(&self, job_id: &JobId) -> anyhow::Result<bool> {
        self.shared.store.exists(&job_id.lock_key()).await
    }

    /// Latest token issued for `job_id`, or `None` if it was never locked.
    pub async fn current_fencing_token(&self, job_id: &JobId) -> anyhow::Result<Option<FencingToken>> {
        match self.shared.store.get(&job_id.fence_key()).await? {
            Some(raw) => parse_fence(Some(&raw)).map(Some),
            None => Ok(None),
        }
    }

    /// Jobs this manager currently holds, sorted.
    pub fn held_jobs(&self) -> Vec<JobId> {
        let leases: Vec<Arc<LeaseState>> = {
            let slots = self.shared.slots.lock();
            slots
                .values()
                .filter_map(|slot| match slot {
                    Slot::Held(lease) => lease.upgrade(),
                    Slot::Acquiring => None,
                })
                .collect()
        };
        let mut held: Vec<JobId> = leases
            .iter()
            .filter(|state| state.is_held())
            .map(|state| state.job_id.clone())
            .collect();
        held.sort();
        held
    }

    /// Handle of a lease this manager currently holds.
    pub fn handle(&self, job_id: &JobId) -> Option<LockHandle> {
        match self.shared.slots.lock().get(job_id) {
            Some(Slot::Held(lease)) => lease.upgrade().map(|state| LockHandle { state }),
            _ => None,
        }
    }

    /// Releases every lease this manager holds. Returns how many releases
    /// the store confirmed.
    pub async fn release_all(&self) -> usize {
        let leases: Vec<Arc<LeaseState>> = {
            let slots = self.shared.slots.lock();
            slots
                .values()
                .filter_map(|slot| match slot {
                    Slot::Held(lease) => lease.upgrade(),
                    Slot::Acquiring => None,
                })
                .collect()
        };

        let mut released = 0;
        for state in leases {
            if (LockHandle { state }).release().await {
                released += 1;
            }
        }
        if released > 0 {
            tracing::info!(released, "released held leases");
        }
        released
    }
}

//! `PoolEngine`: the shared core behind the public `Pool<M>` handle.
//!
//! Generalizes the teacher's `SharedPool`/`InnerPool`: the same
//! Arc-shared-state-plus-background-tasks shape, restructured around
//! `HandoffBag`'s direct-handoff borrow path instead of a blocking queue.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;

use crate::admission::AdmissionGate;
use crate::bag::{BorrowOutcome, DryListener, HandoffBag};
use crate::clock::ClockSource;
use crate::config::{Builder, PoolConfig};
use crate::creator::run_creator;
use crate::entry::{EntryState, PoolEntry};
use crate::error::PoolError;
use crate::housekeeper::run_housekeeper;
use crate::manage::ManageConnection;
use crate::metrics::{self, MetricsSink};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolState {
    Normal = 0,
    Suspended = 1,
    Shutdown = 2,
}

impl PoolState {
    fn from_u8(v: u8) -> PoolState {
        match v {
            0 => PoolState::Normal,
            1 => PoolState::Suspended,
            _ => PoolState::Shutdown,
        }
    }
}

/// A snapshot of pool occupancy, returned by `Pool::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Handles currently checked out.
    pub active: u32,
    /// Handles sitting idle in the bag.
    pub idle: u32,
    /// `active + idle`.
    pub total: u32,
    /// Borrowers currently waiting for a handle.
    pub waiting: usize,
}

pub(crate) struct PoolEngine<M: ManageConnection> {
    pub(crate) manager: M,
    pub(crate) config: PoolConfig,
    pub(crate) bag: HandoffBag<M>,
    pub(crate) clock: Arc<dyn ClockSource>,
    metrics: Box<dyn MetricsSink<M>>,
    state: AtomicU8,
    total_connections: AtomicU32,
    pending_connections: AtomicUsize,
    last_creation_failure: Mutex<Option<Arc<M::Error>>>,
    housekeeper_handle: Mutex<Option<JoinHandle<()>>>,
    adder_permits: Arc<Semaphore>,
    closer_permits: Arc<Semaphore>,
    admission: AdmissionGate,
    self_weak: OnceLock<Weak<PoolEngine<M>>>,
}

impl<M: ManageConnection> fmt::Debug for PoolEngine<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEngine")
            .field("state", &self.state())
            .field("total", &self.total_connections.load(Ordering::Relaxed))
            .field("idle", &self.bag.count(EntryState::NotInUse))
            .field("waiting", &self.bag.pending_waiters())
            .finish()
    }
}

impl<M: ManageConnection> DryListener for PoolEngine<M> {
    fn on_bag_dry(&self) {
        let Some(weak) = self.self_weak.get() else {
            return;
        };
        if let Some(engine) = weak.upgrade() {
            tokio::spawn(async move { engine.fill_pool().await });
        }
    }
}

impl<M: ManageConnection> PoolEngine<M> {
    pub(crate) fn new(builder: Builder<M>, manager: M) -> Arc<Self> {
        let (config, metrics, clock) = builder.into_parts();
        let allow_pool_suspension = config.allow_pool_suspension;
        // Adder and closer pools are both capped at `maximumPoolSize` (§5):
        // that's the most creations or disposals that could ever be in
        // flight at once, since each corresponds to one entry.
        let worker_cap = config.maximum_pool_size.max(1) as usize;
        let engine = Arc::new(PoolEngine {
            manager,
            config,
            bag: HandoffBag::new(),
            clock,
            metrics,
            state: AtomicU8::new(PoolState::Normal as u8),
            total_connections: AtomicU32::new(0),
            pending_connections: AtomicUsize::new(0),
            last_creation_failure: Mutex::new(None),
            housekeeper_handle: Mutex::new(None),
            adder_permits: Arc::new(Semaphore::new(worker_cap)),
            closer_permits: Arc::new(Semaphore::new(worker_cap)),
            admission: AdmissionGate::new(allow_pool_suspension),
            self_weak: OnceLock::new(),
        });
        let _ = engine.self_weak.set(Arc::downgrade(&engine));
        engine.bag.set_listener(Arc::downgrade(&engine) as Weak<dyn DryListener>);
        engine
    }

    pub(crate) fn spawn_housekeeper(self: &Arc<Self>) {
        let engine = self.clone();
        let handle = tokio::spawn(run_housekeeper(engine));
        *self.housekeeper_handle.lock().unwrap() = Some(handle);
    }

    pub(crate) fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.state() == PoolState::Shutdown
    }

    pub(crate) fn wants_more_connections(&self) -> bool {
        self.state() == PoolState::Normal
            && self.total_connections.load(Ordering::Acquire) < self.config.maximum_pool_size
    }

    pub(crate) fn record_creation_success(&self) {
        *self.last_creation_failure.lock().unwrap() = None;
    }

    pub(crate) fn record_creation_failure(&self, err: M::Error) {
        tracing::warn!(error = ?err, "handle factory connect() failed; retrying with backoff");
        *self.last_creation_failure.lock().unwrap() = Some(Arc::new(err));
    }

    pub(crate) fn creation_attempt_abandoned(&self) {
        self.pending_connections.fetch_sub(1, Ordering::AcqRel);
    }

    fn last_creation_failure(&self) -> Option<Arc<M::Error>> {
        self.last_creation_failure.lock().unwrap().clone()
    }

    pub(crate) async fn adopt_new_entry(self: &Arc<Self>, entry: Arc<PoolEntry<M>>) {
        self.attach_eol_timer(&entry);
        self.total_connections.fetch_add(1, Ordering::AcqRel);
        self.pending_connections.fetch_sub(1, Ordering::AcqRel);
        self.bag.add(entry);
    }

    /// Tops the pool up to `minimumIdle`, spawning one creator task per
    /// handle still needed, each gated by an adder permit so a dry pool
    /// doesn't dogpile the factory.
    pub(crate) async fn fill_pool(self: Arc<Self>) {
        if self.state() != PoolState::Normal {
            return;
        }
        loop {
            let total = self.total_connections.load(Ordering::Acquire)
                + self.pending_connections.load(Ordering::Acquire) as u32;
            let idle = self.bag.count(EntryState::NotInUse) as u32
                + self.pending_connections.load(Ordering::Acquire) as u32;
            let need_for_minimum = self.config.minimum_idle.saturating_sub(idle);
            let room_under_max = self.config.maximum_pool_size.saturating_sub(total);
            if need_for_minimum == 0 || room_under_max == 0 {
                return;
            }

            let Ok(permit) = self.adder_permits.clone().try_acquire_owned() else {
                return;
            };
            self.pending_connections.fetch_add(1, Ordering::AcqRel);
            let engine = self.clone();
            tokio::spawn(async move {
                run_creator(engine).await;
                drop(permit);
            });
        }
    }

    /// Closes a handle no longer welcome in the pool, running the factory's
    /// `close` on a bounded pool of closer tasks. Past that bound, disposal
    /// runs on the caller's own task (caller-runs backpressure) rather than
    /// unboundedly queuing closes behind a slow factory.
    async fn dispose(self: &Arc<Self>, conn: M::Connection) {
        match self.closer_permits.clone().try_acquire_owned() {
            Ok(permit) => {
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.manager.close(conn).await;
                    drop(permit);
                });
            }
            Err(_) => self.manager.close(conn).await,
        }
    }

    /// Terminal handling for an entry no one else may claim: removes it from
    /// the bag, decrements occupancy, cancels its timers, and disposes of
    /// the handle. Callers must already hold the entry exclusively (`IN_USE`
    /// or `RESERVED`) and have taken its handle out.
    pub(crate) async fn close_claimed_entry(
        self: &Arc<Self>,
        entry: Arc<PoolEntry<M>>,
        conn: M::Connection,
        reason: &'static str,
    ) {
        let removed = self.bag.remove(&entry);
        debug_assert!(removed, "closing an entry not held exclusively");
        self.total_connections.fetch_sub(1, Ordering::AcqRel);
        entry.cancel_eol_task();
        entry.cancel_leak_task();
        tracing::debug!(entry_id = entry.id, reason, "disposing pool entry");
        self.dispose(conn).await;
        if self.state() == PoolState::Normal {
            self.clone().fill_pool().await;
        }
    }

    /// Marks an idle-or-checked-out entry evicted. If it's idle right now,
    /// closes it immediately; otherwise the mark is sticky and the next
    /// successful claim of this entry routes to closure instead of to a
    /// borrower (§4.2).
    async fn soft_evict(self: &Arc<Self>, entry: Arc<PoolEntry<M>>, reason: &'static str) {
        entry.mark_evicted();
        if self.bag.reserve(&entry) {
            let conn = entry.take_handle();
            self.close_claimed_entry(entry, conn, reason).await;
        }
    }

    /// Soft-evicts every entry currently known to the bag. Used by
    /// `shutdown()` and by the housekeeper's retrograde-clock response,
    /// where stale `lastAccessed` stamps make every entry suspect at once.
    pub(crate) async fn soft_evict_all(self: &Arc<Self>, reason: &'static str) {
        for entry in self.bag.values() {
            self.soft_evict(entry, reason).await;
        }
    }

    /// Schedules the end-of-life timer for a freshly created entry, jittered
    /// by up to ~2.5% of `maxLifetime` (when it's more than 10s) so a batch
    /// of handles created together doesn't all expire in the same instant.
    pub(crate) fn attach_eol_timer(self: &Arc<Self>, entry: &Arc<PoolEntry<M>>) {
        let Some(max_lifetime) = self.config.max_lifetime else {
            return;
        };
        let variance_ms = if max_lifetime > Duration::from_secs(10) {
            let jitter_ceiling = (max_lifetime.as_millis() as f64 * 0.025) as u64;
            rand::thread_rng().gen_range(0..=jitter_ceiling.max(1))
        } else {
            0
        };
        let lifetime = max_lifetime.saturating_sub(Duration::from_millis(variance_ms));

        let engine = self.clone();
        let watched = entry.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            engine.soft_evict(watched, "max lifetime exceeded").await;
        });
        entry.set_eol_task(task);
    }

    /// Schedules the leak-detection timer for an entry that was just handed
    /// to a borrower. Cancelled by `PooledHandle::drop` on a timely return.
    fn attach_leak_timer(self: &Arc<Self>, entry: &Arc<PoolEntry<M>>) {
        let Some(threshold) = self.config.leak_detection_threshold() else {
            return;
        };
        let entry_id = entry.id;
        let task = tokio::spawn(async move {
            tokio::time::sleep(threshold).await;
            tracing::warn!(
                entry_id,
                threshold_secs = threshold.as_secs(),
                "possible handle leak detected: a checked-out handle has not been \
                 returned within the leak detection threshold"
            );
        });
        entry.set_leak_task(task);
    }

    /// Borrows one handle, retrying against the bag until `hard_timeout`
    /// elapses. A handle claimed more than `aliveBypassWindow` ago is probed
    /// with `ManageConnection::validate` before being handed out; a
    /// recently-returned one bypasses the probe.
    pub(crate) async fn borrow(
        self: &Arc<Self>,
        hard_timeout: Duration,
    ) -> Result<PooledHandle<M>, PoolError<M::Error>> {
        if self.is_shut_down() {
            return Err(PoolError::PoolShutdownError);
        }
        let wait_start = Instant::now();
        let deadline = TokioInstant::now() + hard_timeout;

        let _admission = match tokio::time::timeout_at(deadline, self.admission.acquire()).await {
            Ok(result) => result?,
            Err(_) => {
                self.metrics.record_connection_timeout();
                return Err(PoolError::timeout(
                    metrics::since(wait_start),
                    self.last_creation_failure(),
                ));
            }
        };

        loop {
            let now = TokioInstant::now();
            let remaining = if now >= deadline {
                Duration::ZERO
            } else {
                deadline - now
            };
            if remaining.is_zero() {
                self.metrics.record_connection_timeout();
                return Err(PoolError::timeout(
                    metrics::since(wait_start),
                    self.last_creation_failure(),
                ));
            }

            match self.bag.borrow(remaining).await {
                // The bag was closed out from under a queued waiter (`close()`,
                // §4.1); distinct from `PoolShutdownError`, which `is_shut_down()`
                // above already raises for a borrow attempted after shutdown
                // has fully completed.
                BorrowOutcome::Closed => return Err(PoolError::Interrupted),
                BorrowOutcome::TimedOut => {
                    self.metrics.record_connection_timeout();
                    return Err(PoolError::timeout(
                        metrics::since(wait_start),
                        self.last_creation_failure(),
                    ));
                }
                BorrowOutcome::Acquired(entry) => {
                    if entry.is_evicted() {
                        let conn = entry.take_handle();
                        self.close_claimed_entry(entry, conn, "evicted before handout").await;
                        continue;
                    }

                    let now = self.clock.now_millis();
                    let fresh = now.saturating_sub(entry.last_accessed_ms()) as u64
                        <= self.config.alive_bypass_window.as_millis() as u64;
                    let mut conn = entry.take_handle();

                    if !fresh {
                        let validation_timeout = self.config.validation_timeout();
                        let alive = self.manager.validate(&mut conn, validation_timeout).await;
                        if !alive {
                            self.close_claimed_entry(entry, conn, "failed liveness probe").await;
                            continue;
                        }
                    }

                    entry.touch(now);
                    self.attach_leak_timer(&entry);
                    self.metrics.record_borrow_stats(metrics::since(wait_start));
                    return Ok(PooledHandle {
                        engine: self.clone(),
                        entry: Some(entry),
                        conn: Some(conn),
                        checkout_start: Instant::now(),
                    });
                }
            }
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let idle = self.bag.count(EntryState::NotInUse) as u32;
        let total = self.total_connections.load(Ordering::Acquire);
        PoolStats {
            active: total.saturating_sub(idle),
            idle,
            total,
            waiting: self.bag.pending_waiters(),
        }
    }

    pub(crate) fn suspend(&self) -> Result<(), PoolError<M::Error>> {
        if !self.config.allow_pool_suspension {
            return Err(PoolError::IllegalState(
                "pool suspension is not enabled (allow_pool_suspension=false)",
            ));
        }
        self.state
            .compare_exchange(
                PoolState::Normal as u8,
                PoolState::Suspended as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| PoolError::IllegalState("pool must be running normally to suspend"))?;
        self.admission
            .suspend()
            .map_err(|_| PoolError::IllegalState("admission gate rejected suspend"))
    }

    pub(crate) async fn resume(self: &Arc<Self>) -> Result<(), PoolError<M::Error>> {
        self.state
            .compare_exchange(
                PoolState::Suspended as u8,
                PoolState::Normal as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| PoolError::IllegalState("pool is not currently suspended"))?;
        self.admission.resume();
        self.clone().fill_pool().await;
        Ok(())
    }

    pub(crate) async fn evict(self: &Arc<Self>, mut handle: PooledHandle<M>) {
        let (Some(entry), Some(conn)) = (handle.entry.take(), handle.conn.take()) else {
            return;
        };
        entry.cancel_leak_task();
        self.close_claimed_entry(entry, conn, "explicit evict").await;
    }

    pub(crate) async fn shutdown(self: &Arc<Self>) {
        let prev = self.state.swap(PoolState::Shutdown as u8, Ordering::AcqRel);
        if prev == PoolState::Shutdown as u8 {
            return;
        }
        tracing::info!("shutting down pool");

        self.soft_evict_all("shutdown").await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while (self.total_connections.load(Ordering::Acquire) > 0
            || self.pending_connections.load(Ordering::Acquire) > 0)
            && Instant::now() < deadline
        {
            for entry in self.bag.values_in_state(EntryState::NotInUse) {
                self.soft_evict(entry, "shutdown").await;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let remaining = self.total_connections.load(Ordering::Acquire);
        if remaining > 0 {
            tracing::warn!(
                remaining,
                "shutdown grace period elapsed with handles still checked out; \
                 they will be aborted as they are returned"
            );
        }

        self.bag.close();
        self.admission.close();
        if let Some(handle) = self.housekeeper_handle.lock().unwrap().take() {
            handle.abort();
        }
        tracing::info!("pool shutdown complete");
    }
}

/// A handle on loan from the pool. Returns itself to the pool on drop; see
/// `Pool::evict` for the explicit "don't give this one back" path.
pub struct PooledHandle<M: ManageConnection> {
    engine: Arc<PoolEngine<M>>,
    entry: Option<Arc<PoolEntry<M>>>,
    conn: Option<M::Connection>,
    checkout_start: Instant,
}

impl<M: ManageConnection> fmt::Debug for PooledHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle")
            .field("entry_id", &self.entry.as_ref().map(|e| e.id))
            .finish()
    }
}

impl<M: ManageConnection> std::ops::Deref for PooledHandle<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("handle used after being consumed")
    }
}

impl<M: ManageConnection> std::ops::DerefMut for PooledHandle<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("handle used after being consumed")
    }
}

impl<M: ManageConnection> Drop for PooledHandle<M> {
    fn drop(&mut self) {
        let (Some(entry), Some(conn)) = (self.entry.take(), self.conn.take()) else {
            return;
        };
        entry.cancel_leak_task();
        self.engine
            .metrics
            .record_connection_usage(metrics::since(self.checkout_start));

        if self.engine.state() == PoolState::Shutdown {
            // The real handle moved into this wrapper at borrow time, so the
            // engine has no way to reach in and abort it directly (unlike
            // the original's shared-reference Connection objects); the best
            // it can do is abort it the moment it comes back.
            self.engine.bag.remove(&entry);
            self.engine
                .total_connections
                .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
            entry.cancel_eol_task();
            let engine = self.engine.clone();
            tokio::spawn(async move { engine.manager.abort(conn).await });
            return;
        }

        if entry.is_evicted() {
            // A soft eviction landed on this entry while it was checked out
            // (shutdown, `max_lifetime`, or an explicit `soft_evict_all`);
            // route it to closure instead of recycling it back to a client
            // (§4.2: a marked entry's next exclusive hold must end in
            // closure, not a handout).
            self.engine.bag.remove(&entry);
            self.engine
                .total_connections
                .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
            entry.cancel_eol_task();
            let engine = self.engine.clone();
            tokio::spawn(async move {
                engine.dispose(conn).await;
                if engine.state() == PoolState::Normal {
                    engine.fill_pool().await;
                }
            });
            return;
        }

        entry.restore_handle(conn);
        self.engine.bag.requite(entry);
    }
}

/// A pool of interchangeable, expensive-to-create handles of type
/// `M::Connection`.
pub struct Pool<M: ManageConnection> {
    inner: Arc<PoolEngine<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Pool { inner: self.inner.clone() }
    }
}

impl<M: ManageConnection> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pool").field(&self.inner).finish()
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Starts building a pool with the default options.
    pub fn builder() -> Builder<M> {
        Builder::new()
    }

    /// Borrows a handle, using `connectionTimeout` as the deadline.
    pub async fn borrow(&self) -> Result<PooledHandle<M>, PoolError<M::Error>> {
        let timeout = self.inner.config.connection_timeout();
        self.inner.borrow(timeout).await
    }

    /// Borrows a handle with an explicit deadline, overriding
    /// `connectionTimeout` for this call only.
    pub async fn borrow_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledHandle<M>, PoolError<M::Error>> {
        self.inner.borrow(timeout).await
    }

    /// Permanently removes a borrowed handle from the pool instead of
    /// returning it. Use this when the caller knows the handle is broken in
    /// a way `validate` wouldn't catch on its own.
    pub async fn evict(&self, handle: PooledHandle<M>) {
        self.inner.evict(handle).await;
    }

    /// A snapshot of current occupancy.
    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    /// Read-only access to the pool's live configuration, including the
    /// mutable fields' setters.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Marks every entry currently known to the pool evicted: idle ones
    /// close immediately, checked-out ones close the moment they're
    /// returned. Part of the management surface alongside `stats`.
    pub async fn soft_evict_all(&self) {
        self.inner.soft_evict_all("management soft_evict_all").await;
    }

    /// Suspends the pool (requires `allowPoolSuspension`): instantly stops
    /// admitting new borrows without disturbing ones already in flight.
    pub fn suspend(&self) -> Result<(), PoolError<M::Error>> {
        self.inner.suspend()
    }

    /// Resumes a suspended pool and immediately tries to top back up to
    /// `minimumIdle`.
    pub async fn resume(&self) -> Result<(), PoolError<M::Error>> {
        self.inner.resume().await
    }

    /// Soft-evicts every idle handle and stops accepting new borrows, then
    /// waits up to 5 seconds for outstanding handles to come back before
    /// returning. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

impl<M: ManageConnection> Builder<M> {
    /// Builds the pool, opening and validating one handle synchronously
    /// first if `initializationFailFast` is set, then spawning the
    /// housekeeper and an initial fill to `minimumIdle`.
    pub async fn build(self, manager: M) -> Result<Pool<M>, PoolError<M::Error>> {
        let fail_fast = self.wants_fail_fast();
        let engine = PoolEngine::new(self, manager);

        if fail_fast {
            let mut conn = engine
                .manager
                .connect()
                .await
                .map_err(|e| PoolError::PoolInitializationError(Some(e)))?;
            let alive = engine
                .manager
                .validate(&mut conn, engine.config.validation_timeout())
                .await;
            engine.manager.close(conn).await;
            if !alive {
                return Err(PoolError::PoolInitializationError(None));
            }
        }

        engine.spawn_housekeeper();
        engine.clone().fill_pool().await;
        Ok(Pool { inner: engine })
    }

    /// Builds the pool without fail-fast initialization, never awaiting:
    /// the initial fill to `minimumIdle` happens in the background.
    pub fn build_unchecked(self, manager: M) -> Pool<M> {
        let engine = PoolEngine::new(self, manager);
        engine.spawn_housekeeper();
        let filler = engine.clone();
        tokio::spawn(async move { filler.fill_pool().await });
        Pool { inner: engine }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestManager;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true within the test budget");
    }

    async fn built_pool(min_idle: u32, max_size: u32) -> Pool<TestManager> {
        Builder::<TestManager>::new()
            .minimum_idle(min_idle)
            .maximum_pool_size(max_size)
            .housekeeping_period(Duration::from_secs(3600))
            .build(TestManager::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn warm_borrow_is_fast_and_returns_to_idle() {
        let pool = built_pool(5, 10).await;
        wait_until(|| pool.stats().idle == 5).await;

        let start = Instant::now();
        let handle = pool.borrow_timeout(Duration::from_secs(1)).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(pool.stats().active, 1);
        drop(handle);

        wait_until(|| pool.stats().idle == 5 && pool.stats().active == 0).await;
    }

    #[tokio::test]
    async fn borrow_retries_past_dead_handles_within_budget() {
        let manager = TestManager::new();
        let pool = Builder::<TestManager>::new()
            .minimum_idle(3)
            .maximum_pool_size(3)
            .alive_bypass_window(Duration::ZERO) // force the liveness probe on every borrow
            .housekeeping_period(Duration::from_secs(3600))
            .build(manager)
            .await
            .unwrap();
        wait_until(|| pool.stats().idle == 3).await;

        // The next two liveness probes report dead; the third succeeds.
        pool_manager(&pool).fail_next_n_validations.store(2, std::sync::atomic::Ordering::SeqCst);

        let handle = pool.borrow_timeout(Duration::from_secs(3)).await.unwrap();
        drop(handle);

        wait_until(|| pool_manager(&pool).close_count() == 2).await;
        // The creator replaces the two closed entries; total returns to 3.
        wait_until(|| pool.stats().total == 3).await;
    }

    #[tokio::test]
    async fn borrow_times_out_when_pool_exhausted() {
        let pool = built_pool(1, 1).await;
        wait_until(|| pool.stats().idle == 1).await;
        let held = pool.borrow_timeout(Duration::from_secs(5)).await.unwrap();

        let start = Instant::now();
        let err = pool.borrow_timeout(Duration::from_millis(200)).await.unwrap_err();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(190) && elapsed <= Duration::from_millis(500));
        assert!(matches!(err, PoolError::BorrowTimeout { .. }));

        drop(held);
    }

    #[tokio::test]
    async fn max_lifetime_evicts_entry_even_after_a_quick_borrow_and_return() {
        let pool = Builder::<TestManager>::new()
            .minimum_idle(1)
            .maximum_pool_size(1)
            .max_lifetime(Some(Duration::from_millis(150)))
            .housekeeping_period(Duration::from_secs(3600))
            .build(TestManager::new())
            .await
            .unwrap();
        wait_until(|| pool.stats().total == 1).await;

        let handle = pool.borrow_timeout(Duration::from_secs(1)).await.unwrap();
        drop(handle);

        wait_until(|| pool_manager(&pool).close_count() == 1).await;
        // A creator replacement restores total, but the original entry is gone.
        wait_until(|| pool.stats().total == 1).await;
    }

    #[tokio::test]
    async fn shutdown_closes_idle_and_aborts_returned_in_flight_handles() {
        let pool = built_pool(2, 2).await;
        wait_until(|| pool.stats().idle == 2).await;

        let held = pool.borrow_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(pool.stats().active, 1);

        let shutdown_pool = pool.clone();
        let shutdown = tokio::spawn(async move { shutdown_pool.shutdown().await });

        // Give shutdown a moment to soft-evict the idle entry before the
        // in-flight one comes back.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .expect("shutdown should finish within its own 5s grace period")
            .unwrap();

        assert_eq!(pool.stats().total, 0);
        assert!(pool.borrow_timeout(Duration::from_millis(50)).await.is_err());
    }

    #[tokio::test]
    async fn suspend_blocks_new_borrows_until_resume() {
        let pool = Builder::<TestManager>::new()
            .minimum_idle(1)
            .maximum_pool_size(1)
            .allow_pool_suspension(true)
            .housekeeping_period(Duration::from_secs(3600))
            .build(TestManager::new())
            .await
            .unwrap();
        wait_until(|| pool.stats().idle == 1).await;

        pool.suspend().unwrap();
        let suspended_pool = pool.clone();
        let waiter = tokio::spawn(async move {
            suspended_pool.borrow_timeout(Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.resume().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("borrow should unblock once resumed")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn soft_evict_all_closes_idle_and_marks_active_for_later_closure() {
        let pool = built_pool(2, 2).await;
        wait_until(|| pool.stats().idle == 2).await;

        let held = pool.borrow_timeout(Duration::from_secs(5)).await.unwrap();
        pool.soft_evict_all().await;

        // The idle one closes right away; the checked-out one stays alive
        // until it's dropped.
        wait_until(|| pool_manager(&pool).close_count() == 1).await;
        assert_eq!(pool.stats().total, 1);

        drop(held);
        wait_until(|| pool_manager(&pool).close_count() == 2).await;
    }

    fn pool_manager(pool: &Pool<TestManager>) -> &TestManager {
        &pool.inner.manager
    }
}

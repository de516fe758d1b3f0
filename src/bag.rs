//! `HandoffBag`: the concurrent container of pool entries.
//!
//! The hottest path (borrow from a warm pool) is designed to be wait-free:
//! a thread-local cache of this caller's own recent returns is checked
//! first, then a lock-free scan-and-CAS over the shared entry set, and only
//! then does a caller register as a waiter. `requite` prefers a direct
//! handoff to a waiting borrower over going back through the idle set, so a
//! pool running at saturation doesn't thundering-herd every waiter on every
//! return.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::timeout as tokio_timeout;
use tracing::trace;

use crate::entry::{EntryState, PoolEntry};
use crate::manage::ManageConnection;

/// The bag's non-owning back-reference to whoever wants to know when it runs
/// dry (§9: "implement as an interface the engine realizes; the bag holds a
/// non-owning reference. No cyclic ownership").
pub(crate) trait DryListener: Send + Sync {
    fn on_bag_dry(&self);
}

/// Outcome of `HandoffBag::borrow`.
pub(crate) enum BorrowOutcome<M: ManageConnection> {
    Acquired(Arc<PoolEntry<M>>),
    TimedOut,
    Closed,
}

type Waiter<M> = oneshot::Sender<Arc<PoolEntry<M>>>;

/// A queued waiter tagged with a registration id, so a borrower that times
/// out can find and remove its own entry rather than merely decrementing a
/// shared counter that a later `add`/`requite` dequeue would decrement again.
type QueuedWaiter<M> = (u64, Waiter<M>);

thread_local! {
    /// Keyed by a bag's stable address so one thread-local slab can serve
    /// every `HandoffBag<M>` instantiation without needing a generic
    /// thread-local per `M` (which `std::thread_local!` cannot express).
    static RECENT_RETURN: std::cell::RefCell<HashMap<usize, Box<dyn Any>>> =
        std::cell::RefCell::new(HashMap::new());
}

pub(crate) struct HandoffBag<M: ManageConnection> {
    entries: DashMap<u64, Arc<PoolEntry<M>>>,
    waiters: Mutex<VecDeque<QueuedWaiter<M>>>,
    next_waiter_id: AtomicU64,
    pending_waiters: AtomicUsize,
    closed: AtomicBool,
    listener: OnceLock<Weak<dyn DryListener>>,
}

impl<M: ManageConnection> fmt::Debug for HandoffBag<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffBag")
            .field("size", &self.entries.len())
            .field("pending_waiters", &self.pending_waiters.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<M: ManageConnection> HandoffBag<M> {
    pub(crate) fn new() -> Self {
        HandoffBag {
            entries: DashMap::new(),
            waiters: Mutex::new(VecDeque::new()),
            next_waiter_id: AtomicU64::new(0),
            pending_waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            listener: OnceLock::new(),
        }
    }

    /// Attaches the listener notified when a borrow finds the bag empty.
    /// Called exactly once, during engine construction.
    pub(crate) fn set_listener(&self, listener: Weak<dyn DryListener>) {
        let _ = self.listener.set(listener);
    }

    fn notify_dry(&self) {
        if let Some(listener) = self.listener.get().and_then(Weak::upgrade) {
            listener.on_bag_dry();
        }
    }

    fn cache_key(&self) -> usize {
        self as *const _ as usize
    }

    fn push_local(&self, entry: Weak<PoolEntry<M>>) {
        let key = self.cache_key();
        RECENT_RETURN.with(|cache| {
            let mut map = cache.borrow_mut();
            let slot = map
                .entry(key)
                .or_insert_with(|| Box::new(Vec::<Weak<PoolEntry<M>>>::new()));
            slot.downcast_mut::<Vec<Weak<PoolEntry<M>>>>()
                .expect("thread-local cache type mismatch for this bag")
                .push(entry);
        });
    }

    /// Scans this caller's own recent-return cache first (design note:
    /// "weak semantics are essential... never resurrect an evicted entry").
    fn take_local(&self) -> Option<Arc<PoolEntry<M>>> {
        let key = self.cache_key();
        RECENT_RETURN.with(|cache| {
            let mut map = cache.borrow_mut();
            let slot = map.get_mut(&key)?;
            let vec = slot
                .downcast_mut::<Vec<Weak<PoolEntry<M>>>>()
                .expect("thread-local cache type mismatch for this bag");
            while let Some(weak) = vec.pop() {
                if let Some(entry) = weak.upgrade() {
                    if entry.try_claim_in_use() {
                        return Some(entry);
                    }
                }
            }
            None
        })
    }

    fn scan_shared(&self) -> Option<Arc<PoolEntry<M>>> {
        for item in self.entries.iter() {
            let entry = item.value();
            if entry.try_claim_in_use() {
                return Some(entry.clone());
            }
        }
        None
    }

    /// Inserts a freshly created entry in `NOT_IN_USE`. Never blocks. If a
    /// waiter is already queued, this entry is the one handed to it
    /// (§4.1: "the waker MUST attempt to claim this entry before others").
    pub(crate) fn add(&self, entry: Arc<PoolEntry<M>>) {
        self.entries.insert(entry.id, entry.clone());
        loop {
            let Some((id, waiter)) = self.waiters.lock().unwrap().pop_front() else {
                break;
            };
            if !entry.try_claim_in_use() {
                // Someone else (a concurrent scan) already took this entry;
                // this waiter still deserves a turn at the next add/requite.
                self.waiters.lock().unwrap().push_front((id, waiter));
                break;
            }
            // This dequeue retires the waiter's registration for good, whether
            // or not the send below succeeds; it owns the one decrement for
            // it now, so a concurrent timeout that no longer finds this id in
            // the queue must not decrement again.
            self.pending_waiters.fetch_sub(1, Ordering::AcqRel);
            match waiter.send(entry.clone()) {
                Ok(()) => return,
                Err(_) => {
                    // Waiter's receiver is gone (it timed out or was dropped).
                    entry.release_to_idle();
                    continue;
                }
            }
        }
    }

    /// Attempts, in order: thread-local cache, shared scan, waiter
    /// registration. Returns as soon as any step succeeds.
    pub(crate) async fn borrow(&self, wait: Duration) -> BorrowOutcome<M> {
        if self.closed.load(Ordering::Acquire) {
            return BorrowOutcome::Closed;
        }
        if let Some(entry) = self.take_local() {
            return BorrowOutcome::Acquired(entry);
        }
        if let Some(entry) = self.scan_shared() {
            return BorrowOutcome::Acquired(entry);
        }

        let (tx, rx) = oneshot::channel();
        let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        self.waiters.lock().unwrap().push_back((waiter_id, tx));
        self.pending_waiters.fetch_add(1, Ordering::AcqRel);
        self.notify_dry();

        match tokio_timeout(wait, rx).await {
            Ok(Ok(entry)) => BorrowOutcome::Acquired(entry),
            Ok(Err(_)) => BorrowOutcome::Closed,
            Err(_) => {
                // Only decrement if our own registration is still queued: if
                // an `add`/`requite` already dequeued it (successfully or
                // not), that dequeue already owns the one decrement for this
                // waiter, and decrementing here too would double-count it.
                let mut waiters = self.waiters.lock().unwrap();
                if let Some(pos) = waiters.iter().position(|(id, _)| *id == waiter_id) {
                    waiters.remove(pos);
                    drop(waiters);
                    self.pending_waiters.fetch_sub(1, Ordering::AcqRel);
                }
                if self.closed.load(Ordering::Acquire) {
                    BorrowOutcome::Closed
                } else {
                    BorrowOutcome::TimedOut
                }
            }
        }
    }

    /// Relinquishes an exclusively-held entry back to the bag. If a waiter
    /// is queued, the entry is handed to it directly, staying `IN_USE` the
    /// whole time so a concurrent scanner can never steal it mid-handoff;
    /// otherwise it is released to `NOT_IN_USE` and seeded into the calling
    /// thread's recent-return cache. Never blocks.
    pub(crate) fn requite(&self, entry: Arc<PoolEntry<M>>) {
        loop {
            let Some((_id, waiter)) = self.waiters.lock().unwrap().pop_front() else {
                entry.release_to_idle();
                self.push_local(Arc::downgrade(&entry));
                trace!(entry_id = entry.id, "requite: released to idle");
                return;
            };
            // As in `add`: this dequeue is the one decrement for this
            // waiter's registration, regardless of whether the send below
            // succeeds.
            self.pending_waiters.fetch_sub(1, Ordering::AcqRel);
            match waiter.send(entry.clone()) {
                Ok(()) => {
                    trace!(entry_id = entry.id, "requite: direct handoff");
                    return;
                }
                Err(_) => continue,
            }
        }
    }

    /// CAS `NOT_IN_USE -> RESERVED`, for maintenance to claim an idle entry
    /// exclusively without racing a client borrow.
    pub(crate) fn reserve(&self, entry: &PoolEntry<M>) -> bool {
        entry.try_reserve()
    }

    /// Detaches a removed entry from the bag. Requires the entry to already
    /// be exclusively held (`IN_USE` or `RESERVED`).
    pub(crate) fn remove(&self, entry: &PoolEntry<M>) -> bool {
        if !entry.mark_removed() {
            return false;
        }
        self.entries.remove(&entry.id);
        true
    }

    pub(crate) fn values(&self) -> Vec<Arc<PoolEntry<M>>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub(crate) fn values_in_state(&self, state: EntryState) -> Vec<Arc<PoolEntry<M>>> {
        self.entries
            .iter()
            .filter(|e| e.value().state() == state)
            .map(|e| e.value().clone())
            .collect()
    }

    pub(crate) fn count(&self, state: EntryState) -> usize {
        self.entries.iter().filter(|e| e.value().state() == state).count()
    }

    pub(crate) fn size(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn pending_waiters(&self) -> usize {
        self.pending_waiters.load(Ordering::Relaxed)
    }

    /// Stops accepting new borrows; every currently and subsequently queued
    /// waiter observes the bag as closed.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut waiters = self.waiters.lock().unwrap();
        while let Some(waiter) = waiters.pop_front() {
            drop(waiter); // dropping the sender fails the receiver with Interrupted/Closed
        }
        self.pending_waiters.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestManager;
    use std::time::Duration as StdDuration;

    fn entry(id_seed: u64) -> Arc<PoolEntry<TestManager>> {
        Arc::new(PoolEntry::new(id_seed, 0))
    }

    #[tokio::test]
    async fn add_then_borrow_round_trips() {
        let bag: HandoffBag<TestManager> = HandoffBag::new();
        let e = entry(1);
        bag.add(e.clone());
        match bag.borrow(StdDuration::from_millis(50)).await {
            BorrowOutcome::Acquired(got) => assert_eq!(got.id, e.id),
            _ => panic!("expected acquisition"),
        }
    }

    #[tokio::test]
    async fn borrow_times_out_when_empty() {
        let bag: HandoffBag<TestManager> = HandoffBag::new();
        match bag.borrow(StdDuration::from_millis(20)).await {
            BorrowOutcome::TimedOut => {}
            _ => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn requite_hands_off_directly_to_waiter() {
        let bag: Arc<HandoffBag<TestManager>> = Arc::new(HandoffBag::new());
        let e = entry(1);
        assert!(e.try_claim_in_use());

        let waiter_bag = bag.clone();
        let waiter = tokio::spawn(async move { waiter_bag.borrow(StdDuration::from_secs(1)).await });

        // Give the waiter a chance to register before we requite.
        tokio::task::yield_now().await;
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        bag.requite(e.clone());

        match waiter.await.unwrap() {
            BorrowOutcome::Acquired(got) => assert_eq!(got.id, e.id),
            _ => panic!("expected the waiter to receive the handed-off entry"),
        }
    }

    #[tokio::test]
    async fn thread_local_cache_does_not_resurrect_removed_entries() {
        let bag: HandoffBag<TestManager> = HandoffBag::new();
        let e = entry(1);
        assert!(e.try_claim_in_use());
        bag.requite(e.clone()); // seeds the thread-local cache
        assert!(e.try_claim_in_use()); // simulate a concurrent steal via shared scan path
        assert!(e.mark_removed());

        // The entry is gone, but the caller's weak cache entry still exists;
        // a fresh borrow must not hand it out.
        match bag.borrow(StdDuration::from_millis(20)).await {
            BorrowOutcome::TimedOut => {}
            BorrowOutcome::Acquired(got) => panic!("resurrected removed entry {}", got.id),
            BorrowOutcome::Closed => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn close_fails_pending_waiters() {
        let bag: Arc<HandoffBag<TestManager>> = Arc::new(HandoffBag::new());
        let waiter_bag = bag.clone();
        let waiter = tokio::spawn(async move { waiter_bag.borrow(StdDuration::from_secs(5)).await });
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        bag.close();
        match waiter.await.unwrap() {
            BorrowOutcome::Closed => {}
            other => panic!("expected Closed, got a different outcome: {}", matches!(other, BorrowOutcome::Acquired(_))),
        }
    }

    /// A timed-out waiter's registration must be retired exactly once. Before
    /// the fix, the timeout path decremented `pending_waiters` without
    /// removing its sender from the queue, so the next `requite` dequeued the
    /// same stale waiter and decremented a second time, underflowing the
    /// counter (a bare `AtomicUsize` wraps rather than panicking).
    #[tokio::test]
    async fn timed_out_waiter_is_not_double_counted() {
        let bag: HandoffBag<TestManager> = HandoffBag::new();
        match bag.borrow(StdDuration::from_millis(10)).await {
            BorrowOutcome::TimedOut => {}
            _ => panic!("expected timeout"),
        }
        assert_eq!(bag.pending_waiters(), 0);

        // An unrelated return after the timeout must not find a stale sender
        // left behind for the timed-out waiter.
        let e = entry(1);
        assert!(e.try_claim_in_use());
        bag.requite(e);
        assert_eq!(bag.pending_waiters(), 0);
    }
}

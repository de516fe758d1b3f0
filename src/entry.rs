//! `PoolEntry`: one pooled slot, owning exactly one real handle.
//!
//! The entry's `state` atom is the sole synchronization primitive guarding
//! handoff (§9: "Atomic state as the sole mutex") — no additional lock is
//! taken around a state transition, because layering a lock on top would
//! reintroduce the stampede the direct-handoff design in `HandoffBag` exists
//! to avoid.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use tokio::task::JoinHandle;

use crate::manage::ManageConnection;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    NotInUse = 0,
    InUse = 1,
    Removed = 2,
    Reserved = 3,
}

impl EntryState {
    fn from_u8(v: u8) -> EntryState {
        match v {
            0 => EntryState::NotInUse,
            1 => EntryState::InUse,
            2 => EntryState::Removed,
            3 => EntryState::Reserved,
            _ => unreachable!("invalid entry state byte {v}"),
        }
    }
}

/// One pooled slot: a real handle plus the bookkeeping the engine and
/// housekeeper need to decide its fate.
pub(crate) struct PoolEntry<M: ManageConnection> {
    pub(crate) id: u64,
    handle: Mutex<Option<M::Connection>>,
    state: AtomicU8,
    pub(crate) creation_time_ms: i64,
    last_accessed_ms: AtomicI64,
    evicted: AtomicBool,
    eol_task: Mutex<Option<JoinHandle<()>>>,
    leak_task: Mutex<Option<JoinHandle<()>>>,
}

impl<M: ManageConnection> fmt::Debug for PoolEntry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("creation_time_ms", &self.creation_time_ms)
            .field("evicted", &self.evicted.load(Ordering::Relaxed))
            .finish()
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-wide unique entry id, used as the `DashMap` key in
/// `HandoffBag` and as the thread-local cache's identity check.
pub(crate) fn next_entry_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

impl<M: ManageConnection> PoolEntry<M> {
    /// Creates a new entry in `NOT_IN_USE`, as the Creator always does
    /// (§4.6: entries are only ever added already idle).
    pub(crate) fn new(conn: M::Connection, now_ms: i64) -> Self {
        PoolEntry {
            id: next_entry_id(),
            handle: Mutex::new(Some(conn)),
            state: AtomicU8::new(EntryState::NotInUse as u8),
            creation_time_ms: now_ms,
            last_accessed_ms: AtomicI64::new(now_ms),
            evicted: AtomicBool::new(false),
            eol_task: Mutex::new(None),
            leak_task: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempts `NOT_IN_USE -> IN_USE`. The sole entry point for the borrow
    /// fast path (thread-local cache, shared scan) and for direct handoff
    /// out of `add`.
    pub(crate) fn try_claim_in_use(&self) -> bool {
        self.state
            .compare_exchange(
                EntryState::NotInUse as u8,
                EntryState::InUse as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Attempts `NOT_IN_USE -> RESERVED`, used by maintenance to claim an
    /// idle entry exclusively without racing a concurrent borrow.
    pub(crate) fn try_reserve(&self) -> bool {
        self.state
            .compare_exchange(
                EntryState::NotInUse as u8,
                EntryState::Reserved as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Marks the entry idle again. Only the current exclusive holder
    /// (whoever last observed `IN_USE`/`RESERVED` on this entry) may call
    /// this; it is not a CAS because ownership, not the bit pattern, is
    /// what makes the transition safe.
    pub(crate) fn release_to_idle(&self) {
        self.state.store(EntryState::NotInUse as u8, Ordering::Release);
    }

    /// Terminal transition. Requires the caller to already exclusively hold
    /// the entry (`IN_USE` or `RESERVED`); fails if a concurrent actor beat
    /// it there, which cannot happen under the protocol but is checked
    /// anyway since this is the one irreversible step.
    pub(crate) fn mark_removed(&self) -> bool {
        let prev = self.state.swap(EntryState::Removed as u8, Ordering::AcqRel);
        prev == EntryState::InUse as u8 || prev == EntryState::Reserved as u8
    }

    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    pub(crate) fn last_accessed_ms(&self) -> i64 {
        self.last_accessed_ms.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self, now_ms: i64) {
        self.last_accessed_ms.store(now_ms, Ordering::Release);
    }

    /// Takes the raw handle out, moving ownership to whoever exclusively
    /// holds this entry (a client's wrapper, a liveness probe, or the
    /// disposer). Panics if the handle isn't there; the borrow/return/evict
    /// protocol guarantees exactly one actor ever holds the entry at a time,
    /// so a double-take means that protocol was violated.
    pub(crate) fn take_handle(&self) -> M::Connection {
        self.handle
            .lock()
            .unwrap()
            .take()
            .expect("handle taken while already taken from this PoolEntry")
    }

    /// Puts a previously-taken handle back, e.g. after a liveness probe
    /// that found it alive, or when a client returns it.
    pub(crate) fn restore_handle(&self, conn: M::Connection) {
        let mut guard = self.handle.lock().unwrap();
        assert!(
            guard.is_none(),
            "restoring a handle into a PoolEntry that already has one"
        );
        *guard = Some(conn);
    }

    pub(crate) fn set_eol_task(&self, task: JoinHandle<()>) {
        let mut slot = self.eol_task.lock().unwrap();
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    pub(crate) fn cancel_eol_task(&self) {
        if let Some(task) = self.eol_task.lock().unwrap().take() {
            task.abort();
        }
    }

    pub(crate) fn set_leak_task(&self, task: JoinHandle<()>) {
        let mut slot = self.leak_task.lock().unwrap();
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    pub(crate) fn cancel_leak_task(&self) {
        if let Some(task) = self.leak_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl<M: ManageConnection> Drop for PoolEntry<M> {
    fn drop(&mut self) {
        self.cancel_eol_task();
        self.cancel_leak_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_reserve_and_remove_are_mutually_exclusive() {
        let entry: PoolEntry<crate::test_support::TestManager> = PoolEntry::new(1, 0);
        assert!(entry.try_claim_in_use());
        assert!(!entry.try_claim_in_use());
        assert!(!entry.try_reserve());
        assert!(entry.mark_removed());
        assert!(!entry.mark_removed());
    }

    #[test]
    fn evicted_flag_is_sticky() {
        let entry: PoolEntry<crate::test_support::TestManager> = PoolEntry::new(1, 0);
        assert!(!entry.is_evicted());
        entry.mark_evicted();
        assert!(entry.is_evicted());
    }

    #[test]
    fn touch_updates_last_accessed() {
        let entry: PoolEntry<crate::test_support::TestManager> = PoolEntry::new(1, 100);
        assert_eq!(entry.last_accessed_ms(), 100);
        entry.touch(200);
        assert_eq!(entry.last_accessed_ms(), 200);
    }
}

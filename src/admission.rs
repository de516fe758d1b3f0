//! `SuspendResumeLock`: the admission gate borrows pass through before
//! touching the bag. When suspension is disabled it is a pure no-op; when
//! enabled, `suspend` instantly drains the available permits (no blocking:
//! in-flight borrows already holding a permit are unaffected) and `resume`
//! restores exactly what was drained.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::PoolError;

/// Large enough that the pool will never practically exhaust admission
/// permits through borrow concurrency alone; only an explicit `suspend()`
/// drains them.
const MAX_PERMITS: usize = 65_536;

pub(crate) struct AdmissionGate {
    semaphore: Option<Semaphore>,
    drained: AtomicUsize,
}

impl AdmissionGate {
    pub(crate) fn new(suspendable: bool) -> Self {
        AdmissionGate {
            semaphore: suspendable.then(|| Semaphore::new(MAX_PERMITS)),
            drained: AtomicUsize::new(0),
        }
    }

    /// Blocks until a permit is available (immediately, unless the gate is
    /// currently suspended) or the pool is shut down and the semaphore is
    /// closed out from under the waiter.
    pub(crate) async fn acquire<E>(&self) -> Result<Option<SemaphorePermit<'_>>, PoolError<E>> {
        match &self.semaphore {
            None => Ok(None),
            Some(sem) => match sem.acquire().await {
                Ok(permit) => Ok(Some(permit)),
                Err(_) => Err(PoolError::PoolShutdownError),
            },
        }
    }

    /// Drains every permit not already checked out. Non-blocking: callers
    /// that already hold a permit continue unaffected.
    pub(crate) fn suspend(&self) -> Result<(), PoolError<std::convert::Infallible>> {
        match &self.semaphore {
            None => Err(PoolError::IllegalState(
                "pool suspension is not enabled for this pool",
            )),
            Some(sem) => {
                let available = sem.available_permits();
                sem.forget_permits(available);
                self.drained.store(available, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    pub(crate) fn resume(&self) {
        if let Some(sem) = &self.semaphore {
            let drained = self.drained.swap(0, Ordering::SeqCst);
            if drained > 0 {
                sem.add_permits(drained);
            }
        }
    }

    pub(crate) fn close(&self) {
        if let Some(sem) = &self.semaphore {
            sem.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_gate_never_blocks() {
        let gate = AdmissionGate::new(false);
        let permit = gate.acquire::<std::io::Error>().await.unwrap();
        assert!(permit.is_none());
    }

    #[tokio::test]
    async fn suspend_then_resume_unblocks_waiters() {
        let gate = AdmissionGate::new(true);
        gate.suspend().unwrap();

        let gate = std::sync::Arc::new(gate);
        let waiter_gate = gate.clone();
        let waiter = tokio::spawn(async move { waiter_gate.acquire::<std::io::Error>().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve once resumed")
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn suspend_without_suspension_enabled_is_illegal_state() {
        let gate = AdmissionGate::new(false);
        assert!(matches!(gate.suspend(), Err(PoolError::IllegalState(_))));
    }
}

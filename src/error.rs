//! bagpool's error type.
//!
//! Grounded on the teacher's `RunError<E>`, generalized to the fuller set of
//! error kinds the pool engine can raise (see the error-handling design:
//! recoverable failures are retried internally and never reach here; only
//! the fatal kinds below surface to a caller).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// bagpool's error type.
///
/// `E` is the handle factory's own error type (`ManageConnection::Error`).
///
/// The most recent upstream failure carried by `BorrowTimeout` is wrapped in
/// an `Arc` rather than owned outright: the creator task that observed it
/// keeps producing while a borrow timeout is being assembled, so the error
/// has to be shared, not taken.
#[derive(Error, Debug)]
pub enum PoolError<E> {
    /// The borrow deadline elapsed before a handle became available.
    #[error("timed out after {elapsed:?} waiting for a handle")]
    BorrowTimeout {
        /// Time actually spent waiting.
        elapsed: Duration,
        /// The most recent upstream failure observed while retrying, if any.
        last_upstream_error: Option<Arc<E>>,
    },

    /// The borrowing task was cancelled (the pool was closed out from under it).
    #[error("borrow was interrupted")]
    Interrupted,

    /// Fail-fast initialization could not open or validate the first handle.
    ///
    /// `None` when the factory reported the handle unhealthy without
    /// raising a concrete error (`ManageConnection::validate` returns a
    /// plain `bool`, not a `Result`).
    #[error("pool initialization failed")]
    PoolInitializationError(Option<E>),

    /// A borrow was attempted after `shutdown()` had already completed.
    #[error("pool has been shut down")]
    PoolShutdownError,

    /// An operation was attempted that the pool's current configuration
    /// does not allow (e.g. `suspend()` when suspension is disabled).
    #[error("illegal pool state: {0}")]
    IllegalState(&'static str),
}

impl<E> PoolError<E> {
    pub(crate) fn timeout(elapsed: Duration, last_upstream_error: Option<Arc<E>>) -> Self {
        PoolError::BorrowTimeout {
            elapsed,
            last_upstream_error,
        }
    }
}

impl<E: fmt::Debug> PartialEq for PoolError<E> {
    fn eq(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (PoolError::Interrupted, PoolError::Interrupted)
                | (PoolError::PoolShutdownError, PoolError::PoolShutdownError)
                | (PoolError::BorrowTimeout { .. }, PoolError::BorrowTimeout { .. })
        )
    }
}

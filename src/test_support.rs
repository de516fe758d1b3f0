//! Shared test fixtures: a fake handle factory used by every module's unit
//! tests, so each one doesn't reinvent a counting mock.
#![cfg(test)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::manage::ManageConnection;

#[derive(Debug, Error)]
#[error("test manager failure #{0}")]
pub(crate) struct TestError(pub u64);

/// A handle factory that hands out incrementing integer ids, can be told to
/// fail its next N connects, and can be told to declare handles dead.
#[derive(Debug, Default)]
pub(crate) struct TestManager {
    pub next_id: AtomicU64,
    pub fail_next_n_connects: AtomicUsize,
    pub fail_next_n_validations: AtomicUsize,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub validations: AtomicUsize,
}

impl TestManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManageConnection for TestManager {
    type Connection = u64;
    type Error = TestError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_next_n_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok()
        {
            return Err(TestError(self.next_id.load(Ordering::SeqCst)));
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn validate(&self, _conn: &mut Self::Connection, _timeout: Duration) -> bool {
        self.validations.fetch_add(1, Ordering::SeqCst);
        let consumed_a_failure = self
            .fail_next_n_validations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok();
        !consumed_a_failure
    }

    async fn close(&self, _conn: Self::Connection) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

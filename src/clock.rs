//! Wall-clock time abstraction.
//!
//! The housekeeper needs a wall clock that *can* move backward (an NTP step,
//! a VM being paused and resumed) so it can detect the jump and react.
//! `std::time::Instant` is documented to be monotonic on every platform we
//! care about, which makes it the wrong type for this job. Everything that
//! needs "now" in this crate goes through `ClockSource` instead, so tests can
//! inject a clock that jumps around on command.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock milliseconds since the Unix epoch.
///
/// Implementations are not required to be monotonic; the housekeeper exists
/// precisely to notice when they aren't.
pub trait ClockSource: fmt::Debug + Send + Sync {
    /// The current time, in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;

    /// Milliseconds elapsed since `earlier`, which may be negative if the
    /// clock has moved backward since `earlier` was recorded.
    fn elapsed_millis(&self, earlier: i64) -> i64 {
        self.now_millis() - earlier
    }
}

/// The default clock, backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A clock driven entirely by test code, for exercising retrograde- and
/// forward-leap housekeeping branches without sleeping real time.
#[derive(Debug)]
pub struct TestClock {
    millis: AtomicI64,
}

impl TestClock {
    /// Creates a test clock starting at the given wall-clock millisecond value.
    pub fn new(start_millis: i64) -> Self {
        TestClock {
            millis: AtomicI64::new(start_millis),
        }
    }

    /// Moves the clock forward by `delta_ms` (use a negative value to move it
    /// backward, simulating an OS clock step).
    pub fn advance(&self, delta_ms: i64) {
        self.millis.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Pins the clock to an absolute value.
    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        TestClock::new(0)
    }
}

impl ClockSource for TestClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

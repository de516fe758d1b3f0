//! bagpool: a high-concurrency pool of expensive, reusable handles.
//!
//! Handles (database connections, RPC channels, anything costly to open and
//! safe to reuse) are created by a [`ManageConnection`] the embedder
//! provides, and checked out through a [`Pool`] as a [`PooledHandle`] that
//! returns itself to the pool on drop.
//!
//! ```ignore
//! let pool = Pool::builder()
//!     .maximum_pool_size(10)
//!     .build(my_manager)
//!     .await?;
//! let handle = pool.borrow().await?;
//! ```
//!
//! The borrow fast path is lock-free: a thread-local cache of the caller's
//! own recent returns, then a scan-and-CAS over the shared entry set, and
//! only then a queued wait for the next handle to become available or be
//! created. A single atomic per entry is the only synchronization primitive
//! guarding handoff; see [`mod@entry`] for why that's sufficient.

mod admission;
mod bag;
mod clock;
mod config;
mod creator;
mod engine;
mod entry;
mod error;
mod housekeeper;
mod manage;
mod metrics;
#[cfg(test)]
mod test_support;

pub use clock::{ClockSource, SystemClock, TestClock};
pub use config::{Builder, PoolConfig};
pub use engine::{Pool, PoolStats, PooledHandle};
pub use error::PoolError;
pub use manage::ManageConnection;
pub use metrics::{MetricsSink, NopMetricsSink};

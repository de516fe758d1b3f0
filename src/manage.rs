//! The handle factory trait.
//!
//! This is the external collaborator the pool engine is generic over
//! (§6 of the design: "provided by the embedder"). Grounded on the teacher's
//! `ManageConnection`, extended with the liveness-probe budget and the
//! best-effort `abort` used only during shutdown.

use std::time::Duration;

use async_trait::async_trait;

/// A trait which provides handle-specific functionality: how to open, probe,
/// and close the real resource a `Pool` manages.
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    /// The handle type this manager deals with.
    type Connection: Send + 'static;
    /// The error type returned when opening or validating a handle fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Attempts to open a new handle.
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Synchronous liveness probe, bounded by `timeout`. Returns `true` if
    /// the handle is still usable.
    ///
    /// A manager that cannot probe within `timeout` should treat that as a
    /// failed probe rather than blocking past it.
    async fn validate(&self, conn: &mut Self::Connection, timeout: Duration) -> bool;

    /// Idempotent, exception-swallowing close of a handle no longer in use.
    async fn close(&self, conn: Self::Connection);

    /// Best-effort forced termination of a handle during shutdown. The
    /// default implementation just closes it; managers whose handles support
    /// a harder cancellation (e.g. aborting an in-flight query) can override
    /// this.
    async fn abort(&self, conn: Self::Connection) {
        self.close(conn).await;
    }
}

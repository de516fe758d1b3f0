//! Background handle creation with capped exponential backoff (§4.6).
//!
//! One call to `run_creator` claims one "adder" permit (bounding how many
//! creations can be in flight at once) and retries internally, with backoff,
//! until a handle is produced or the pool stops wanting one; callers never
//! see a failed attempt directly, only its absence from the bag and a
//! record of the last upstream error for `BorrowTimeout` to report.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::engine::PoolEngine;
use crate::entry::PoolEntry;
use crate::manage::ManageConnection;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Repeatedly attempts to open and adopt one new handle, backing off between
/// failures, until it succeeds or the pool no longer wants more (shut down,
/// suspended, or already at `maximumPoolSize`).
pub(crate) async fn run_creator<M: ManageConnection>(engine: Arc<PoolEngine<M>>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if !engine.wants_more_connections() {
            engine.creation_attempt_abandoned();
            return;
        }

        let connect_timeout = engine.config.connection_timeout();
        match timeout(connect_timeout, engine.manager.connect()).await {
            Ok(Ok(conn)) => {
                let now = engine.clock.now_millis();
                let entry = Arc::new(PoolEntry::new(conn, now));
                engine.record_creation_success();
                engine.adopt_new_entry(entry).await;
                return;
            }
            Ok(Err(err)) => engine.record_creation_failure(err),
            Err(_) => tracing::debug!("handle factory connect() timed out while creating"),
        }

        tokio::time::sleep(backoff).await;
        backoff = std::cmp::min(MAX_BACKOFF, std::cmp::min(connect_timeout, backoff.mul_f32(1.5)));
    }
}

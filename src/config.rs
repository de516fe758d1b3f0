//! Recognized pool options (§3) and the builder that validates them at
//! construction time, generalizing the teacher's `Builder<M>`.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::clock::{ClockSource, SystemClock};
use crate::manage::ManageConnection;
use crate::metrics::{MetricsSink, NopMetricsSink};

/// Default wait window (§4.3) within which a recently-returned handle
/// bypasses the liveness probe.
pub const ALIVE_BYPASS_WINDOW: Duration = Duration::from_millis(500);

/// Default housekeeping tick period (§4.5).
pub const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(30);

/// The subset of configuration the housekeeper may refresh on a live pool
/// without requiring a restart. Held behind an `ArcSwap` so readers on the
/// borrow fast path never block on a tick in progress.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MutableConfig {
    pub connection_timeout: Duration,
    pub validation_timeout: Duration,
    pub leak_detection_threshold: Option<Duration>,
}

/// Immutable-for-the-life-of-the-pool configuration plus the current
/// snapshot of the mutable fields.
pub struct PoolConfig {
    pub(crate) minimum_idle: u32,
    pub(crate) maximum_pool_size: u32,
    pub(crate) max_lifetime: Option<Duration>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) allow_pool_suspension: bool,
    pub(crate) initialization_fail_fast: bool,
    pub(crate) housekeeping_period: Duration,
    pub(crate) alive_bypass_window: Duration,
    pub(crate) mutable: ArcSwap<MutableConfig>,
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mutable = self.mutable.load();
        f.debug_struct("PoolConfig")
            .field("minimum_idle", &self.minimum_idle)
            .field("maximum_pool_size", &self.maximum_pool_size)
            .field("connection_timeout", &mutable.connection_timeout)
            .field("validation_timeout", &mutable.validation_timeout)
            .field("max_lifetime", &self.max_lifetime)
            .field("idle_timeout", &self.idle_timeout)
            .field("leak_detection_threshold", &mutable.leak_detection_threshold)
            .field("allow_pool_suspension", &self.allow_pool_suspension)
            .field("initialization_fail_fast", &self.initialization_fail_fast)
            .finish()
    }
}

impl PoolConfig {
    pub(crate) fn connection_timeout(&self) -> Duration {
        self.mutable.load().connection_timeout
    }

    pub(crate) fn validation_timeout(&self) -> Duration {
        self.mutable.load().validation_timeout
    }

    pub(crate) fn leak_detection_threshold(&self) -> Option<Duration> {
        self.mutable.load().leak_detection_threshold
    }

    /// Updates `connectionTimeout`. Picked up by borrows immediately and
    /// reaffirmed by the housekeeper on its next tick.
    pub fn set_connection_timeout(&self, timeout: Duration) {
        self.mutable.rcu(|cur| MutableConfig {
            connection_timeout: timeout,
            ..**cur
        });
    }

    /// Updates `validationTimeout`.
    pub fn set_validation_timeout(&self, timeout: Duration) {
        self.mutable.rcu(|cur| MutableConfig {
            validation_timeout: timeout,
            ..**cur
        });
    }

    /// Updates `leakDetectionThreshold`.
    pub fn set_leak_detection_threshold(&self, threshold: Option<Duration>) {
        self.mutable.rcu(|cur| MutableConfig {
            leak_detection_threshold: threshold,
            ..**cur
        });
    }
}

/// A builder for a connection pool.
pub struct Builder<M: ManageConnection> {
    minimum_idle: Option<u32>,
    maximum_pool_size: u32,
    connection_timeout: Duration,
    validation_timeout: Duration,
    max_lifetime: Option<Duration>,
    idle_timeout: Option<Duration>,
    leak_detection_threshold: Option<Duration>,
    allow_pool_suspension: bool,
    initialization_fail_fast: bool,
    housekeeping_period: Duration,
    alive_bypass_window: Duration,
    metrics_sink: Box<dyn MetricsSink<M>>,
    clock: Arc<dyn ClockSource>,
    _p: PhantomData<M>,
}

impl<M: ManageConnection> fmt::Debug for Builder<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("minimum_idle", &self.minimum_idle)
            .field("maximum_pool_size", &self.maximum_pool_size)
            .field("connection_timeout", &self.connection_timeout)
            .field("validation_timeout", &self.validation_timeout)
            .field("max_lifetime", &self.max_lifetime)
            .field("idle_timeout", &self.idle_timeout)
            .field("leak_detection_threshold", &self.leak_detection_threshold)
            .field("allow_pool_suspension", &self.allow_pool_suspension)
            .field("initialization_fail_fast", &self.initialization_fail_fast)
            .finish()
    }
}

impl<M: ManageConnection> Default for Builder<M> {
    fn default() -> Self {
        Builder {
            minimum_idle: None,
            maximum_pool_size: 10,
            connection_timeout: Duration::from_secs(30),
            validation_timeout: Duration::from_secs(5),
            max_lifetime: Some(Duration::from_secs(30 * 60)),
            idle_timeout: Some(Duration::from_secs(10 * 60)),
            leak_detection_threshold: None,
            allow_pool_suspension: false,
            initialization_fail_fast: false,
            housekeeping_period: HOUSEKEEPING_PERIOD,
            alive_bypass_window: ALIVE_BYPASS_WINDOW,
            metrics_sink: Box::new(NopMetricsSink),
            clock: Arc::new(SystemClock),
            _p: PhantomData,
        }
    }
}

impl<M: ManageConnection> Builder<M> {
    /// Constructs a new `Builder` with default values.
    pub fn new() -> Builder<M> {
        Default::default()
    }

    /// Sets `maximumPoolSize`, the hard cap on live handles.
    ///
    /// Defaults to 10.
    pub fn maximum_pool_size(mut self, max: u32) -> Self {
        assert!(max > 0, "maximum_pool_size must be greater than zero!");
        self.maximum_pool_size = max;
        self
    }

    /// Sets `minimumIdle`, the idle count the housekeeper tries to maintain.
    ///
    /// Defaults to `maximum_pool_size`.
    pub fn minimum_idle(mut self, min_idle: u32) -> Self {
        self.minimum_idle = Some(min_idle);
        self
    }

    /// Sets `connectionTimeout`, the default borrow deadline.
    ///
    /// Defaults to 30 seconds.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        assert!(
            timeout > Duration::from_secs(0),
            "connection_timeout must be non-zero"
        );
        self.connection_timeout = timeout;
        self
    }

    /// Sets `validationTimeout`, the liveness-probe budget.
    ///
    /// Defaults to 5 seconds.
    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        assert!(
            timeout > Duration::from_secs(0),
            "validation_timeout must be non-zero"
        );
        self.validation_timeout = timeout;
        self
    }

    /// Sets `maxLifetime`. `None` disables age-based eviction.
    ///
    /// Defaults to 30 minutes.
    pub fn max_lifetime(mut self, max_lifetime: Option<Duration>) -> Self {
        assert!(
            max_lifetime != Some(Duration::from_secs(0)),
            "max_lifetime must be greater than zero!"
        );
        self.max_lifetime = max_lifetime;
        self
    }

    /// Sets `idleTimeout`. `None` disables idle-based eviction.
    ///
    /// Defaults to 10 minutes.
    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        assert!(
            idle_timeout != Some(Duration::from_secs(0)),
            "idle_timeout must be greater than zero!"
        );
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets `leakDetectionThreshold`. `None` disables leak detection.
    ///
    /// Defaults to `None`.
    pub fn leak_detection_threshold(mut self, threshold: Option<Duration>) -> Self {
        assert!(
            threshold != Some(Duration::from_secs(0)),
            "leak_detection_threshold must be greater than zero!"
        );
        self.leak_detection_threshold = threshold;
        self
    }

    /// Sets `allowPoolSuspension`.
    ///
    /// Defaults to `false`.
    pub fn allow_pool_suspension(mut self, allow: bool) -> Self {
        self.allow_pool_suspension = allow;
        self
    }

    /// Sets `initializationFailFast`: open and validate one handle
    /// synchronously during `build`, failing construction if it can't.
    ///
    /// Defaults to `false`.
    pub fn initialization_fail_fast(mut self, fail_fast: bool) -> Self {
        self.initialization_fail_fast = fail_fast;
        self
    }

    /// Sets the metrics sink. Defaults to `NopMetricsSink`.
    pub fn metrics_sink(mut self, sink: Box<dyn MetricsSink<M>>) -> Self {
        self.metrics_sink = sink;
        self
    }

    /// Overrides the clock source. Intended for tests that need to drive
    /// the housekeeper's retrograde/forward-leap branches deterministically.
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Used by tests to run housekeeping faster than the 30s default.
    #[doc(hidden)]
    pub fn housekeeping_period(mut self, period: Duration) -> Self {
        self.housekeeping_period = period;
        self
    }

    #[doc(hidden)]
    pub fn alive_bypass_window(mut self, window: Duration) -> Self {
        self.alive_bypass_window = window;
        self
    }

    pub(crate) fn wants_fail_fast(&self) -> bool {
        self.initialization_fail_fast
    }

    pub(crate) fn minimum_idle_or_max(&self) -> u32 {
        self.minimum_idle.unwrap_or(self.maximum_pool_size)
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        PoolConfig,
        Box<dyn MetricsSink<M>>,
        Arc<dyn ClockSource>,
    ) {
        assert!(
            self.minimum_idle_or_max() <= self.maximum_pool_size,
            "minimum_idle must be no larger than maximum_pool_size"
        );
        let config = PoolConfig {
            minimum_idle: self.minimum_idle_or_max(),
            maximum_pool_size: self.maximum_pool_size,
            max_lifetime: self.max_lifetime,
            idle_timeout: self.idle_timeout,
            allow_pool_suspension: self.allow_pool_suspension,
            initialization_fail_fast: self.initialization_fail_fast,
            housekeeping_period: self.housekeeping_period,
            alive_bypass_window: self.alive_bypass_window,
            mutable: ArcSwap::from_pointee(MutableConfig {
                connection_timeout: self.connection_timeout,
                validation_timeout: self.validation_timeout,
                leak_detection_threshold: self.leak_detection_threshold,
            }),
        };
        (config, self.metrics_sink, self.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestManager;

    #[test]
    #[should_panic(expected = "maximum_pool_size must be greater than zero")]
    fn rejects_zero_max_size() {
        let _ = Builder::<TestManager>::new().maximum_pool_size(0);
    }

    #[test]
    #[should_panic(expected = "minimum_idle must be no larger")]
    fn rejects_min_idle_above_max() {
        let builder = Builder::<TestManager>::new()
            .maximum_pool_size(2)
            .minimum_idle(5);
        let _ = builder.into_parts();
    }

    #[test]
    fn mutable_fields_update_live() {
        let (config, _, _) = Builder::<TestManager>::new()
            .connection_timeout(Duration::from_secs(1))
            .into_parts();
        assert_eq!(config.connection_timeout(), Duration::from_secs(1));
        config.set_connection_timeout(Duration::from_secs(2));
        assert_eq!(config.connection_timeout(), Duration::from_secs(2));
    }
}

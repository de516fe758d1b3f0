//! The periodic maintenance tick (§4.5): refresh mutable config (a no-op
//! here, since `PoolConfig`'s setters already apply live through the
//! `ArcSwap`), detect retrograde/forward clock jumps, prune idle handles
//! above `minimumIdle`, and top the pool back up.

use std::sync::Arc;

use crate::engine::PoolEngine;
use crate::entry::EntryState;
use crate::manage::ManageConnection;

/// Slack tolerated in the retrograde-clock check (§4.5 step 3) before a
/// short scheduling delay gets mistaken for a clock stepped backward.
const RETROGRADE_SLACK_MS: i64 = 128;

pub(crate) async fn run_housekeeper<M: ManageConnection>(engine: Arc<PoolEngine<M>>) {
    let mut previous_ms = engine.clock.now_millis();
    let mut ticker = tokio::time::interval(engine.config.housekeeping_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if engine.is_shut_down() {
            return;
        }

        let now = engine.clock.now_millis();
        let period_ms = engine.config.housekeeping_period.as_millis() as i64;

        // Retrograde clock detection: last-access stamps are unreliable once
        // the clock has stepped backward, so retire everything rather than
        // risk serving a handle whose freshness we can no longer trust.
        if now + RETROGRADE_SLACK_MS < previous_ms + period_ms {
            tracing::warn!(
                now_ms = now,
                previous_ms,
                "system clock moved backward since the last housekeeping tick; \
                 soft-evicting all pooled handles and refilling"
            );
            previous_ms = now;
            engine.clone().soft_evict_all("retrograde clock jump").await;
            engine.clone().fill_pool().await;
            continue;
        }

        // Forward clock leap: only accelerates natural (lifetime/idle)
        // retirement, so just note it happened.
        if now > previous_ms + (period_ms * 3 / 2) {
            tracing::warn!(
                now_ms = now,
                previous_ms,
                "system clock jumped forward since the last housekeeping tick; \
                 idle and lifetime timers may fire early this round"
            );
        }
        previous_ms = now;

        evict_idle_above_minimum(&engine, now).await;
        engine.clone().fill_pool().await;
    }
}

async fn evict_idle_above_minimum<M: ManageConnection>(engine: &Arc<PoolEngine<M>>, now: i64) {
    let idle_timeout_ms = match engine.config.idle_timeout {
        Some(d) => d.as_millis() as i64,
        None => return,
    };
    let minimum_idle = engine.config.minimum_idle;
    let idle_count = engine.bag.count(EntryState::NotInUse) as u32;
    if idle_count <= minimum_idle {
        return;
    }

    let mut removable = idle_count - minimum_idle;
    let mut idle = engine.bag.values_in_state(EntryState::NotInUse);
    idle.sort_by_key(|entry| entry.last_accessed_ms());

    for entry in idle {
        if removable == 0 {
            break;
        }
        if now - entry.last_accessed_ms() <= idle_timeout_ms {
            continue;
        }
        if engine.bag.reserve(&entry) {
            removable -= 1;
            let conn = entry.take_handle();
            engine.close_claimed_entry(entry, conn, "idle timeout").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::test_support::TestManager;
    use std::time::Duration;

    async fn warm_pool(
        min_idle: u32,
        max_size: u32,
        idle_timeout: Option<Duration>,
        clock: Arc<TestClock>,
    ) -> Arc<PoolEngine<TestManager>> {
        warm_pool_with_period(min_idle, max_size, idle_timeout, clock, Duration::from_secs(3600)).await
    }

    async fn warm_pool_with_period(
        min_idle: u32,
        max_size: u32,
        idle_timeout: Option<Duration>,
        clock: Arc<TestClock>,
        period: Duration,
    ) -> Arc<PoolEngine<TestManager>> {
        let builder = crate::config::Builder::<TestManager>::new()
            .minimum_idle(min_idle)
            .maximum_pool_size(max_size)
            .idle_timeout(idle_timeout)
            .housekeeping_period(period)
            .clock(clock);
        let engine = PoolEngine::new(builder, TestManager::new());
        engine.clone().fill_pool().await;
        wait_until(|| engine.stats().idle as u32 == min_idle).await;
        engine
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn idle_eviction_prunes_down_to_minimum() {
        let clock = Arc::new(TestClock::new(0));
        let engine = warm_pool(2, 5, Some(Duration::from_millis(500)), clock.clone()).await;
        assert_eq!(engine.stats().idle, 2);

        clock.advance(600);
        evict_idle_above_minimum(&engine, clock.now_millis()).await;
        wait_until(|| engine.stats().total == 2).await;
        assert_eq!(engine.stats().idle, 2);
    }

    #[tokio::test]
    async fn idle_eviction_leaves_minimum_untouched_when_fresh() {
        let clock = Arc::new(TestClock::new(0));
        let engine = warm_pool(3, 5, Some(Duration::from_millis(10_000)), clock.clone()).await;
        clock.advance(50);
        evict_idle_above_minimum(&engine, clock.now_millis()).await;
        assert_eq!(engine.stats().total, 3);
        assert_eq!(engine.stats().idle, 3);
    }

    /// Drives the actual `run_housekeeper` loop (not just its helper
    /// functions) under paused tokio time, so the 128ms retrograde-slack
    /// threshold in the real tick is what's under test.
    #[tokio::test(start_paused = true)]
    async fn retrograde_clock_soft_evicts_everything_and_refills() {
        let clock = Arc::new(TestClock::new(100_000));
        let period = Duration::from_millis(100);
        let engine = warm_pool_with_period(2, 2, None, clock.clone(), period).await;
        let original_ids: Vec<u64> = engine.bag.values().iter().map(|e| e.id).collect();

        let housekeeper = tokio::spawn(run_housekeeper(engine.clone()));
        // Let the task record its initial `previous_ms` and park on the
        // first tick before we move the clock out from under it.
        tokio::task::yield_now().await;

        // Step the clock back by much more than the tick period plus slack,
        // then let the next tick observe it.
        clock.advance(-10_000);
        tokio::time::advance(period + Duration::from_millis(10)).await;
        wait_until(|| engine.stats().total == 0).await;
        wait_until(|| engine.stats().idle as u32 == 2).await;

        let new_ids: Vec<u64> = engine.bag.values().iter().map(|e| e.id).collect();
        for id in new_ids {
            assert!(!original_ids.contains(&id), "refill reused an evicted entry id");
        }

        housekeeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn forward_clock_leap_warns_but_does_not_evict() {
        let clock = Arc::new(TestClock::new(100_000));
        let period = Duration::from_millis(100);
        let engine = warm_pool_with_period(2, 2, None, clock.clone(), period).await;
        let original_ids: Vec<u64> = engine.bag.values().iter().map(|e| e.id).collect();

        let housekeeper = tokio::spawn(run_housekeeper(engine.clone()));
        tokio::task::yield_now().await;

        // A forward leap well past 1.5x the period should not touch any entry.
        clock.advance(1_000);
        tokio::time::advance(period + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(engine.stats().total, 2);
        let still_ids: Vec<u64> = engine.bag.values().iter().map(|e| e.id).collect();
        assert_eq!(still_ids, original_ids);

        housekeeper.abort();
    }
}

// =============================================================================
// Schedule Aligner — wall-clock deadlines for the live poller
// =============================================================================
//
// Deadlines are absolute UNIX-millisecond instants derived from the wall clock
// each cycle (`boundary + offset`), and sleeps are `deadline - now` computed at
// the moment of sleeping.  A long cycle therefore never pushes later wakes
// out of alignment.
// =============================================================================

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::retry::sleep_or_cancel;
use crate::types::{now_ms, KlineInterval};

#[derive(Debug, Clone, Copy)]
pub struct ScheduleAligner {
    interval: KlineInterval,
    offset_ms: i64,
    lag_retry_ms: i64,
}

impl ScheduleAligner {
    pub fn new(interval: KlineInterval, offset_ms: i64, lag_retry_ms: i64) -> Self {
        Self {
            interval,
            offset_ms: offset_ms.clamp(0, interval.millis() - 1),
            lag_retry_ms: lag_retry_ms.max(1),
        }
    }

    /// First `boundary + offset` instant strictly after `now_ms`.
    pub fn next_wake(&self, now_ms: i64) -> i64 {
        self.interval.next_boundary(now_ms - self.offset_ms) + self.offset_ms
    }

    /// Short retry used while the exchange lags behind the boundary.
    pub fn retry_wake(&self, now_ms: i64) -> i64 {
        now_ms + self.lag_retry_ms
    }

    /// Open time of the interval that has just completed at `now_ms`.
    pub fn target_open_time(&self, now_ms: i64) -> i64 {
        self.interval.last_closed_open_time(now_ms)
    }

    pub fn interval(&self) -> KlineInterval {
        self.interval
    }
}

/// Time left until `deadline_ms`, zero if it has passed.
pub fn until(deadline_ms: i64, now_ms: i64) -> Duration {
    Duration::from_millis((deadline_ms - now_ms).max(0) as u64)
}

/// Sleep until the wall clock reaches `deadline_ms`. Returns `false` if
/// cancelled first.
pub async fn sleep_until_wall(deadline_ms: i64, cancel: &CancellationToken) -> bool {
    sleep_or_cancel(until(deadline_ms, now_ms()), cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-01-01T12:00:00Z
    const NOON: i64 = 1_704_110_400_000;
    const MIN: i64 = 60_000;

    fn aligner() -> ScheduleAligner {
        ScheduleAligner::new(KlineInterval::Min1, 4_000, 2_000)
    }

    #[test]
    fn wake_is_next_boundary_plus_offset() {
        let a = aligner();
        // Just after a poll at 12:01:05 the next wake is 12:02:04.
        assert_eq!(a.next_wake(NOON + MIN + 5_000), NOON + 2 * MIN + 4_000);
        // Started at 12:01:02, the 12:01 boundary's wake has not passed yet.
        assert_eq!(a.next_wake(NOON + MIN + 2_000), NOON + MIN + 4_000);
        // Exactly on a wake instant, the next one is a full interval later.
        assert_eq!(a.next_wake(NOON + MIN + 4_000), NOON + 2 * MIN + 4_000);
    }

    #[test]
    fn wake_does_not_drift_after_a_long_cycle() {
        let a = aligner();
        // A cycle that overran to 12:01:50 still wakes at 12:02:04.
        assert_eq!(a.next_wake(NOON + MIN + 50_000), NOON + 2 * MIN + 4_000);
        // One that overran past the next boundary skips to the following.
        assert_eq!(a.next_wake(NOON + 2 * MIN + 30_000), NOON + 3 * MIN + 4_000);
    }

    #[test]
    fn retry_is_sub_interval() {
        let a = aligner();
        let now = NOON + 2 * MIN + 4_000;
        assert_eq!(a.retry_wake(now), now + 2_000);
        assert!(a.retry_wake(now) < a.next_wake(now));
    }

    #[test]
    fn target_is_interval_that_just_closed() {
        let a = aligner();
        assert_eq!(a.target_open_time(NOON + 2 * MIN + 4_000), NOON + MIN);
    }

    #[test]
    fn until_clamps_past_deadlines() {
        assert_eq!(until(1_000, 400), Duration::from_millis(600));
        assert_eq!(until(1_000, 5_000), Duration::ZERO);
    }

    #[tokio::test]
    async fn past_deadline_returns_immediately() {
        let cancel = CancellationToken::new();
        assert!(sleep_until_wall(now_ms() - 1_000, &cancel).await);
    }

    #[tokio::test]
    async fn cancelled_sleep_returns_false() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep_until_wall(now_ms() + 60_000, &cancel).await);
    }
}

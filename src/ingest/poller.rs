// =============================================================================
// Live Poller — wall-clock aligned REST polling of finalized candles
// =============================================================================
//
// State machine (no terminal state other than cancellation):
//
//   Sleeping ──deadline──▶ Fetching ──closed candle present──▶ Inserted
//       ▲                     │                                   │
//       │                     └──provider lag / fetch error──▶ DeferredRetry
//       └──── next boundary + offset ◀── Inserted
//       └──── now + lag_retry        ◀── DeferredRetry
//
// The store maximum is read fresh every cycle because the stream listener
// may have inserted the same candle in the meantime.  A current maximum only
// skips the fetch when the whole poll window is present; any hole inside the
// window is refetched and filled.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backfill::Backfill;
use super::schedule::{sleep_until_wall, ScheduleAligner};
use super::source::KlineSource;
use crate::runtime_config::IngestConfig;
use crate::store::StoreGate;
use crate::types::{fmt_ms, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Sleeping { until_ms: i64 },
    Fetching,
    Inserted { rows: usize },
    DeferredRetry,
}

/// Result of one `Fetching` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The just-closed interval is in the store; `rows` were written now.
    Inserted { rows: usize, target: i64 },
    /// The exchange has not published the just-closed interval yet.
    Deferred { target: i64 },
}

impl PollerState {
    /// State entered when a `Fetching` step returns `outcome`.
    pub fn after_fetch(outcome: PollOutcome) -> Self {
        match outcome {
            PollOutcome::Inserted { rows, .. } => Self::Inserted { rows },
            PollOutcome::Deferred { .. } => Self::DeferredRetry,
        }
    }
}

pub struct LivePoller<S> {
    symbol: String,
    window: u32,
    aligner: ScheduleAligner,
    source: Arc<S>,
    gate: StoreGate,
    backfill: Backfill<S>,
}

impl<S: KlineSource> LivePoller<S> {
    pub fn new(cfg: &IngestConfig, source: Arc<S>, gate: StoreGate) -> Self {
        Self {
            symbol: cfg.symbol.clone(),
            window: cfg.poll_window.max(1),
            aligner: ScheduleAligner::new(cfg.interval, cfg.poll_offset_ms, cfg.lag_retry_ms),
            backfill: Backfill::new(cfg, Arc::clone(&source), gate.clone()),
            source,
            gate,
        }
    }

    #[cfg(test)]
    pub fn aligner(&self) -> &ScheduleAligner {
        &self.aligner
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            symbol = %self.symbol,
            interval = %self.aligner.interval(),
            window = self.window,
            "live poller started"
        );

        let mut state = PollerState::Sleeping {
            until_ms: self.aligner.next_wake(now_ms()),
        };

        loop {
            state = match state {
                PollerState::Sleeping { until_ms } => {
                    debug!(symbol = %self.symbol, wake_at = %fmt_ms(until_ms), "poller sleeping");
                    if !sleep_until_wall(until_ms, &cancel).await {
                        break;
                    }
                    PollerState::Fetching
                }
                PollerState::Fetching => match self.poll_cycle(now_ms(), &cancel).await {
                    Ok(outcome) => {
                        match outcome {
                            PollOutcome::Inserted { rows, target } => {
                                debug!(symbol = %self.symbol, rows, target = %fmt_ms(target), "poll cycle complete");
                            }
                            PollOutcome::Deferred { target } => {
                                debug!(symbol = %self.symbol, target = %fmt_ms(target), "closed interval not published yet");
                            }
                        }
                        PollerState::after_fetch(outcome)
                    }
                    Err(e) if cancel.is_cancelled() => {
                        debug!(error = %e, "poll interrupted by shutdown");
                        break;
                    }
                    Err(e) => {
                        warn!(symbol = %self.symbol, error = %format!("{e:#}"), "poll cycle failed");
                        PollerState::DeferredRetry
                    }
                },
                settled => self.next_state(settled, now_ms()),
            };
        }

        info!(symbol = %self.symbol, "live poller stopped");
    }

    /// Transition out of a state that does not do I/O itself.
    pub fn next_state(&self, state: PollerState, now_ms: i64) -> PollerState {
        match state {
            PollerState::Inserted { rows } => {
                debug!(symbol = %self.symbol, rows, "interval settled");
                PollerState::Sleeping {
                    until_ms: self.aligner.next_wake(now_ms),
                }
            }
            PollerState::DeferredRetry => PollerState::Sleeping {
                until_ms: self.aligner.retry_wake(now_ms),
            },
            PollerState::Sleeping { .. } => PollerState::Fetching,
            PollerState::Fetching => PollerState::Fetching,
        }
    }

    /// One `Fetching` step evaluated at wall-clock `now_ms`.
    pub async fn poll_cycle(&self, now_ms: i64, cancel: &CancellationToken) -> Result<PollOutcome> {
        let target = self.aligner.target_open_time(now_ms);
        let step = self.aligner.interval().millis();
        let window = self.window as i64;

        let since = target - (window - 1) * step;

        let max = self.gate.max_finalized_open_time(&self.symbol).await?;
        match max {
            Some(m) if m >= target => {
                // Usually the stream listener wrote it. The maximum alone does
                // not prove the window is contiguous, so count it.
                let held = self
                    .gate
                    .count_finalized_between(&self.symbol, since, target)
                    .await?;
                if held >= window as u64 {
                    return Ok(PollOutcome::Inserted { rows: 0, target });
                }
                debug!(
                    symbol = %self.symbol,
                    held,
                    window,
                    "poll window has holes below the store maximum, refetching"
                );
            }
            Some(m) if target - m <= window * step => {}
            _ => {
                info!(
                    symbol = %self.symbol,
                    store_max = ?max.map(fmt_ms),
                    target = %fmt_ms(target),
                    "store too far behind for the poll window, repairing via backfill"
                );
                let report = self.backfill.run(now_ms, cancel).await?;
                let after = self.gate.max_finalized_open_time(&self.symbol).await?;
                return Ok(if after.is_some_and(|m| m >= target) {
                    PollOutcome::Inserted { rows: report.inserted, target }
                } else {
                    PollOutcome::Deferred { target }
                });
            }
        }

        let rows = self
            .source
            .fetch_klines(&self.symbol, self.aligner.interval(), Some(since), self.window)
            .await?;

        let closed: Vec<_> = rows.into_iter().filter(|c| c.open_time <= target).collect();
        let published = closed.iter().any(|c| c.open_time == target);
        if !published && max.map_or(true, |m| m < target) {
            return Ok(PollOutcome::Deferred { target });
        }

        // Rows older than the maximum are written too, so a hole left while
        // neither loop was watching gets filled.
        let inserted = self.gate.insert_missing(&self.symbol, closed).await?;
        if inserted > 0 {
            info!(symbol = %self.symbol, rows = inserted, open_time = %fmt_ms(target), "poller inserted candles");
        }
        Ok(PollOutcome::Inserted { rows: inserted, target })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::source::testing::SyntheticExchange;
    use crate::types::{InsertOutcome, KlineInterval};

    // 2024-01-01T12:00:00Z
    const NOON: i64 = 1_704_110_400_000;
    const MIN: i64 = 60_000;

    fn config() -> IngestConfig {
        IngestConfig {
            symbol: "BTCUSDT".into(),
            store_url: ":memory:".into(),
            poll_window: 5,
            poll_offset_ms: 4_000,
            lag_retry_ms: 2_000,
            page_pause_ms: 0,
            fetch_retry_delay_ms: 1,
            fetch_max_attempts: Some(2),
            ..IngestConfig::default()
        }
    }

    async fn seeded(up_to: i64) -> StoreGate {
        let gate = StoreGate::in_memory().unwrap();
        for i in 0..10 {
            let t = up_to - i * MIN;
            gate.insert_finalized_if_new(SyntheticExchange::candle_at("BTCUSDT", t))
                .await
                .unwrap();
        }
        gate
    }

    #[tokio::test]
    async fn wake_with_published_candle_inserts_exactly_one_row() {
        // Store ends at 12:00:00; the 12:01 candle closed at 12:02:00.
        let wake = NOON + 2 * MIN + 4_000;
        let gate = seeded(NOON).await;
        let ex = Arc::new(SyntheticExchange::new(KlineInterval::Min1, NOON - 100 * MIN, wake));
        let poller = LivePoller::new(&config(), ex, gate.clone());

        let outcome = poller.poll_cycle(wake, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, PollOutcome::Inserted { rows: 1, target: NOON + MIN });
        assert_eq!(gate.max_finalized_open_time("BTCUSDT").await.unwrap(), Some(NOON + MIN));
        assert_eq!(gate.count_finalized("BTCUSDT").await.unwrap(), 11);
        assert_eq!(poller.aligner().next_wake(wake), NOON + 3 * MIN + 4_000);
    }

    #[tokio::test]
    async fn provider_lag_defers_with_short_retry() {
        let wake = NOON + 2 * MIN + 4_000;
        let gate = seeded(NOON).await;
        let ex = Arc::new(SyntheticExchange::new(KlineInterval::Min1, NOON - 100 * MIN, wake));
        ex.lag_until(NOON);
        let poller = LivePoller::new(&config(), ex, gate.clone());

        let outcome = poller.poll_cycle(wake, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, PollOutcome::Deferred { target: NOON + MIN });
        assert_eq!(gate.count_finalized("BTCUSDT").await.unwrap(), 10);
        let retry = poller.aligner().retry_wake(wake);
        assert_eq!(retry, wake + 2_000);
        assert!(retry < NOON + 3 * MIN);
    }

    #[tokio::test]
    async fn candle_already_inserted_by_stream_is_not_refetched() {
        let wake = NOON + 2 * MIN + 4_000;
        let gate = seeded(NOON).await;
        let ex = Arc::new(SyntheticExchange::new(KlineInterval::Min1, NOON - 100 * MIN, wake));
        let poller = LivePoller::new(&config(), ex.clone(), gate.clone());

        // The listener got there first.
        let streamed = SyntheticExchange::candle_at("BTCUSDT", NOON + MIN);
        assert_eq!(gate.insert_finalized_if_new(streamed).await.unwrap(), InsertOutcome::Inserted);

        let outcome = poller.poll_cycle(wake, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PollOutcome::Inserted { rows: 0, target: NOON + MIN });
        assert_eq!(ex.calls(), 0);
        assert_eq!(gate.count_finalized("BTCUSDT").await.unwrap(), 11);
    }

    #[tokio::test]
    async fn window_fills_several_missed_intervals() {
        // Three intervals behind, still inside a five-row window.
        let wake = NOON + 4 * MIN + 4_000;
        let gate = seeded(NOON).await;
        let ex = Arc::new(SyntheticExchange::new(KlineInterval::Min1, NOON - 100 * MIN, wake));
        let poller = LivePoller::new(&config(), ex, gate.clone());

        let outcome = poller.poll_cycle(wake, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PollOutcome::Inserted { rows: 3, target: NOON + 3 * MIN });

        let rows = gate.finalized_range("BTCUSDT", NOON, i64::MAX).await.unwrap();
        let times: Vec<i64> = rows.iter().map(|c| c.open_time).collect();
        assert_eq!(times, vec![NOON, NOON + MIN, NOON + 2 * MIN, NOON + 3 * MIN]);
    }

    #[tokio::test]
    async fn large_gap_is_repaired_through_backfill() {
        let wake = NOON + 30 * MIN + 4_000;
        let gate = seeded(NOON).await;
        let ex = Arc::new(SyntheticExchange::new(KlineInterval::Min1, NOON - 100 * MIN, wake));
        let poller = LivePoller::new(&config(), ex, gate.clone());

        let outcome = poller.poll_cycle(wake, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PollOutcome::Inserted { rows: 29, target: NOON + 29 * MIN });

        let rows = gate.finalized_range("BTCUSDT", 0, i64::MAX).await.unwrap();
        for w in rows.windows(2) {
            assert_eq!(w[1].open_time - w[0].open_time, MIN);
        }
    }

    #[tokio::test]
    async fn hole_below_a_streamed_maximum_is_filled() {
        // Startup backfill begins at 11:59:58 and only covers up to 11:58.
        let start = NOON - 2_000;
        let ex = Arc::new(SyntheticExchange::new(KlineInterval::Min1, NOON - 100 * MIN, start));
        let gate = StoreGate::in_memory().unwrap();
        let cfg = IngestConfig {
            backfill_lookback: 30,
            ..config()
        };
        Backfill::new(&cfg, ex.clone(), gate.clone())
            .run(start, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(gate.max_finalized_open_time("BTCUSDT").await.unwrap(), Some(NOON - 2 * MIN));

        // The loops start late: 11:59 closed unobserved, the stream then
        // delivers 12:00.
        gate.insert_finalized_if_new(SyntheticExchange::candle_at("BTCUSDT", NOON))
            .await
            .unwrap();

        let wake = NOON + MIN + 4_000;
        ex.set_now(wake);
        let poller = LivePoller::new(&cfg, ex.clone(), gate.clone());
        let outcome = poller.poll_cycle(wake, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, PollOutcome::Inserted { rows: 1, target: NOON });
        let rows = gate.finalized_range("BTCUSDT", 0, i64::MAX).await.unwrap();
        assert_eq!(rows.len(), 32);
        for w in rows.windows(2) {
            assert_eq!(w[1].open_time - w[0].open_time, MIN, "gap in stored candles");
        }

        // Once the window is whole again the poller goes back to skipping.
        let calls = ex.calls();
        let again = poller.poll_cycle(wake + 1_000, &CancellationToken::new()).await.unwrap();
        assert_eq!(again, PollOutcome::Inserted { rows: 0, target: NOON });
        assert_eq!(ex.calls(), calls);
    }

    #[test]
    fn fetch_outcomes_map_to_states() {
        assert_eq!(
            PollerState::after_fetch(PollOutcome::Inserted { rows: 2, target: NOON }),
            PollerState::Inserted { rows: 2 }
        );
        assert_eq!(
            PollerState::after_fetch(PollOutcome::Deferred { target: NOON }),
            PollerState::DeferredRetry
        );
    }

    #[tokio::test]
    async fn lag_then_publish_walks_the_state_machine() {
        let wake = NOON + 2 * MIN + 4_000;
        let gate = seeded(NOON).await;
        let ex = Arc::new(SyntheticExchange::new(KlineInterval::Min1, NOON - 100 * MIN, wake));
        ex.lag_until(NOON);
        let poller = LivePoller::new(&config(), ex.clone(), gate.clone());
        let cancel = CancellationToken::new();

        assert_eq!(
            poller.next_state(PollerState::Sleeping { until_ms: wake }, wake),
            PollerState::Fetching
        );

        // Not published yet: short retry, well before the next boundary.
        let state = PollerState::after_fetch(poller.poll_cycle(wake, &cancel).await.unwrap());
        assert_eq!(state, PollerState::DeferredRetry);
        let state = poller.next_state(state, wake + 150);
        assert_eq!(state, PollerState::Sleeping { until_ms: wake + 2_150 });

        // Published on the retry: back to the boundary-aligned schedule.
        ex.lag_until(i64::MAX);
        let retry = wake + 2_150;
        let state = PollerState::after_fetch(poller.poll_cycle(retry, &cancel).await.unwrap());
        assert_eq!(state, PollerState::Inserted { rows: 1 });
        let state = poller.next_state(state, retry + 40);
        assert_eq!(state, PollerState::Sleeping { until_ms: NOON + 3 * MIN + 4_000 });
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let gate = StoreGate::in_memory().unwrap();
        let now = now_ms();
        let ex = Arc::new(SyntheticExchange::new(KlineInterval::Min1, now - 100 * MIN, now));
        let poller = LivePoller::new(&config(), ex, gate);

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { poller.run(cancel).await })
        };
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
    }
}

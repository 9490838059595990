// =============================================================================
// Backfill Fetcher — paginated history fetch that seeds or repairs the store
// =============================================================================
//
// Walks backwards from the last closed interval one page at a time:
//
//   page 1:  since = target - (page_size - 1) * interval      (ends at target)
//   page n:  since = earliest(page n-1) - page_size * interval
//
// Pages are merged by open time, so the result is strictly ascending and free
// of duplicates.  Any failure restarts the whole walk after a fixed delay.
// Only rows newer than the store's maximum are written, which makes repeated
// runs idempotent.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::{sleep_or_cancel, Cancelled, RetryPolicy};
use super::source::KlineSource;
use crate::runtime_config::IngestConfig;
use crate::store::StoreGate;
use crate::types::{fmt_ms, Candle, KlineInterval};

/// What a backfill run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Intervals the run tried to cover.
    pub wanted: usize,
    /// Closed candles returned by the provider after merging.
    pub fetched: usize,
    /// Rows written to the store.
    pub inserted: usize,
    /// `(before, after)` open times around each run of missing intervals.
    pub holes: Vec<(i64, i64)>,
}

pub struct Backfill<S> {
    symbol: String,
    interval: KlineInterval,
    lookback: usize,
    page_size: u32,
    pages_per_pause: u32,
    page_pause: Duration,
    retry: RetryPolicy,
    source: Arc<S>,
    gate: StoreGate,
}

impl<S: KlineSource> Backfill<S> {
    pub fn new(cfg: &IngestConfig, source: Arc<S>, gate: StoreGate) -> Self {
        Self {
            symbol: cfg.symbol.clone(),
            interval: cfg.interval,
            lookback: cfg.backfill_lookback,
            page_size: cfg.page_size.max(1),
            pages_per_pause: cfg.pages_per_pause.max(1),
            page_pause: cfg.page_pause(),
            retry: RetryPolicy {
                delay: cfg.fetch_retry_delay(),
                max_attempts: cfg.fetch_max_attempts,
            },
            source,
            gate,
        }
    }

    /// Fill the store from its latest finalized candle (or `lookback`
    /// intervals back, when empty) up to the last interval closed at `now_ms`.
    pub async fn run(&self, now_ms: i64, cancel: &CancellationToken) -> Result<BackfillReport> {
        let target = self.interval.last_closed_open_time(now_ms);
        let step = self.interval.millis();

        let wanted = match self.gate.max_finalized_open_time(&self.symbol).await? {
            Some(max) if max >= target => {
                debug!(symbol = %self.symbol, max = %fmt_ms(max), "store already current, nothing to backfill");
                return Ok(BackfillReport::default());
            }
            Some(max) => ((target - max) / step) as usize,
            None => self.lookback,
        };
        if wanted == 0 {
            return Ok(BackfillReport::default());
        }

        info!(
            symbol = %self.symbol,
            interval = %self.interval,
            wanted,
            until = %fmt_ms(target),
            "backfill started"
        );

        let candles = self
            .retry
            .run("backfill fetch", cancel, || self.fetch_history(target, wanted, cancel))
            .await?;

        let holes = find_holes(&candles, step);
        for (before, after) in &holes {
            warn!(
                symbol = %self.symbol,
                after = %fmt_ms(*before),
                before = %fmt_ms(*after),
                missing = (after - before) / step - 1,
                "upstream history has a hole"
            );
        }

        let fetched = candles.len();
        let inserted = self.gate.insert_newer_than_max(&self.symbol, candles).await?;

        info!(symbol = %self.symbol, fetched, inserted, "backfill finished");
        Ok(BackfillReport {
            wanted,
            fetched,
            inserted,
            holes,
        })
    }

    /// The `wanted` most recent closed candles ending at `target`, ascending.
    async fn fetch_history(
        &self,
        target: i64,
        wanted: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candle>> {
        let step = self.interval.millis();
        let page = self.page_size as i64;

        let mut merged: BTreeMap<i64, Candle> = BTreeMap::new();
        let mut since = target - (page - 1) * step;
        let mut prev_earliest: Option<i64> = None;
        let mut pages: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }

            let rows = self
                .source
                .fetch_klines(&self.symbol, self.interval, Some(since), self.page_size)
                .await?;
            pages += 1;

            let closed: Vec<Candle> = rows
                .into_iter()
                .filter(|c| c.open_time <= target && self.interval.is_aligned(c.open_time))
                .collect();

            let Some(earliest) = closed.iter().map(|c| c.open_time).min() else {
                debug!(symbol = %self.symbol, since = %fmt_ms(since), "empty page, start of history reached");
                break;
            };

            for c in closed {
                merged.insert(c.open_time, c);
            }
            debug!(
                symbol = %self.symbol,
                page = pages,
                earliest = %fmt_ms(earliest),
                collected = merged.len(),
                "backfill page merged"
            );

            if merged.len() >= wanted {
                break;
            }
            if prev_earliest.is_some_and(|prev| earliest >= prev) {
                debug!(symbol = %self.symbol, "page made no backward progress, stopping");
                break;
            }
            prev_earliest = Some(earliest);
            since = earliest - page * step;

            let pause_due = pages % self.pages_per_pause == 0;
            if pause_due || self.source.is_throttled() {
                debug!(pages, pause_ms = self.page_pause.as_millis() as u64, "rate-limit pause");
                if !sleep_or_cancel(self.page_pause, cancel).await {
                    return Err(Cancelled.into());
                }
            }
        }

        let skip = merged.len().saturating_sub(wanted);
        Ok(merged.into_values().skip(skip).collect())
    }
}

/// Consecutive pairs in an ascending run that are more than one step apart.
pub fn find_holes(candles: &[Candle], step: i64) -> Vec<(i64, i64)> {
    candles
        .windows(2)
        .filter(|w| w[1].open_time - w[0].open_time != step)
        .map(|w| (w[0].open_time, w[1].open_time))
        .collect()
}

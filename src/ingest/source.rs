use std::future::Future;

use anyhow::Result;

use crate::types::{Candle, KlineInterval};

/// Paginated OHLC history provider used by the backfill and the live poller.
///
/// `since_ms` is the open time of the first row wanted; `None` asks for the
/// most recent `limit` rows. Rows come back sorted by open time and may
/// include the interval that is still forming.
pub trait KlineSource: Send + Sync {
    fn fetch_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        since_ms: Option<i64>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Candle>>> + Send;

    /// Whether the provider asked us to slow down.
    fn is_throttled(&self) -> bool {
        false
    }
}

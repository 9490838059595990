// =============================================================================
// Binance Futures REST Client — public continuous-kline queries
// =============================================================================
//
// Only public market-data endpoints are used, so requests are unsigned.  Every
// response feeds `X-MBX-USED-WEIGHT-1M` into the shared rate-limit tracker.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use super::rate_limit::{klines_weight, RateLimitTracker};
use crate::ingest::source::KlineSource;
use crate::types::{Candle, KlineInterval};

/// Contract type for the continuous-kline endpoints.
const CONTRACT_TYPE: &str = "PERPETUAL";

/// Binance USDⓈ-M futures REST client.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a client against `base_url` (e.g. `https://fapi.binance.com`).
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            base_url,
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/continuousKlines (public — no signature required).
    ///
    /// With `since_ms` the page starts at that open time and runs forward;
    /// without it the exchange returns the most recent `limit` rows, the last
    /// of which is usually still forming.
    #[instrument(skip(self), name = "binance::continuous_klines")]
    pub async fn continuous_klines(
        &self,
        pair: &str,
        interval: KlineInterval,
        since_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let url = klines_url(&self.base_url, pair, interval, since_ms, limit);

        if !self.rate_limit.can_send_request(klines_weight(limit)) {
            warn!(pair, "sending klines request while over the soft weight budget");
        }

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/continuousKlines request failed")?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse continuousKlines response")?;

        if !status.is_success() {
            anyhow::bail!(
                "Binance GET /fapi/v1/continuousKlines returned {}: {}",
                status,
                body
            );
        }

        let candles = parse_klines(pair, &body)?;
        debug!(pair, interval = %interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

impl KlineSource for BinanceClient {
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        since_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        self.continuous_klines(symbol, interval, since_ms, limit).await
    }

    fn is_throttled(&self) -> bool {
        self.rate_limit.is_near_limit()
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Request / response helpers
// -----------------------------------------------------------------------------

fn klines_url(
    base_url: &str,
    pair: &str,
    interval: KlineInterval,
    since_ms: Option<i64>,
    limit: u32,
) -> String {
    let mut url = format!(
        "{base_url}/fapi/v1/continuousKlines?pair={pair}&contractType={CONTRACT_TYPE}&interval={interval}&limit={limit}"
    );
    if let Some(since) = since_ms {
        url.push_str(&format!("&startTime={since}"));
    }
    url
}

/// Parse Binance's array-of-arrays kline payload, sorted by open time.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, ...
fn parse_klines(symbol: &str, body: &serde_json::Value) -> Result<Vec<Candle>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut candles = Vec::with_capacity(raw.len());

    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;

        if arr.len() < 6 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        let open_time = arr[0].as_i64().context("kline open time is not an integer")?;

        candles.push(Candle {
            symbol: symbol.to_string(),
            open_time,
            open: parse_str_f64(&arr[1])?,
            high: parse_str_f64(&arr[2])?,
            low: parse_str_f64(&arr[3])?,
            close: parse_str_f64(&arr[4])?,
            volume: parse_str_f64(&arr[5])?,
        });
    }

    candles.sort_by_key(|c| c.open_time);
    Ok(candles)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
pub(crate) fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

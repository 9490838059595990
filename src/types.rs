// =============================================================================
// Shared types used across the candle ingestion service
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A finalized OHLCV candle. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    /// Interval start, UNIX milliseconds (UTC), aligned to the interval.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// The exchange's latest view of the still-forming interval. One per symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialCandle {
    pub symbol: String,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Exchange event timestamp of the frame that produced this state.
    pub event_time: i64,
}

/// Outcome of a finalized-candle insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Outcome of a partial-candle upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialOutcome {
    Applied,
    /// The stored row already had an equal or newer `event_time`.
    Stale,
}

// ---------------------------------------------------------------------------
// KlineInterval
// ---------------------------------------------------------------------------

/// Candle duration supported by the ingestion loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KlineInterval {
    Min1,
    Min3,
    Min5,
    Min15,
    Min30,
    Hour1,
    Hour2,
    Hour4,
}

impl KlineInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Min1 => "1m",
            Self::Min3 => "3m",
            Self::Min5 => "5m",
            Self::Min15 => "15m",
            Self::Min30 => "30m",
            Self::Hour1 => "1h",
            Self::Hour2 => "2h",
            Self::Hour4 => "4h",
        }
    }

    pub fn minutes(&self) -> i64 {
        match self {
            Self::Min1 => 1,
            Self::Min3 => 3,
            Self::Min5 => 5,
            Self::Min15 => 15,
            Self::Min30 => 30,
            Self::Hour1 => 60,
            Self::Hour2 => 120,
            Self::Hour4 => 240,
        }
    }

    pub fn millis(&self) -> i64 {
        self.minutes() * 60_000
    }

    /// Start of the interval containing `ts_ms`.
    pub fn floor(&self, ts_ms: i64) -> i64 {
        ts_ms.div_euclid(self.millis()) * self.millis()
    }

    /// Open time of the most recent interval that has fully elapsed at `now_ms`.
    ///
    /// An interval `[t, t + len)` is closed once `now_ms >= t + len`, so at an
    /// exact boundary the interval that just ended counts as closed.
    pub fn last_closed_open_time(&self, now_ms: i64) -> i64 {
        self.floor(now_ms) - self.millis()
    }

    /// First interval boundary strictly after `now_ms`.
    pub fn next_boundary(&self, now_ms: i64) -> i64 {
        self.floor(now_ms) + self.millis()
    }

    pub fn is_aligned(&self, ts_ms: i64) -> bool {
        ts_ms.rem_euclid(self.millis()) == 0
    }
}

impl Default for KlineInterval {
    fn default() -> Self {
        Self::Min1
    }
}

impl std::fmt::Display for KlineInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KlineInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1m" => Ok(Self::Min1),
            "3m" => Ok(Self::Min3),
            "5m" => Ok(Self::Min5),
            "15m" => Ok(Self::Min15),
            "30m" => Ok(Self::Min30),
            "1h" | "60m" => Ok(Self::Hour1),
            "2h" => Ok(Self::Hour2),
            "4h" => Ok(Self::Hour4),
            other => Err(format!("unsupported kline interval '{other}'")),
        }
    }
}

impl TryFrom<String> for KlineInterval {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KlineInterval> for String {
    fn from(value: KlineInterval) -> Self {
        value.as_str().to_string()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Normalise `BTC/USDT`, `btcusdt`, ` BTC-USDT ` to `BTCUSDT`.
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Current wall-clock time in UNIX milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// RFC 3339 rendering of a millisecond timestamp, for log fields.
pub fn fmt_ms(ts_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| ts_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-01-01T12:00:00Z
    const NOON: i64 = 1_704_110_400_000;

    #[test]
    fn parse_intervals() {
        assert_eq!("1m".parse::<KlineInterval>().unwrap(), KlineInterval::Min1);
        assert_eq!(" 1H ".parse::<KlineInterval>().unwrap(), KlineInterval::Hour1);
        assert!("7m".parse::<KlineInterval>().is_err());
    }

    #[test]
    fn last_closed_excludes_forming_interval() {
        let iv = KlineInterval::Min1;
        // 12:01:04 -> the 12:00 candle closed at 12:01:00, 12:01 is still forming.
        assert_eq!(iv.last_closed_open_time(NOON + 64_000), NOON);
        // Exactly on the boundary the interval that just ended is closed.
        assert_eq!(iv.last_closed_open_time(NOON + 60_000), NOON);
    }

    #[test]
    fn next_boundary_is_strictly_after_now() {
        let iv = KlineInterval::Min1;
        assert_eq!(iv.next_boundary(NOON), NOON + 60_000);
        assert_eq!(iv.next_boundary(NOON + 59_999), NOON + 60_000);
        assert_eq!(KlineInterval::Min5.next_boundary(NOON + 61_000), NOON + 300_000);
    }

    #[test]
    fn symbol_normalisation() {
        assert_eq!(normalize_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(normalize_symbol(" ethusdt "), "ETHUSDT");
        assert_eq!(normalize_symbol("sol-usdt"), "SOLUSDT");
    }

    #[test]
    fn interval_serde_uses_exchange_notation() {
        let json = serde_json::to_string(&KlineInterval::Min15).unwrap();
        assert_eq!(json, "\"15m\"");
        let back: KlineInterval = serde_json::from_str("\"4h\"").unwrap();
        assert_eq!(back, KlineInterval::Hour4);
    }

    #[test]
    fn fmt_ms_renders_utc() {
        assert_eq!(fmt_ms(NOON), "2024-01-01T12:00:00Z");
    }
}

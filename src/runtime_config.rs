// =============================================================================
// Runtime Configuration — ingestion settings from file, environment and CLI
// =============================================================================
//
// Precedence (lowest to highest): serde defaults, optional JSON file,
// `CANDLE_*` environment variables, command-line flags.  All fields carry
// `#[serde(default)]` so a partial JSON file always loads.
//
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::types::{normalize_symbol, KlineInterval};

/// Largest page the continuous-klines endpoint serves.
pub const MAX_PAGE_SIZE: u32 = 1500;

/// Startup configuration problems. Any of these stops the process.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no trading symbol given (pass it as the first argument or set CANDLE_SYMBOL)")]
    MissingSymbol,
    #[error("no store connection configured (set CANDLE_STORE_URL to a directory or ':memory:')")]
    MissingStoreUrl,
    #[error("store database name must not be empty (CANDLE_STORE_DB)")]
    MissingStoreDb,
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_store_db() -> String {
    "candles".to_string()
}

fn default_rest_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_ws_base_url() -> String {
    "wss://fstream.binance.com".to_string()
}

fn default_backfill_lookback() -> usize {
    1500
}

fn default_page_size() -> u32 {
    500
}

fn default_pages_per_pause() -> u32 {
    10
}

fn default_page_pause_ms() -> u64 {
    1000
}

fn default_fetch_retry_delay_ms() -> u64 {
    5000
}

fn default_poll_offset_ms() -> i64 {
    4000
}

fn default_poll_window() -> u32 {
    5
}

fn default_lag_retry_ms() -> i64 {
    2000
}

fn default_stream_workers() -> usize {
    4
}

fn default_stream_queue_capacity() -> usize {
    1024
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

// =============================================================================
// IngestConfig
// =============================================================================

/// Everything the backfill, poller and listener need, built once in `main`
/// and shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    // --- What to ingest ------------------------------------------------------

    /// Normalised symbol, e.g. `BTCUSDT`.
    #[serde(default)]
    pub symbol: String,

    #[serde(default)]
    pub interval: KlineInterval,

    // --- Store ---------------------------------------------------------------

    /// Directory holding the database file, or `:memory:`.
    #[serde(default)]
    pub store_url: String,

    /// Database name; the file is `<store_url>/<store_db>.sqlite3`.
    #[serde(default = "default_store_db")]
    pub store_db: String,

    // --- Upstream ------------------------------------------------------------

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,

    // --- Backfill ------------------------------------------------------------

    /// Intervals to seed when the store holds nothing for the symbol.
    #[serde(default = "default_backfill_lookback")]
    pub backfill_lookback: usize,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Pause after this many consecutive page requests.
    #[serde(default = "default_pages_per_pause")]
    pub pages_per_pause: u32,

    #[serde(default = "default_page_pause_ms")]
    pub page_pause_ms: u64,

    #[serde(default = "default_fetch_retry_delay_ms")]
    pub fetch_retry_delay_ms: u64,

    /// `None` retries a failing fetch forever.
    #[serde(default)]
    pub fetch_max_attempts: Option<u32>,

    // --- Live poller ---------------------------------------------------------

    /// Delay after each interval boundary before polling.
    #[serde(default = "default_poll_offset_ms")]
    pub poll_offset_ms: i64,

    /// Rows requested per poll.
    #[serde(default = "default_poll_window")]
    pub poll_window: u32,

    /// Retry delay while the exchange has not published the closed interval.
    #[serde(default = "default_lag_retry_ms")]
    pub lag_retry_ms: i64,

    // --- Stream listener -----------------------------------------------------

    #[serde(default = "default_stream_workers")]
    pub stream_workers: usize,

    #[serde(default = "default_stream_queue_capacity")]
    pub stream_queue_capacity: usize,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// `None` reconnects forever.
    #[serde(default)]
    pub reconnect_max_attempts: Option<u32>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            interval: KlineInterval::default(),
            store_url: String::new(),
            store_db: default_store_db(),
            rest_base_url: default_rest_base_url(),
            ws_base_url: default_ws_base_url(),
            backfill_lookback: default_backfill_lookback(),
            page_size: default_page_size(),
            pages_per_pause: default_pages_per_pause(),
            page_pause_ms: default_page_pause_ms(),
            fetch_retry_delay_ms: default_fetch_retry_delay_ms(),
            fetch_max_attempts: None,
            poll_offset_ms: default_poll_offset_ms(),
            poll_window: default_poll_window(),
            lag_retry_ms: default_lag_retry_ms(),
            stream_workers: default_stream_workers(),
            stream_queue_capacity: default_stream_queue_capacity(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconnect_max_attempts: None,
        }
    }
}

impl IngestConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read ingest config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse ingest config from {}", path.display()))?;

        info!(path = %path.display(), "ingest config loaded");
        Ok(config)
    }

    /// Apply `CANDLE_*` overrides read through `lookup` (normally
    /// `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CANDLE_SYMBOL") {
            self.symbol = v;
        }
        if let Some(v) = lookup("CANDLE_INTERVAL") {
            self.interval = v.parse().map_err(|reason| ConfigError::Invalid {
                field: "CANDLE_INTERVAL",
                reason,
            })?;
        }
        if let Some(v) = lookup("CANDLE_STORE_URL") {
            self.store_url = v;
        }
        if let Some(v) = lookup("CANDLE_STORE_DB") {
            self.store_db = v;
        }
        if let Some(v) = lookup("CANDLE_REST_URL") {
            self.rest_base_url = v;
        }
        if let Some(v) = lookup("CANDLE_WS_URL") {
            self.ws_base_url = v;
        }
        if let Some(v) = lookup("CANDLE_BACKFILL_LOOKBACK") {
            self.backfill_lookback = v.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "CANDLE_BACKFILL_LOOKBACK",
                reason: format!("'{v}' is not a non-negative integer"),
            })?;
        }
        Ok(())
    }

    /// Normalise the symbol and check every required field.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.symbol = normalize_symbol(&self.symbol);
        if self.symbol.is_empty() {
            return Err(ConfigError::MissingSymbol);
        }
        if self.store_url.trim().is_empty() {
            return Err(ConfigError::MissingStoreUrl);
        }
        if self.store_db.trim().is_empty() {
            return Err(ConfigError::MissingStoreDb);
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid {
                field: "page_size",
                reason: format!("must be within 1..={MAX_PAGE_SIZE}, got {}", self.page_size),
            });
        }
        if self.poll_window == 0 || self.poll_window > MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid {
                field: "poll_window",
                reason: format!("must be within 1..={MAX_PAGE_SIZE}, got {}", self.poll_window),
            });
        }
        if self.stream_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "stream_workers",
                reason: "at least one worker is required".into(),
            });
        }
        if self.stream_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "stream_queue_capacity",
                reason: "queue capacity must be positive".into(),
            });
        }
        if self.lag_retry_ms <= 0 {
            return Err(ConfigError::Invalid {
                field: "lag_retry_ms",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    /// Location of the SQLite database. `None` means an in-memory store.
    pub fn store_path(&self) -> Option<PathBuf> {
        let url = self.store_url.trim();
        if url == ":memory:" {
            return None;
        }
        let dir = url.strip_prefix("sqlite://").unwrap_or(url);
        Some(Path::new(dir).join(format!("{}.sqlite3", self.store_db.trim())))
    }

    pub fn fetch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_delay_ms)
    }

    pub fn page_pause(&self) -> Duration {
        Duration::from_millis(self.page_pause_ms)
    }
}

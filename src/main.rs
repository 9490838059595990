// =============================================================================
// candle-ingest — Main Entry Point
// =============================================================================
//
// Startup order:
//   1. config (file -> CANDLE_* env -> CLI) and logging
//   2. store + REST client
//   3. backfill up to the last closed interval
//   4. live poller and stream listener, until Ctrl+C
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod binance;
mod ingest;
mod market_data;
mod runtime_config;
mod store;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::BinanceClient;
use crate::ingest::{Backfill, Cancelled, LivePoller};
use crate::market_data::KlineListener;
use crate::runtime_config::IngestConfig;
use crate::store::{CandleDb, StoreGate};
use crate::types::{fmt_ms, now_ms};

/// Minute-candle ingestion for one futures symbol.
#[derive(Debug, Parser)]
#[command(name = "candle-ingest", version, about)]
struct Cli {
    /// Symbol to ingest, e.g. BTCUSDT. Overrides CANDLE_SYMBOL.
    symbol: Option<String>,

    /// Optional JSON config file; env and flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Intervals to seed when the store is empty.
    #[arg(long)]
    lookback: Option<usize>,

    /// Run the startup backfill and exit.
    #[arg(long)]
    backfill_only: bool,
}

/// Layer the config sources and validate the result.
fn resolve_config<F>(cli: &Cli, lookup: F) -> anyhow::Result<IngestConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match &cli.config {
        Some(path) => IngestConfig::load(path)?,
        None => IngestConfig::default(),
    };
    config.apply_env(lookup)?;

    if let Some(symbol) = &cli.symbol {
        config.symbol = symbol.clone();
    }
    if let Some(lookback) = cli.lookback {
        config.backfill_lookback = lookback;
    }

    config.validate()?;
    Ok(config)
}

fn open_store(config: &IngestConfig) -> anyhow::Result<StoreGate> {
    match config.store_path() {
        Some(path) => {
            info!(path = %path.display(), "opening candle store");
            Ok(StoreGate::new(CandleDb::open(&path)?))
        }
        None => {
            warn!("CANDLE_STORE_URL is :memory:, candles will not survive a restart");
            StoreGate::in_memory()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match resolve_config(&cli, |key| std::env::var(key).ok()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %format!("{e:#}"), "invalid startup configuration");
            return Err(e);
        }
    };

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        candle-ingest — Starting Up                       ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    info!(
        symbol = %config.symbol,
        interval = %config.interval,
        store = %config.store_url,
        db = %config.store_db,
        "configuration resolved"
    );

    // ── 2. Store & REST client ───────────────────────────────────────────
    let gate = open_store(&config)?;
    let client = Arc::new(BinanceClient::new(config.rest_base_url.clone())?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => warn!("Shutdown signal received — stopping gracefully"),
                Err(e) => error!(error = %e, "failed to listen for Ctrl+C"),
            }
            cancel.cancel();
        });
    }

    // ── 3. Startup backfill ──────────────────────────────────────────────
    let backfill = Backfill::new(&config, Arc::clone(&client), gate.clone());
    match backfill.run(now_ms(), &cancel).await {
        Ok(report) => info!(
            wanted = report.wanted,
            fetched = report.fetched,
            inserted = report.inserted,
            holes = report.holes.len(),
            "startup backfill complete"
        ),
        Err(e) if e.is::<Cancelled>() => {
            info!("startup backfill interrupted");
            return Ok(());
        }
        Err(e) => return Err(e).context("startup backfill failed"),
    }

    if cli.backfill_only {
        let max = gate.max_finalized_open_time(&config.symbol).await?;
        let stored = gate.count_finalized(&config.symbol).await?;
        info!(store_max = ?max.map(fmt_ms), stored, "backfill-only run finished");
        return Ok(());
    }

    // ── 4. Live poller & stream listener ─────────────────────────────────
    let poller = LivePoller::new(&config, Arc::clone(&client), gate.clone());
    let poller_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { poller.run(cancel).await })
    };

    let listener = KlineListener::new(&config, gate.clone());
    info!(url = %listener.url(), "stream listener configured");
    let stream_stats = listener.stats();
    let mut listener_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { listener.run(cancel).await })
    };

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    let finished_early = tokio::select! {
        _ = cancel.cancelled() => None,
        res = &mut listener_handle => Some(res),
    };
    cancel.cancel();
    let joined = match finished_early {
        Some(res) => res,
        None => listener_handle.await,
    };
    let outcome = joined.map_err(anyhow::Error::from).and_then(|r| r);
    if let Err(e) = &outcome {
        error!(error = %format!("{e:#}"), "stream listener ended with an error");
    }
    if let Err(e) = poller_handle.await {
        error!(error = %e, "poller task failed");
    }

    let max = gate.max_finalized_open_time(&config.symbol).await?;
    let stored = gate.count_finalized(&config.symbol).await?;
    let stream = stream_stats.snapshot();
    info!(
        store_max = ?max.map(fmt_ms),
        stored,
        stream_inserted = stream.closed_inserted,
        stream_duplicates = stream.closed_duplicate,
        stream_frames = stream.frames,
        partial_applied = stream.partial_applied,
        partial_stale = stream.partial_stale,
        skipped = stream.malformed + stream.foreign,
        reconnects = stream.connections.saturating_sub(1),
        "candle-ingest shut down complete."
    );
    outcome
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::runtime_config::ConfigError;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn positional_symbol_overrides_env() {
        let cli = Cli::try_parse_from(["candle-ingest", "ethusdt", "--lookback", "60"]).unwrap();
        let cfg = resolve_config(
            &cli,
            env(&[("CANDLE_SYMBOL", "BTCUSDT"), ("CANDLE_STORE_URL", "/tmp/candles")]),
        )
        .unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.backfill_lookback, 60);
        assert!(!cli.backfill_only);
    }

    #[test]
    fn missing_symbol_is_a_config_error() {
        let cli = Cli::try_parse_from(["candle-ingest"]).unwrap();
        let err = resolve_config(&cli, env(&[("CANDLE_STORE_URL", ":memory:")])).unwrap_err();
        assert!(matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::MissingSymbol)));
    }

    #[test]
    fn missing_store_url_is_a_config_error() {
        let cli = Cli::try_parse_from(["candle-ingest", "BTCUSDT", "--backfill-only"]).unwrap();
        assert!(cli.backfill_only);
        let err = resolve_config(&cli, env(&[])).unwrap_err();
        assert!(matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::MissingStoreUrl)));
    }

    #[test]
    fn config_file_is_the_base_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.json");
        std::fs::write(&path, r#"{"symbol":"solusdt","store_url":":memory:","poll_window":3}"#).unwrap();

        let cli = Cli::try_parse_from(["candle-ingest", "--config", path.to_str().unwrap()]).unwrap();
        let cfg = resolve_config(&cli, env(&[])).unwrap();
        assert_eq!(cfg.symbol, "SOLUSDT");
        assert_eq!(cfg.poll_window, 3);
        assert!(cfg.store_path().is_none());
    }
}

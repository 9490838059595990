// =============================================================================
// Store Gate — the single write/query path shared by every ingestion loop
// =============================================================================
//
// Backfill, poller and stream listener never touch SQLite directly; they go
// through `StoreGate`, which moves each blocking call onto Tokio's blocking
// pool.  Consistency between the two live writers comes entirely from the
// `(symbol, open_time)` primary key; there is no application-level lock.
// =============================================================================

pub mod sqlite;

use std::sync::Arc;

use anyhow::{Context, Result};

pub use sqlite::CandleDb;

use crate::types::{Candle, InsertOutcome, PartialCandle, PartialOutcome};

/// Cheap-to-clone async handle over a [`CandleDb`].
#[derive(Clone, Debug)]
pub struct StoreGate {
    db: Arc<CandleDb>,
}

impl StoreGate {
    pub fn new(db: CandleDb) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(CandleDb::open_in_memory()?))
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&CandleDb) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .context("store task panicked")?
    }

    /// Latest finalized `open_time` for `symbol` (the ingestion cursor).
    pub async fn max_finalized_open_time(&self, symbol: &str) -> Result<Option<i64>> {
        let symbol = symbol.to_string();
        self.run(move |db| db.max_finalized_open_time(&symbol)).await
    }

    pub async fn insert_finalized_if_new(&self, candle: Candle) -> Result<InsertOutcome> {
        self.run(move |db| db.insert_finalized_if_new(&candle)).await
    }

    /// Insert only the rows newer than the stored maximum; returns rows written.
    pub async fn insert_newer_than_max(&self, symbol: &str, candles: Vec<Candle>) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }
        let symbol = symbol.to_string();
        self.run(move |db| db.insert_newer_than_max(&symbol, &candles)).await
    }

    /// Insert every offered row that is not stored yet; returns rows written.
    pub async fn insert_missing(&self, symbol: &str, candles: Vec<Candle>) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }
        let symbol = symbol.to_string();
        self.run(move |db| db.insert_missing(&symbol, &candles)).await
    }

    pub async fn upsert_partial(&self, partial: PartialCandle) -> Result<PartialOutcome> {
        self.run(move |db| db.upsert_partial(&partial)).await
    }

    pub async fn retire_partial(&self, symbol: &str, closed_open_time: i64) -> Result<bool> {
        let symbol = symbol.to_string();
        self.run(move |db| db.retire_partial(&symbol, closed_open_time)).await
    }

    #[cfg(test)]
    pub async fn partial(&self, symbol: &str) -> Result<Option<PartialCandle>> {
        let symbol = symbol.to_string();
        self.run(move |db| db.partial(&symbol)).await
    }

    #[cfg(test)]
    pub async fn finalized_range(&self, symbol: &str, from: i64, to: i64) -> Result<Vec<Candle>> {
        let symbol = symbol.to_string();
        self.run(move |db| db.finalized_range(&symbol, from, to)).await
    }

    pub async fn count_finalized(&self, symbol: &str) -> Result<u64> {
        let symbol = symbol.to_string();
        self.run(move |db| db.count_finalized(&symbol)).await
    }

    pub async fn count_finalized_between(&self, symbol: &str, from: i64, to: i64) -> Result<u64> {
        let symbol = symbol.to_string();
        self.run(move |db| db.count_finalized_between(&symbol, from, to)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time: i64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            open_time,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 3.0,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_inserts_of_same_candle_yield_one_winner() {
        let gate = StoreGate::in_memory().unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let g = gate.clone();
            handles.push(tokio::spawn(async move { g.insert_finalized_if_new(candle(60_000)).await }));
        }

        let mut inserted = 0;
        let mut existing = 0;
        for h in handles {
            match h.await.unwrap().unwrap() {
                InsertOutcome::Inserted => inserted += 1,
                InsertOutcome::AlreadyExists => existing += 1,
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(existing, 7);
        assert_eq!(gate.count_finalized("BTCUSDT").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_gap_fill_is_a_no_op() {
        let gate = StoreGate::in_memory().unwrap();
        assert_eq!(gate.insert_newer_than_max("BTCUSDT", Vec::new()).await.unwrap(), 0);
        assert_eq!(gate.max_finalized_open_time("BTCUSDT").await.unwrap(), None);
    }
}

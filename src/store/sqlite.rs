//! SQLite persistence for finalized and partial candles.
//!
//! Uniqueness on `(symbol, open_time)` is enforced by the primary key; inserts
//! use `INSERT OR IGNORE` and report whether a row was written, so two writers
//! racing on the same candle cannot both succeed.

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::types::{Candle, InsertOutcome, PartialCandle, PartialOutcome};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS candles (
        symbol    TEXT    NOT NULL,
        open_time INTEGER NOT NULL,
        open      REAL    NOT NULL,
        high      REAL    NOT NULL,
        low       REAL    NOT NULL,
        close     REAL    NOT NULL,
        volume    REAL    NOT NULL,
        PRIMARY KEY (symbol, open_time)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS partial_candles (
        symbol     TEXT    NOT NULL PRIMARY KEY,
        open_time  INTEGER NOT NULL,
        open       REAL    NOT NULL,
        high       REAL    NOT NULL,
        low        REAL    NOT NULL,
        close      REAL    NOT NULL,
        volume     REAL    NOT NULL,
        event_time INTEGER NOT NULL
    );
"#;

/// Candle database behind a single serialised connection.
pub struct CandleDb {
    conn: Mutex<Connection>,
}

impl CandleDb {
    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open candle db {}", path.display()))?;
        // Pragmas are best-effort; an older SQLite without WAL still works.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory candle db")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("failed to create candle schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn max_finalized_open_time(&self, symbol: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let max: Option<i64> = conn
            .query_row(
                "SELECT MAX(open_time) FROM candles WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .context("failed to query max open_time")?;
        Ok(max)
    }

    pub fn insert_finalized_if_new(&self, candle: &Candle) -> Result<InsertOutcome> {
        let conn = self.conn.lock();
        let changed = insert_or_ignore(&conn, candle)?;
        Ok(if changed == 0 {
            InsertOutcome::AlreadyExists
        } else {
            InsertOutcome::Inserted
        })
    }

    /// Gap-fill insert: write only rows strictly newer than the stored maximum.
    ///
    /// The maximum is read inside the same transaction as the inserts.
    pub fn insert_newer_than_max(&self, symbol: &str, candles: &[Candle]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to begin gap-fill transaction")?;

        let max: Option<i64> = tx
            .query_row(
                "SELECT MAX(open_time) FROM candles WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .context("failed to query max open_time")?;

        let mut inserted = 0usize;
        for candle in candles
            .iter()
            .filter(|c| c.symbol == symbol && max.map_or(true, |m| c.open_time > m))
        {
            inserted += insert_or_ignore(&tx, candle)?;
        }
        tx.commit().context("failed to commit gap-fill transaction")?;

        debug!(symbol, offered = candles.len(), inserted, "gap-fill insert");
        Ok(inserted)
    }

    /// Idempotent window fill: insert every offered row for `symbol` that is
    /// not stored yet, including rows older than the current maximum.
    pub fn insert_missing(&self, symbol: &str, candles: &[Candle]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to begin window-fill transaction")?;

        let mut inserted = 0usize;
        for candle in candles.iter().filter(|c| c.symbol == symbol) {
            inserted += insert_or_ignore(&tx, candle)?;
        }
        tx.commit().context("failed to commit window-fill transaction")?;

        debug!(symbol, offered = candles.len(), inserted, "window-fill insert");
        Ok(inserted)
    }

    /// Upsert the partial row unless the stored one has an equal or newer
    /// `event_time`, or the interval is already finalized.
    pub fn upsert_partial(&self, partial: &PartialCandle) -> Result<PartialOutcome> {
        let conn = self.conn.lock();

        let finalized: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM candles WHERE symbol = ?1 AND open_time >= ?2)",
                params![partial.symbol, partial.open_time],
                |row| row.get(0),
            )
            .context("failed to check finalized interval")?;
        if finalized {
            return Ok(PartialOutcome::Stale);
        }

        let changed = conn
            .execute(
                r#"
                INSERT INTO partial_candles
                    (symbol, open_time, open, high, low, close, volume, event_time)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(symbol) DO UPDATE SET
                    open_time  = excluded.open_time,
                    open       = excluded.open,
                    high       = excluded.high,
                    low        = excluded.low,
                    close      = excluded.close,
                    volume     = excluded.volume,
                    event_time = excluded.event_time
                WHERE excluded.event_time > partial_candles.event_time
                "#,
                params![
                    partial.symbol,
                    partial.open_time,
                    partial.open,
                    partial.high,
                    partial.low,
                    partial.close,
                    partial.volume,
                    partial.event_time,
                ],
            )
            .context("failed to upsert partial candle")?;
        Ok(if changed == 0 {
            PartialOutcome::Stale
        } else {
            PartialOutcome::Applied
        })
    }

    /// Drop the partial row once its interval (or a later one) is finalized.
    pub fn retire_partial(&self, symbol: &str, closed_open_time: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM partial_candles WHERE symbol = ?1 AND open_time <= ?2",
                params![symbol, closed_open_time],
            )
            .context("failed to retire partial candle")?;
        Ok(removed > 0)
    }

    #[cfg(test)]
    pub fn partial(&self, symbol: &str) -> Result<Option<PartialCandle>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT symbol, open_time, open, high, low, close, volume, event_time
             FROM partial_candles WHERE symbol = ?1",
            params![symbol],
            |row| {
                Ok(PartialCandle {
                    symbol: row.get(0)?,
                    open_time: row.get(1)?,
                    open: row.get(2)?,
                    high: row.get(3)?,
                    low: row.get(4)?,
                    close: row.get(5)?,
                    volume: row.get(6)?,
                    event_time: row.get(7)?,
                })
            },
        )
        .optional()
        .context("failed to query partial candle")
    }

    /// Finalized candles with `from <= open_time <= to`, oldest first.
    #[cfg(test)]
    pub fn finalized_range(&self, symbol: &str, from: i64, to: i64) -> Result<Vec<Candle>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT symbol, open_time, open, high, low, close, volume
                 FROM candles
                 WHERE symbol = ?1 AND open_time >= ?2 AND open_time <= ?3
                 ORDER BY open_time ASC",
            )
            .context("failed to prepare range query")?;

        let rows = stmt
            .query_map(params![symbol, from, to], |row| {
                Ok(Candle {
                    symbol: row.get(0)?,
                    open_time: row.get(1)?,
                    open: row.get(2)?,
                    high: row.get(3)?,
                    low: row.get(4)?,
                    close: row.get(5)?,
                    volume: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read candle rows")?;
        Ok(rows)
    }

    pub fn count_finalized(&self, symbol: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM candles WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .context("failed to count candles")?;
        Ok(n.max(0) as u64)
    }

    /// Finalized rows with `from <= open_time <= to`.
    pub fn count_finalized_between(&self, symbol: &str, from: i64, to: i64) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM candles WHERE symbol = ?1 AND open_time >= ?2 AND open_time <= ?3",
                params![symbol, from, to],
                |row| row.get(0),
            )
            .context("failed to count candles in range")?;
        Ok(n.max(0) as u64)
    }
}

fn insert_or_ignore(conn: &Connection, candle: &Candle) -> Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO candles (symbol, open_time, open, high, low, close, volume)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            candle.symbol,
            candle.open_time,
            candle.open,
            candle.high,
            candle.low,
            candle.close,
            candle.volume,
        ],
    )
    .context("failed to insert candle")
}

impl std::fmt::Debug for CandleDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleDb").finish_non_exhaustive()
    }
}

// =============================================================================
// Stream Listener — continuous-kline subscription feeding the store
// =============================================================================
//
// The socket reader only forwards raw text frames into a bounded queue.  A
// fixed pool of workers drains the queue, decodes each frame and writes it:
//
//   closed kline  -> insert_finalized_if_new   (AlreadyExists is success)
//   forming kline -> upsert_partial            (older event_time is dropped)
//
// A closed kline also retires the partial row for its interval.  Workers
// finish out of arrival order, which is why the partial row is guarded by
// event_time and refused once its interval is finalized.  A supervisor loop reconnects with exponential
// backoff whenever the socket goes away.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::kline_stream::{parse_kline_event, run_kline_stream, stream_url, KlineEvent, StreamEnd};
use crate::ingest::retry::{sleep_or_cancel, Backoff};
use crate::runtime_config::IngestConfig;
use crate::store::StoreGate;
use crate::types::{fmt_ms, InsertOutcome, PartialOutcome};

/// Running counters, shared between the supervisor and the workers.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub connections: AtomicU64,
    pub frames: AtomicU64,
    pub closed_inserted: AtomicU64,
    pub closed_duplicate: AtomicU64,
    pub partial_applied: AtomicU64,
    pub partial_stale: AtomicU64,
    pub malformed: AtomicU64,
    pub foreign: AtomicU64,
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerCounts {
    pub connections: u64,
    pub frames: u64,
    pub closed_inserted: u64,
    pub closed_duplicate: u64,
    pub partial_applied: u64,
    pub partial_stale: u64,
    pub malformed: u64,
    pub foreign: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerCounts {
        ListenerCounts {
            connections: self.connections.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            closed_inserted: self.closed_inserted.load(Ordering::Relaxed),
            closed_duplicate: self.closed_duplicate.load(Ordering::Relaxed),
            partial_applied: self.partial_applied.load(Ordering::Relaxed),
            partial_stale: self.partial_stale.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            foreign: self.foreign.load(Ordering::Relaxed),
        }
    }
}

pub struct KlineListener {
    symbol: String,
    url: String,
    workers: usize,
    queue_capacity: usize,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    reconnect_max_attempts: Option<u32>,
    gate: StoreGate,
    stats: Arc<ListenerStats>,
}

impl KlineListener {
    pub fn new(cfg: &IngestConfig, gate: StoreGate) -> Self {
        Self {
            symbol: cfg.symbol.clone(),
            url: stream_url(&cfg.ws_base_url, &cfg.symbol, cfg.interval),
            workers: cfg.stream_workers.max(1),
            queue_capacity: cfg.stream_queue_capacity.max(1),
            reconnect_initial: Duration::from_millis(cfg.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(cfg.reconnect_max_ms),
            reconnect_max_attempts: cfg.reconnect_max_attempts,
            gate,
            stats: Arc::new(ListenerStats::default()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Subscribe and keep resubscribing until `cancel` fires.
    ///
    /// Returns an error only when `reconnect_max_attempts` consecutive
    /// connections failed to deliver a single frame.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            symbol = %self.symbol,
            url = %self.url,
            workers = self.workers,
            queue = self.queue_capacity,
            "stream listener started"
        );

        let (tx, rx) = mpsc::channel::<String>(self.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let workers: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&rx),
                    self.symbol.clone(),
                    self.gate.clone(),
                    Arc::clone(&self.stats),
                ))
            })
            .collect();

        let result = self.supervise(&tx, &cancel).await;

        // Closing the queue lets the workers drain what is left and exit.
        drop(tx);
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "stream worker panicked");
            }
        }

        info!(symbol = %self.symbol, counts = ?self.stats.snapshot(), "stream listener stopped");
        result
    }

    async fn supervise(&self, tx: &mpsc::Sender<String>, cancel: &CancellationToken) -> Result<()> {
        let mut backoff = Backoff::new(self.reconnect_initial, self.reconnect_max);
        let mut attempt: u64 = 0;
        let mut barren: u32 = 0;

        while !cancel.is_cancelled() {
            attempt += 1;
            self.stats.connections.fetch_add(1, Ordering::Relaxed);
            info!(symbol = %self.symbol, attempt, "opening kline stream");

            let delivered = match run_kline_stream(&self.url, tx, cancel).await {
                Ok(StreamEnd::Cancelled) => break,
                Ok(StreamEnd::Disconnected { frames }) => {
                    warn!(symbol = %self.symbol, attempt, frames, "kline stream disconnected");
                    frames
                }
                Err(e) => {
                    warn!(symbol = %self.symbol, attempt, error = %format!("{e:#}"), "kline stream failed");
                    0
                }
            };

            if delivered > 0 {
                backoff.reset();
                barren = 0;
            } else {
                barren += 1;
                if self.reconnect_max_attempts.is_some_and(|max| barren >= max) {
                    anyhow::bail!("kline stream gave no data after {barren} consecutive connection attempts");
                }
            }

            let delay = backoff.next_delay();
            info!(symbol = %self.symbol, delay_ms = delay.as_millis() as u64, "reconnecting kline stream");
            if !sleep_or_cancel(delay, cancel).await {
                break;
            }
        }
        Ok(())
    }
}

async fn run_worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
    symbol: String,
    gate: StoreGate,
    stats: Arc<ListenerStats>,
) {
    debug!(worker = id, "stream worker started");
    loop {
        // The lock is only held while waiting for the next frame.
        let next = rx.lock().await.recv().await;
        let Some(text) = next else { break };
        apply_frame(&text, &symbol, &gate, &stats).await;
    }
    debug!(worker = id, "stream worker stopped");
}

/// Decode one frame and write it to the store. Failures are logged, never
/// propagated, so one bad frame cannot take a worker down.
pub(crate) async fn apply_frame(text: &str, symbol: &str, gate: &StoreGate, stats: &ListenerStats) {
    stats.frames.fetch_add(1, Ordering::Relaxed);

    let event = match parse_kline_event(text) {
        Ok(ev) => ev,
        Err(e) => {
            stats.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %format!("{e:#}"), frame = %truncate(text, 200), "skipping malformed kline frame");
            return;
        }
    };

    if event.symbol() != symbol {
        stats.foreign.fetch_add(1, Ordering::Relaxed);
        debug!(expected = %symbol, got = %event.symbol(), "ignoring kline for another symbol");
        return;
    }

    match event {
        KlineEvent::Closed(candle) => {
            let open_time = candle.open_time;
            match gate.insert_finalized_if_new(candle).await {
                Ok(InsertOutcome::Inserted) => {
                    stats.closed_inserted.fetch_add(1, Ordering::Relaxed);
                    info!(symbol = %symbol, open_time = %fmt_ms(open_time), "stream inserted closed candle");
                }
                Ok(InsertOutcome::AlreadyExists) => {
                    stats.closed_duplicate.fetch_add(1, Ordering::Relaxed);
                    debug!(symbol = %symbol, open_time = %fmt_ms(open_time), "closed candle already stored");
                }
                Err(e) => {
                    error!(symbol = %symbol, open_time, error = %format!("{e:#}"), "failed to store closed candle");
                    return;
                }
            }
            // The forming row for this interval is finalized now.
            if let Err(e) = gate.retire_partial(symbol, open_time).await {
                warn!(symbol = %symbol, open_time, error = %format!("{e:#}"), "failed to retire partial candle");
            }
        }
        KlineEvent::Forming(partial) => {
            let event_time = partial.event_time;
            match gate.upsert_partial(partial).await {
                Ok(PartialOutcome::Applied) => {
                    stats.partial_applied.fetch_add(1, Ordering::Relaxed);
                }
                Ok(PartialOutcome::Stale) => {
                    stats.partial_stale.fetch_add(1, Ordering::Relaxed);
                    debug!(symbol = %symbol, event_time, "stale partial update discarded");
                }
                Err(e) => {
                    error!(symbol = %symbol, event_time, error = %format!("{e:#}"), "failed to store partial candle");
                }
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

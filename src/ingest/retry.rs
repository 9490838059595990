// =============================================================================
// Retry helpers — fixed-delay retries and bounded exponential backoff
// =============================================================================

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Returned when a wait or retry loop is interrupted by shutdown.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Sleep for `d` unless `cancel` fires first. Returns `false` on cancellation.
pub async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

/// Retry a whole operation after a fixed delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` keeps retrying forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Run `op` until it succeeds, the attempt ceiling is reached, or
    /// `cancel` fires.
    pub async fn run<T, F, Fut>(&self, what: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is::<Cancelled>() => return Err(e),
                Err(e) => {
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        return Err(e.context(format!("{what} failed after {attempt} attempts")));
                    }
                    warn!(
                        what,
                        attempt,
                        retry_in_ms = self.delay.as_millis() as u64,
                        error = %format!("{e:#}"),
                        "operation failed, retrying"
                    );
                    if !sleep_or_cancel(self.delay, cancel).await {
                        return Err(Cancelled.into());
                    }
                }
            }
        }
    }
}

/// Doubling delay between `initial` and `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns twice as much (capped).
    pub fn next_delay(&mut self) -> Duration {
        let d = self.current;
        self.current = (self.current * 2).min(self.max);
        d
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

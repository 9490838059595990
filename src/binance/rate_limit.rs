// =============================================================================
// Rate-Limit Tracker — monitors Binance futures request weight
// =============================================================================
//
// USDⓈ-M futures allow 2400 request weight per minute per IP.  The tracker
// reads the `X-MBX-USED-WEIGHT-1M` response header after every request and
// keeps an atomic counter that any task may query lock-free.  The backfill
// consults it between pages and pauses when the budget is nearly spent.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

/// Exchange limit per rolling minute.
const WEIGHT_LIMIT_1M: u32 = 2400;
/// Ceiling we allow ourselves before refusing to push harder.
const WEIGHT_HARD_LIMIT: u32 = 2000;
/// Soft warning threshold; above it the backfill takes an extra pause.
const WEIGHT_WARN_THRESHOLD: u32 = 1600;

/// Request weight of a klines call, which depends on the requested `limit`.
pub fn klines_weight(limit: u32) -> u32 {
    match limit {
        0..=99 => 1,
        100..=499 => 2,
        500..=1000 => 5,
        _ => 10,
    }
}

/// Thread-safe rate-limit tracker backed by an atomic counter.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
        }
    }

    /// Update from the HTTP response headers returned by Binance.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let weight = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u32>().ok());

        if let Some(w) = weight {
            self.record(w);
        }
    }

    fn record(&self, w: u32) {
        let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
        if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = w,
                limit = WEIGHT_LIMIT_1M,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = w, "rate-limit weight updated from header");
    }

    /// `true` if `weight` more can be spent without crossing the hard ceiling.
    pub fn can_send_request(&self, weight: u32) -> bool {
        self.used_weight_1m
            .load(Ordering::Relaxed)
            .saturating_add(weight)
            <= WEIGHT_HARD_LIMIT
    }

    pub fn is_near_limit(&self) -> bool {
        self.used_weight_1m.load(Ordering::Relaxed) >= WEIGHT_WARN_THRESHOLD
    }

    pub fn used_weight(&self) -> u32 {
        self.used_weight_1m.load(Ordering::Relaxed)
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn headers(weight: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_str(weight).unwrap());
        h
    }

    #[test]
    fn weight_tiers_follow_limit() {
        assert_eq!(klines_weight(5), 1);
        assert_eq!(klines_weight(499), 2);
        assert_eq!(klines_weight(500), 5);
        assert_eq!(klines_weight(1500), 10);
    }

    #[test]
    fn header_updates_counter() {
        let t = RateLimitTracker::new();
        t.update_from_headers(&headers("120"));
        assert_eq!(t.used_weight(), 120);
        assert!(!t.is_near_limit());
        assert!(t.can_send_request(5));
    }

    #[test]
    fn near_limit_blocks_large_requests() {
        let t = RateLimitTracker::new();
        t.update_from_headers(&headers("1998"));
        assert!(t.is_near_limit());
        assert!(!t.can_send_request(5));
        assert!(t.can_send_request(1));
    }

    #[test]
    fn absurd_header_weight_saturates() {
        let t = RateLimitTracker::new();
        t.update_from_headers(&headers(&u32::MAX.to_string()));
        assert!(t.is_near_limit());
        assert!(!t.can_send_request(10));
    }

    #[test]
    fn garbage_header_is_ignored() {
        let t = RateLimitTracker::new();
        t.update_from_headers(&headers("abc"));
        assert_eq!(t.used_weight(), 0);
    }
}

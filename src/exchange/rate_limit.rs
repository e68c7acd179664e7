// =============================================================================
// Rate limit tracking
// =============================================================================
//
// Ported from the original Binance adapter's atomic-counter tracker: every
// response's rate-limit headers update a running snapshot instead of each
// caller maintaining its own budget. Header names are Bybit v5's.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use reqwest::header::HeaderMap;

/// Bybit returns remaining-request counts per endpoint group via these
/// headers on every response.
const HEADER_LIMIT: &str = "X-Bapi-Limit";
const HEADER_STATUS: &str = "X-Bapi-Limit-Status";
const HEADER_RESET: &str = "X-Bapi-Limit-Reset-Timestamp";

#[derive(Debug, Default)]
pub struct RateLimitTracker {
    limit: AtomicU32,
    remaining: AtomicU32,
    reset_at_ms: AtomicI64,
    requests_sent: AtomicU32,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: i64,
    pub requests_sent: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_from_headers(&self, headers: &HeaderMap) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        if let Some(limit) = header_u32(headers, HEADER_LIMIT) {
            self.limit.store(limit, Ordering::Relaxed);
        }
        if let Some(remaining) = header_u32(headers, HEADER_STATUS) {
            self.remaining.store(remaining, Ordering::Relaxed);
        }
        if let Some(reset) = header_i64(headers, HEADER_RESET) {
            self.reset_at_ms.store(reset, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            limit: self.limit.load(Ordering::Relaxed),
            remaining: self.remaining.load(Ordering::Relaxed),
            reset_at_ms: self.reset_at_ms.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
        }
    }

    /// True once remaining budget drops under 10% of the limit, so callers
    /// can back off before Bybit starts rejecting with a 403.
    pub fn is_near_limit(&self) -> bool {
        let limit = self.limit.load(Ordering::Relaxed);
        if limit == 0 {
            return false;
        }
        let remaining = self.remaining.load(Ordering::Relaxed);
        (remaining as f64) < (limit as f64) * 0.1
    }
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_not_near_limit() {
        let tracker = RateLimitTracker::new();
        assert!(!tracker.is_near_limit());
    }

    #[test]
    fn near_limit_once_remaining_below_ten_percent() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_LIMIT, "100".parse().unwrap());
        headers.insert(HEADER_STATUS, "5".parse().unwrap());
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(&headers);
        assert!(tracker.is_near_limit());
    }

    #[test]
    fn snapshot_reflects_requests_sent() {
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(&HeaderMap::new());
        tracker.update_from_headers(&HeaderMap::new());
        assert_eq!(tracker.snapshot().requests_sent, 2);
    }
}

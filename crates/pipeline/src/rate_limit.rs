//! Pre-request rate limiting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use pagecraft_core::types::DbId;

/// Default number of generation requests allowed per account per minute.
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 10;

/// Decides whether a caller may start another generation request.
pub trait RateLimiter: Send + Sync {
    /// Record one request for `key`. Returns `false` if it is over the limit.
    fn check(&self, key: DbId) -> bool;
}

/// In-process fixed-window limiter keyed by account id.
pub struct FixedWindowLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<HashMap<DbId, (Instant, u32)>>,
}

impl FixedWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    fn check_at(&self, key: DbId, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        // Keep the map bounded by dropping expired windows as we go.
        if windows.len() > 10_000 {
            windows.retain(|_, (start, _)| now.duration_since(*start) < self.window);
        }

        let entry = windows.entry(key).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        if entry.1 >= self.limit {
            return false;
        }
        entry.1 += 1;
        true
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, key: DbId) -> bool {
        self.check_at(key, Instant::now())
    }
}

/// Limiter that admits every request.
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn check(&self, _key: DbId) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_limit_within_window() {
        let limiter = FixedWindowLimiter::per_minute(2);
        let now = Instant::now();
        assert!(limiter.check_at(1, now));
        assert!(limiter.check_at(1, now));
        assert!(!limiter.check_at(1, now));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = FixedWindowLimiter::per_minute(1);
        let now = Instant::now();
        assert!(limiter.check_at(1, now));
        assert!(limiter.check_at(2, now));
        assert!(!limiter.check_at(1, now));
    }

    #[test]
    fn window_resets_after_it_elapses() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_secs(60));
        let start = Instant::now();
        assert!(limiter.check_at(7, start));
        assert!(!limiter.check_at(7, start + Duration::from_secs(59)));
        assert!(limiter.check_at(7, start + Duration::from_secs(60)));
    }

    #[test]
    fn zero_limit_rejects_everything() {
        let limiter = FixedWindowLimiter::per_minute(0);
        assert!(!limiter.check(1));
    }
}

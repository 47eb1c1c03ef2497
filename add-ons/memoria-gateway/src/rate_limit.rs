//! Tiered token-bucket rate limiter (spec §4.8 step 4, §5).
//!
//! One bucket per [`Principal::rate_limit_key`], refilled continuously at
//! `capacity`/minute and capped at `capacity`. Mirrors the `DashMap`-keyed
//! registry shape already used by [`crate::auth::AuthRegistry`] rather than
//! pulling in a crate dedicated to rate limiting for a single counter.

use dashmap::DashMap;
use std::time::Instant;

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    /// Refills for elapsed time, then takes one token if available.
    /// Returns `(allowed, retry_after_secs, remaining)`.
    fn take(&mut self) -> (bool, u64, u32) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            (true, 0, self.tokens.floor() as u32)
        } else {
            let deficit = 1.0 - self.tokens;
            let wait_secs = (deficit / self.refill_per_sec).ceil().max(1.0) as u64;
            (false, wait_secs, 0)
        }
    }
}

/// Outcome of a rate-limit check, carrying enough to populate the
/// `X-RateLimit-*` response headers required by spec §4.8 step 3.
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub retry_after_secs: u64,
    pub limit: u32,
    pub remaining: u32,
}

pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { buckets: DashMap::new() }
    }

    /// `true` (with a retry-after) when `key` has exhausted its bucket for
    /// this minute at `capacity_per_min`. A key seen for the first time
    /// always starts with a full bucket.
    pub fn check(&self, key: &str, capacity_per_min: u32) -> RateLimitOutcome {
        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket::new(capacity_per_min));
        let (allowed, retry_after_secs, remaining) = entry.take();
        RateLimitOutcome { allowed, retry_after_secs, limit: capacity_per_min, remaining }
    }

    /// Drops every bucket. Mirrors the source's `resetAllRateLimits()`
    /// test-harness contract (spec §9 "Global mutable state"): since the
    /// limiter is injected into `AppState` rather than reached for as
    /// ambient state, a test can call this directly between cases without
    /// restarting the process.
    pub fn reset_all(&self) {
        self.buckets.clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_capacity_then_denies() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            assert!(limiter.check("a", 5).allowed);
        }
        let outcome = limiter.check("a", 5);
        assert!(!outcome.allowed);
        assert!(outcome.retry_after_secs >= 1);
    }

    #[test]
    fn distinct_keys_have_independent_buckets() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter.check("a", 3);
        }
        assert!(limiter.check("b", 3).allowed, "a different key must not be throttled by a's usage");
    }
}

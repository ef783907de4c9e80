//! Per-subject request rate limiting for the HTTP transport.
//!
//! Admission is decided by a keyed `governor` limiter. A fixed-window
//! counter is kept beside it to report `RateLimit-Remaining` and
//! `RateLimit-Reset` headers.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Mutex;

use governor::{DefaultKeyedRateLimiter, Quota};

/// Outcome of a rate-limit check, header-ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_secs: u64,
}

/// Keyed limiter; keys are the OAuth subject or, unauthenticated, the peer IP.
pub struct RequestRateLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
    limit_per_minute: u32,
    windows: Mutex<HashMap<String, (i64, u32)>>,
}

impl RequestRateLimiter {
    /// # Panics
    ///
    /// Panics if `limit_per_minute` is zero.
    #[must_use]
    pub fn new(limit_per_minute: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(limit_per_minute).expect("nonzero limit"));
        Self {
            limiter: DefaultKeyedRateLimiter::keyed(quota),
            limit_per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check a key against the quota and return header data.
    pub fn check(&self, key: &str) -> RateDecision {
        let now = chrono::Utc::now().timestamp();
        let window = now / 60;
        let reset_secs = u64::try_from(60 - (now % 60)).unwrap_or(60);

        let allowed = self.limiter.check_key(&key.to_owned()).is_ok();

        let used = {
            let mut windows = self.windows.lock().expect("rate window lock poisoned");
            // Drop counters from past windows so the map stays bounded.
            if windows.len() > 10_000 {
                windows.retain(|_, (w, _)| *w == window);
            }
            let entry = windows.entry(key.to_owned()).or_insert((window, 0));
            if entry.0 != window {
                *entry = (window, 0);
            }
            if allowed {
                entry.1 += 1;
            }
            entry.1
        };

        RateDecision {
            allowed,
            limit: self.limit_per_minute,
            remaining: self.limit_per_minute.saturating_sub(used),
            reset_secs,
        }
    }
}

impl std::fmt::Debug for RequestRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRateLimiter").field("limit_per_minute", &self.limit_per_minute).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_within_quota() {
        let limiter = RequestRateLimiter::new(100);
        let decision = limiter.check("alice");
        assert!(decision.allowed);
        assert_eq!(decision.limit, 100);
        assert!(decision.remaining < 100);
        assert!(decision.reset_secs <= 60);
    }

    #[test]
    fn test_burst_exhaustion_rejects() {
        let limiter = RequestRateLimiter::new(5);
        let mut rejected = 0;
        for _ in 0..20 {
            if !limiter.check("bob").allowed {
                rejected += 1;
            }
        }
        assert!(rejected > 0);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RequestRateLimiter::new(5);
        for _ in 0..20 {
            limiter.check("hot");
        }
        assert!(limiter.check("cold").allowed);
    }
}

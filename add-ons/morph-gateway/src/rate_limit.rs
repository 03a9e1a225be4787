//! Per-api-key token bucket in front of the orchestrator.
//!
//! Buckets refill continuously at the configured rate up to the burst
//! ceiling. Requests without an api key pass through; the resolver rejects
//! them with 401 anyway.

use dashmap::DashMap;
use std::time::Instant;

/// Verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateVerdict {
    Allowed,
    Exceeded { retry_after_secs: u64 },
}

struct Bucket {
    tokens: f64,
    refreshed: Instant,
}

/// Token buckets keyed by api key.
pub struct RateLimiter {
    per_sec: f64,
    burst: f64,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(per_sec: u32, burst: u32) -> Self {
        Self {
            per_sec: f64::from(per_sec.max(1)),
            burst: f64::from(burst.max(1)),
            buckets: DashMap::new(),
        }
    }

    /// Takes one token for `api_key`, refilling first.
    pub fn check(&self, api_key: &str) -> RateVerdict {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(api_key.to_string()).or_insert(Bucket {
            tokens: self.burst,
            refreshed: now,
        });

        let elapsed = now.duration_since(bucket.refreshed).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_sec).min(self.burst);
        bucket.refreshed = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateVerdict::Allowed
        } else {
            let deficit = 1.0 - bucket.tokens;
            RateVerdict::Exceeded {
                retry_after_secs: (deficit / self.per_sec).ceil() as u64,
            }
        }
    }

    /// Drops buckets idle long enough to be full again. Called periodically
    /// from a background task.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let full_after = self.burst / self.per_sec;
        self.buckets.retain(|_, bucket| {
            now.duration_since(bucket.refreshed).as_secs_f64() < full_after * 2.0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_exceeded() {
        let limiter = RateLimiter::new(10, 3);
        assert_eq!(limiter.check("k"), RateVerdict::Allowed);
        assert_eq!(limiter.check("k"), RateVerdict::Allowed);
        assert_eq!(limiter.check("k"), RateVerdict::Allowed);
        assert!(matches!(limiter.check("k"), RateVerdict::Exceeded { .. }));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(10, 1);
        assert_eq!(limiter.check("a"), RateVerdict::Allowed);
        assert_eq!(limiter.check("b"), RateVerdict::Allowed);
    }
}

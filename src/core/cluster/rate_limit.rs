// src/core/cluster/rate_limit.rs

//! Token-bucket rate limiting for the internal cluster API, keyed by source
//! IP. Sits ahead of signature verification so abusive traffic is shed
//! before any HMAC work happens.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::Instant;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-source-IP token bucket limiter.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<IpAddr, TokenBucket>,
    rate_per_sec: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            rate_per_sec: rate_per_sec as f64,
            burst: burst as f64,
        }
    }

    /// Takes one token for `ip`. Returns `false` when the bucket is empty
    /// and the request must be rejected with 429.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(ip).or_insert_with(|| TokenBucket {
            tokens: self.burst,
            last_refill: now,
        });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops buckets that have fully refilled, i.e. sources that have been
    /// idle long enough to be indistinguishable from new ones.
    pub fn evict_idle(&self) -> usize {
        let before = self.buckets.len();
        let rate = self.rate_per_sec;
        let burst = self.burst;
        self.buckets.retain(|_, bucket| {
            let elapsed = bucket.last_refill.elapsed().as_secs_f64();
            bucket.tokens + elapsed * rate < burst
        });
        before - self.buckets.len()
    }

    pub fn tracked_sources(&self) -> usize {
        self.buckets.len()
    }
}

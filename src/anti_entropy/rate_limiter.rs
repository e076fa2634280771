//! # Per-Peer Rate Limiter
//!
//! A token bucket per peer, guarding the anti-entropy protocol from a
//! misbehaving or overly chatty peer (spec §4.10, default 5 requests per
//! second). No crate in this engine's dependency stack provides a token
//! bucket, so this is hand-rolled rather than reaching for an unrelated
//! dependency just to cover it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter keyed by peer id. Each peer gets its own
/// independent bucket so one noisy peer can't exhaust another's budget.
pub struct PerPeerRateLimiter {
    rate_per_sec: f64,
    burst: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl PerPeerRateLimiter {
    /// `rate_per_sec` tokens are added per second, up to a maximum of
    /// `burst` tokens banked per peer.
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            rate_per_sec,
            burst,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt to consume one token for `peer_id`. Returns `true` if the
    /// request is allowed.
    pub fn try_acquire(&self, peer_id: &str) -> bool {
        self.try_acquire_at(peer_id, Instant::now())
    }

    fn try_acquire_at(&self, peer_id: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let bucket = buckets.entry(peer_id.to_string()).or_insert_with(|| Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let refill = elapsed.as_secs_f64() * self.rate_per_sec;
        bucket.tokens = (bucket.tokens + refill).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

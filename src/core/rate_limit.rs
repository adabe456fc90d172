//! Shared token-bucket rate limiter for backend calls

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket consulted by every worker before each call attempt.
///
/// Capacity equals the per-second rate, so a burst never exceeds one
/// second's worth of calls.
#[derive(Debug)]
pub struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64) -> Self {
        let rate_per_sec = rate_per_sec.max(0.001);
        Self {
            rate_per_sec,
            capacity: rate_per_sec.max(1.0),
            bucket: Mutex::new(Bucket {
                tokens: rate_per_sec.max(1.0),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until the bucket refills if necessary
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.capacity);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate_per_sec)
            };
            sleep(wait).await;
        }
    }
}

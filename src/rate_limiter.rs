//! A simple byte-budget token bucket used to cap how fast [`crate::wire`]
//! hands bytes up to the RESP parser. Disabled entirely when the configured
//! rate is `0`.

use std::time::{Duration, Instant};

use tokio::time::sleep;

pub struct TokenBucket {
    rate_bytes_per_sec: u64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            rate_bytes_per_sec,
            tokens: rate_bytes_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate_bytes_per_sec as f64)
            .min(self.rate_bytes_per_sec as f64);
    }

    /// Suspends until `n` bytes worth of budget are available, then spends
    /// them. `n` larger than the bucket capacity is still honored, just over
    /// more than one refill interval.
    pub async fn acquire(&mut self, n: usize) {
        loop {
            self.refill();
            if self.tokens >= n as f64 {
                self.tokens -= n as f64;
                return;
            }

            let deficit = n as f64 - self.tokens;
            let wait_secs = deficit / self.rate_bytes_per_sec as f64;
            sleep(Duration::from_secs_f64(wait_secs.max(0.001))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_immediately_within_budget() {
        let mut bucket = TokenBucket::new(1024);
        bucket.acquire(100).await;
        assert!(bucket.tokens <= 1024.0);
    }
}

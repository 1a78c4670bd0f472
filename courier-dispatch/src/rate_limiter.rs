//! Global send-rate limiting using the token bucket algorithm
//!
//! - The bucket holds up to `rate_limit` tokens and starts full
//! - `rate_limit` tokens are added per `rate_delta`, continuously
//! - Each message consumes one token
//!
//! ```text
//! Rate limit: 5 per 1000 ms
//! - 5 messages can go out immediately (burst)
//! - then one every 200 ms
//! ```

use std::time::Duration;

use courier_common::tracing;
use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_limit: u32, rate_delta: Duration) -> Self {
        let capacity = f64::from(rate_limit.max(1));
        Self {
            tokens: capacity,
            capacity,
            refill_rate: capacity / rate_delta.as_secs_f64().max(f64::EPSILON),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        self.tokens = elapsed.mul_add(self.refill_rate, self.tokens).min(self.capacity);
        self.last_refill = now;
    }

    /// Takes a token, or reports how long until one is available.
    fn try_consume(&mut self) -> Result<(), Duration> {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let tokens_needed = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(tokens_needed / self.refill_rate))
        }
    }
}

/// Shared throughput ceiling for every dispatch.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Allows `rate_limit` messages per `rate_delta`.
    #[must_use]
    pub fn new(rate_limit: u32, rate_delta: Duration) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(rate_limit, rate_delta)),
        }
    }

    /// Takes a token without waiting.
    ///
    /// # Errors
    ///
    /// Returns the time until the next token when the bucket is empty.
    pub fn check(&self) -> Result<(), Duration> {
        self.bucket.lock().try_consume()
    }

    /// Waits until a token is available and takes it.
    pub async fn acquire(&self) {
        loop {
            match self.check() {
                Ok(()) => return,
                Err(wait) => {
                    tracing::trace!(wait_ms = wait.as_millis(), "Rate limit reached, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_limited() {
        let limiter = RateLimiter::new(5, Duration::from_millis(1000));

        for _ in 0..5 {
            assert!(limiter.check().is_ok());
        }

        let wait = limiter.check().unwrap_err();
        assert!(wait > Duration::from_millis(190) && wait <= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let limiter = RateLimiter::new(5, Duration::from_millis(1000));
        for _ in 0..5 {
            limiter.check().unwrap();
        }

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_token() {
        let limiter = RateLimiter::new(5, Duration::from_millis(1000));
        for _ in 0..5 {
            limiter.acquire().await;
        }

        let start = Instant::now();
        limiter.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(199) && waited <= Duration::from_millis(210));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_never_exceeded() {
        let limiter = RateLimiter::new(2, Duration::from_millis(1000));
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }
}

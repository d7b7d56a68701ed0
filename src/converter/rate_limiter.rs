//! Token bucket rate limiter shared by every worker.
//!
//! `wait()` reserves a token under the lock and then sleeps for the deficit
//! outside of it. The bucket may go negative, so each caller's slot is fixed
//! the moment it takes the lock; tokio's mutex is fair, which makes the
//! ordering starvation-free without any polling.

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

/// Token bucket state.
#[derive(Debug)]
struct TokenBucket {
    /// Max tokens (= one second of budget).
    capacity: f64,
    /// Current tokens; negative while callers are queued for future slots.
    tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_second: u32) -> Self {
        let rate = per_second as f64;
        Self {
            capacity: rate.max(1.0),
            tokens: rate.max(1.0),
            refill_rate: rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token and return how long the caller must wait for it.
    fn reserve(&mut self) -> Duration {
        self.refill();
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_rate)
        }
    }
}

/// Aggregate operations-per-second gate (0 = unlimited).
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<Mutex<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(per_second: u32) -> Self {
        let bucket = (per_second > 0).then(|| Mutex::new(TokenBucket::new(per_second)));
        Self { bucket }
    }

    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bucket.is_none()
    }

    /// Block until a token is available.
    pub async fn wait(&self) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        let delay = bucket.lock().await.reserve();
        if !delay.is_zero() {
            debug!("Rate limited, waiting {:?}", delay);
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = RateLimiter::new(0);
        assert!(limiter.is_unlimited());
        let start = Instant::now();
        for _ in 0..1000 {
            limiter.wait().await;
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_reserve_goes_into_debt() {
        let mut bucket = TokenBucket::new(2);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        let third = bucket.reserve();
        let fourth = bucket.reserve();
        assert!(third > Duration::from_millis(400) && third <= Duration::from_millis(500));
        assert!(fourth > third);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_spaces_out_calls() {
        let limiter = RateLimiter::new(10);
        let start = Instant::now();
        // 10 burst tokens, then 10 more at 100ms spacing
        for _ in 0..20 {
            limiter.wait().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(990), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_all_get_through() {
        let limiter = Arc::new(RateLimiter::new(5));
        let start = Instant::now();
        let handles: Vec<_> = (0..15)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.wait().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        // 5 immediately, 10 more at 5/s
        assert!(start.elapsed() >= Duration::from_millis(1990));
    }
}

//! Aggregate bandwidth limits shared by every connection of a client.
use std::time::Duration;

use tokio::{sync::Mutex, time::Instant};

/// Token bucket measured in bytes. Consumers may take more tokens than are
/// available, the bucket then goes into debt and the caller sleeps until it is
/// paid back, which keeps the average rate exact even for frames larger than
/// the bucket capacity.
#[derive(Debug)]
pub struct TokenBucket {
    last_refill: Instant,
    tokens: f64,
    /// tokens per second
    fill_rate: f64,
    capacity: f64,
}

impl TokenBucket {
    pub fn new(bytes_per_sec: u64, now: Instant) -> Self {
        let rate = bytes_per_sec as f64;
        Self { last_refill: now, tokens: rate, fill_rate: rate, capacity: rate }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            f64::min(self.capacity, self.tokens + elapsed.as_secs_f64() * self.fill_rate);
    }

    /// Take `amount` tokens and return how long the caller must wait before
    /// using them.
    pub fn take(&mut self, amount: usize, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= amount as f64;

        if self.tokens >= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(-self.tokens / self.fill_rate)
    }
}

/// A rate limit of 0 bytes per second means unlimited.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<Mutex<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        if bytes_per_sec == 0 {
            return Self::unlimited();
        }
        Self { bucket: Some(Mutex::new(TokenBucket::new(bytes_per_sec, Instant::now()))) }
    }

    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bucket.is_none()
    }

    /// Wait until `amount` bytes may be transferred.
    pub async fn consume(&self, amount: usize) {
        let Some(bucket) = &self.bucket else { return };

        // the lock is released before sleeping
        let wait = bucket.lock().await.take(amount, Instant::now());

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_goes_into_debt() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1_000, start);

        // a full bucket serves its capacity right away
        assert_eq!(bucket.take(1_000, start), Duration::ZERO);

        // half a second worth of bytes must wait half a second
        assert_eq!(bucket.take(500, start), Duration::from_millis(500));

        // after a second the debt is paid and 500 more bytes are available
        let later = start + Duration::from_secs(1);
        assert_eq!(bucket.take(500, later), Duration::ZERO);
    }

    #[test]
    fn bucket_never_exceeds_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(100, start);

        let later = start + Duration::from_secs(60);
        assert_eq!(bucket.take(100, later), Duration::ZERO);
        assert_eq!(bucket.take(50, later), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn unlimited() {
        let limiter = RateLimiter::new(0);
        assert!(limiter.is_unlimited());

        let start = Instant::now();
        limiter.consume(10 * 1024 * 1024).await;
        assert!(start.elapsed() < Duration::from_millis(100));

        assert!(!RateLimiter::new(1024).is_unlimited());
    }
}

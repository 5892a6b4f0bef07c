use std::time::Duration;

use tokio::time::Instant;

/// Token bucket with continuous refill. One instance guards a connection's
/// inbound messages (100/min), another each participant's chat (10/30s).
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill: u32, window: Duration) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(refill) / window.as_secs_f64(),
            tokens: f64::from(capacity),
            refilled_at: Instant::now(),
        }
    }

    /// Takes one token if available. `false` means rate-limited (4006).
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.refilled_at = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn the_101st_message_in_a_minute_is_limited() {
        let mut bucket = TokenBucket::new(100, 100, Duration::from_secs(60));

        for _ in 0..100 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_refill_over_time() {
        let mut bucket = TokenBucket::new(10, 10, Duration::from_secs(30));

        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        // 10 per 30s is one token every 3 seconds
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_secs(30)).await;
        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }
}

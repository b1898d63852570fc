use std::time::Duration;

use tokio::time::Instant;

/// Refill-on-demand token bucket. Capacity equals the per-minute limit and
/// refill runs at limit/60 per second, so a drained bucket is full again in
/// one minute. Monotonic time keeps elapsed intervals non-negative under
/// wall-clock skew.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn per_minute(limit: u32) -> Self {
        let capacity = limit as f64;
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    pub fn try_consume(&mut self, n: u32) -> bool {
        self.try_consume_at(n, Instant::now())
    }

    pub fn try_consume_at(&mut self, n: u32, now: Instant) -> bool {
        self.refill(now);
        let needed = n as f64;
        if self.tokens >= needed {
            self.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Deduct without admission control; floors at zero. Used when the
    /// post-hoc actual exceeds the pre-charged estimate.
    pub fn force_consume(&mut self, n: u32) {
        self.refill(Instant::now());
        self.tokens = (self.tokens - n as f64).max(0.0);
    }

    /// Return unused pre-charge; capped at capacity.
    pub fn refund(&mut self, n: u32) {
        self.refill(Instant::now());
        self.tokens = (self.tokens + n as f64).min(self.capacity);
    }

    pub fn available(&mut self) -> u32 {
        self.refill(Instant::now());
        self.tokens as u32
    }

    /// Seconds until `n` tokens will be available, rounded up. Zero when
    /// they already are.
    pub fn time_to_available(&mut self, n: u32) -> u64 {
        self.refill(Instant::now());
        let deficit = n as f64 - self.tokens;
        if deficit <= 0.0 || self.refill_per_sec <= 0.0 {
            return 0;
        }
        (deficit / self.refill_per_sec).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_capacity_then_denies() {
        let mut bucket = TokenBucket::per_minute(2);
        assert!(bucket.try_consume(1));
        assert!(bucket.try_consume(1));
        assert!(!bucket.try_consume(1));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_at_limit_over_sixty() {
        let mut bucket = TokenBucket::per_minute(60);
        for _ in 0..60 {
            assert!(bucket.try_consume(1));
        }
        assert!(!bucket.try_consume(1));

        // One token per second at 60/min.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.try_consume(1));
        assert!(!bucket.try_consume(1));

        // Empty bucket fills completely in 60s.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bucket.available(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn refund_never_exceeds_capacity() {
        let mut bucket = TokenBucket::per_minute(10);
        assert!(bucket.try_consume(4));
        bucket.refund(100);
        assert_eq!(bucket.available(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn force_consume_floors_at_zero() {
        let mut bucket = TokenBucket::per_minute(5);
        bucket.force_consume(50);
        assert_eq!(bucket.available(), 0);
        assert!(!bucket.try_consume(1));
    }

    #[tokio::test(start_paused = true)]
    async fn reports_time_to_next_token() {
        let mut bucket = TokenBucket::per_minute(60);
        while bucket.try_consume(1) {}
        assert!(bucket.time_to_available(1) >= 1);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(bucket.time_to_available(1), 0);
    }
}

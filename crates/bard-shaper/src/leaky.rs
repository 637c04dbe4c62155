//! A leaky bucket.

use std::time::{Duration, Instant};

/// A leaky bucket with inverted token semantics.
///
/// Here the token count is accumulated *load*: a send adds tokens and the
/// bucket drains at `rate` per second. A send is allowed only when the
/// bucket has drained empty, which paces bursts out to the configured rate.
#[derive(Debug)]
pub struct TokenBucketLeaky {
    rate: u64,
    tokens: i64,
    last_update: Instant,
}

impl TokenBucketLeaky {
    /// A new bucket starts empty (no accumulated load).
    pub fn new(rate: u64) -> Self {
        Self::new_at(rate, Instant::now())
    }

    pub fn new_at(rate: u64, now: Instant) -> Self {
        Self {
            rate,
            tokens: 0,
            last_update: now,
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn tokens(&self) -> i64 {
        self.tokens
    }

    pub fn set_rate(&mut self, rate: u64) {
        self.rate = rate;
        self.update();
    }

    /// Leak the load accumulated so far at `rate` per second.
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    pub fn update_at(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update);
        let leaked = (self.rate as u128 * elapsed.as_micros()) / 1_000_000;

        if leaked as i64 >= self.tokens {
            self.tokens = 0;
            self.last_update = now;
        } else if leaked > 0 {
            self.tokens -= leaked as i64;
            self.last_update = now;
        }
    }

    /// Add `length` of load. With `only_if_enough`, the load is added only
    /// when the bucket is empty.
    ///
    /// Returns whether the bucket was empty.
    pub fn drain(&mut self, length: u64, only_if_enough: bool) -> bool {
        self.drain_at(length, only_if_enough, Instant::now())
    }

    pub fn drain_at(&mut self, length: u64, only_if_enough: bool, now: Instant) -> bool {
        self.update_at(now);

        let empty = self.tokens == 0;
        if empty || !only_if_enough {
            self.tokens += length as i64;
        }
        empty
    }

    /// Add the load only if the bucket has fully drained.
    pub fn try_to_drain(&mut self, length: u64) -> bool {
        self.drain(length, true)
    }

    pub fn try_to_drain_at(&mut self, length: u64, now: Instant) -> bool {
        self.drain_at(length, true, now)
    }

    /// Time until the accumulated load falls to `n`.
    pub fn time_to_level(&self, n: i64) -> Duration {
        if self.tokens <= n {
            return Duration::ZERO;
        }
        if self.rate == 0 {
            return Duration::MAX;
        }
        let excess = (self.tokens - n) as u64;
        Duration::from_micros(excess.saturating_mul(1_000_000) / self.rate)
    }

    /// Time until the bucket has drained empty.
    ///
    /// The name is kept parallel to [`crate::TokenBucket::time_to_fill`]
    /// even though a leaky bucket "fills" by draining.
    pub fn time_to_fill(&self) -> Duration {
        self.time_to_level(0)
    }

    /// Discard the accumulated load.
    pub fn empty(&mut self) {
        self.empty_at(Instant::now());
    }

    pub fn empty_at(&mut self, now: Instant) {
        self.tokens = 0;
        self.last_update = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_and_accepts() {
        let now = Instant::now();
        let mut t = TokenBucketLeaky::new_at(1_000, now);
        assert_eq!(t.tokens(), 0);
        assert!(t.try_to_drain_at(500, now));
        assert_eq!(t.tokens(), 500);
    }

    #[test]
    fn refuses_until_drained() {
        let now = Instant::now();
        let mut t = TokenBucketLeaky::new_at(1_000, now);
        assert!(t.try_to_drain_at(500, now));

        // load drains at 1000/s: still 250 after 250ms
        assert!(!t.try_to_drain_at(100, now + Duration::from_millis(250)));
        assert_eq!(t.tokens(), 250);

        assert!(t.try_to_drain_at(100, now + Duration::from_millis(500)));
        assert_eq!(t.tokens(), 100);
    }

    #[test]
    fn unconditional_load_accumulates() {
        let now = Instant::now();
        let mut t = TokenBucketLeaky::new_at(100, now);
        assert!(t.drain_at(50, false, now));
        assert!(!t.drain_at(50, false, now));
        assert_eq!(t.tokens(), 100);
    }

    #[test]
    fn time_to_fill_is_drain_to_empty_time() {
        let now = Instant::now();
        let mut t = TokenBucketLeaky::new_at(1_000, now);
        assert!(t.try_to_drain_at(2_000, now));
        assert_eq!(t.time_to_fill(), Duration::from_secs(2));
        assert_eq!(t.time_to_level(1_000), Duration::from_secs(1));
    }
}

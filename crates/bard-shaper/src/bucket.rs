//! A basic token bucket.

use std::time::{Duration, Instant};

use log::debug;

/// A fill-style token bucket.
///
/// Tokens accrue at `rate` per second up to `depth`; a send drains tokens.
/// The token count is signed because [`TokenBucket::drain`] may be used
/// unconditionally, leaving a deficit that must be paid back before
/// [`TokenBucket::try_to_drain`] succeeds again.
///
/// All methods have an `_at` variant taking the current instant so callers
/// that own their clock (and the tests) get deterministic behavior; the
/// plain methods use `Instant::now()`.
#[derive(Debug)]
pub struct TokenBucket {
    depth: u64,
    rate: u64,
    tokens: i64,
    last_update: Instant,
}

impl TokenBucket {
    /// A new bucket starts full.
    pub fn new(depth: u64, rate: u64) -> Self {
        Self::new_at(depth, rate, Instant::now())
    }

    pub fn new_at(depth: u64, rate: u64, now: Instant) -> Self {
        Self {
            depth,
            rate,
            tokens: depth as i64,
            last_update: now,
        }
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn tokens(&self) -> i64 {
        self.tokens
    }

    pub fn set_depth(&mut self, depth: u64) {
        self.depth = depth;
        self.update();
    }

    pub fn set_rate(&mut self, rate: u64) {
        self.rate = rate;
        self.update();
    }

    /// Add the tokens that have accrued since the last update.
    ///
    /// `last_update` only advances when tokens were actually credited, so a
    /// slow rate still fills the bucket eventually instead of losing the
    /// sub-token remainder on every call.
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    pub fn update_at(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update);
        let accrued = (self.rate as u128 * elapsed.as_micros()) / 1_000_000;

        if self.tokens.saturating_add(accrued as i64) >= self.depth as i64 {
            self.tokens = self.depth as i64;
            self.last_update = now;
        } else if accrued > 0 {
            self.tokens += accrued as i64;
            self.last_update = now;
        }
        // accrued == 0: leave last_update alone so the elapsed time is not
        // discarded
    }

    /// Drain `length` tokens. With `only_if_enough`, the drain happens only
    /// when the bucket holds at least `length` tokens; otherwise the drain
    /// is unconditional and may leave a negative balance.
    ///
    /// Returns whether there were enough tokens.
    pub fn drain(&mut self, length: u64, only_if_enough: bool) -> bool {
        self.drain_at(length, only_if_enough, Instant::now())
    }

    pub fn drain_at(&mut self, length: u64, only_if_enough: bool, now: Instant) -> bool {
        self.update_at(now);

        let enough = self.tokens >= length as i64;
        if enough || !only_if_enough {
            self.tokens -= length as i64;
        }

        if !enough {
            debug!(
                "bucket drain of {length} tokens {} (tokens {})",
                if only_if_enough { "refused" } else { "overdrawn" },
                self.tokens
            );
        }
        enough
    }

    /// Drain only if the bucket has the capacity.
    pub fn try_to_drain(&mut self, length: u64) -> bool {
        self.drain(length, true)
    }

    pub fn try_to_drain_at(&mut self, length: u64, now: Instant) -> bool {
        self.drain_at(length, true, now)
    }

    /// Time until the bucket holds at least `n` tokens.
    pub fn time_to_level(&self, n: i64) -> Duration {
        if self.tokens >= n {
            return Duration::ZERO;
        }
        if self.rate == 0 {
            return Duration::MAX;
        }
        let deficit = (n - self.tokens) as u64;
        Duration::from_micros(deficit.saturating_mul(1_000_000) / self.rate)
    }

    /// Time until the bucket is full.
    pub fn time_to_fill(&self) -> Duration {
        self.time_to_level(self.depth as i64)
    }

    /// Discard all tokens.
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

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn starts_full() {
        let now = Instant::now();
        let t = TokenBucket::new_at(100, 10_000, now);
        assert_eq!(t.tokens(), 100);
        assert_eq!(t.time_to_fill(), Duration::ZERO);
    }

    #[test]
    fn steady_drain_at_the_configured_rate() {
        let mut now = Instant::now();
        let mut t = TokenBucket::new_at(100, 10_000, now);

        // 10 tokens every millisecond is exactly the refill rate
        for _ in 0..1000 {
            assert!(t.try_to_drain_at(10, now));
            now += MS;
        }
    }

    #[test]
    fn does_not_overfill() {
        let now = Instant::now();
        let mut t = TokenBucket::new_at(100, 10_000, now);
        assert!(t.try_to_drain_at(100, now));

        t.update_at(now + Duration::from_secs(5));
        assert_eq!(t.tokens(), 100);
    }

    #[test]
    fn refuses_without_capacity_and_keeps_tokens() {
        let now = Instant::now();
        let mut t = TokenBucket::new_at(100, 1_000, now);
        assert!(t.try_to_drain_at(100, now));
        assert!(!t.try_to_drain_at(1, now));
        assert_eq!(t.tokens(), 0);
    }

    #[test]
    fn unconditional_drain_goes_negative() {
        let now = Instant::now();
        let mut t = TokenBucket::new_at(10, 1_000, now);
        assert!(!t.drain_at(25, false, now));
        assert_eq!(t.tokens(), -15);
        // the deficit has to be paid back first
        assert!(!t.try_to_drain_at(1, now + Duration::from_millis(10)));
        assert!(t.try_to_drain_at(1, now + Duration::from_millis(16)));
    }

    #[test]
    fn slow_rates_accumulate_fractional_credit() {
        let mut now = Instant::now();
        let mut t = TokenBucket::new_at(1, 1, now);
        assert!(t.try_to_drain_at(1, now));

        // 10 updates of 100ms each never credit a whole token individually,
        // but last_update is preserved so the credit lands after a second
        for _ in 0..10 {
            now += Duration::from_millis(100);
            t.update_at(now);
        }
        assert_eq!(t.tokens(), 1);
    }

    #[test]
    fn time_to_level_reports_the_deficit() {
        let now = Instant::now();
        let mut t = TokenBucket::new_at(1, 1, now);
        assert!(t.try_to_drain_at(1, now));
        let wait = t.time_to_level(1);
        assert_eq!((wait.as_millis() as u64 + 500) / 1000, 1);

        let idle = TokenBucket::new_at(10, 0, now);
        assert_eq!(idle.time_to_level(5), Duration::ZERO);
    }

    #[test]
    fn sustained_rate_is_within_one_percent() {
        // drive 10 virtual seconds of 10ms polling against a 10k/s bucket
        let rate = 10_000u64;
        let mut now = Instant::now();
        let mut t = TokenBucket::new_at(100, rate, now);
        t.empty_at(now);

        let mut total = 0u64;
        for _ in 0..1000 {
            now += Duration::from_millis(10);
            while t.try_to_drain_at(10, now) {
                total += 10;
            }
            while t.try_to_drain_at(1, now) {
                total += 1;
            }
        }

        let expected = rate * 10;
        assert!(total >= expected * 99 / 100, "drained {total}");
        assert!(total <= expected * 101 / 100, "drained {total}");
    }
}

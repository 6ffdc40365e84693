//! Single-tier token bucket.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::rates::RateDefinition;
use crate::clock::elapsed_between;

/// Delay reported for a request that can never fit in the bucket.
pub const NEVER: Duration = Duration::MAX;

/// Slack allowed when comparing accrued tokens against a request.
const TOKEN_EPSILON: f64 = 1e-9;

/// A token bucket enforcing one [`RateDefinition`].
///
/// Tokens regenerate continuously at one per emission interval and are
/// capped at the definition's capacity. The token count is real valued so
/// that partial tokens accrued between requests are never lost.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    definition: RateDefinition,
    available: f64,
    last_updated: DateTime<Utc>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(definition: RateDefinition, now: DateTime<Utc>) -> Self {
        Self {
            definition,
            available: definition.capacity() as f64,
            last_updated: now,
        }
    }

    pub fn definition(&self) -> &RateDefinition {
        &self.definition
    }

    /// Tokens available as of the last update.
    pub fn available(&self) -> f64 {
        self.available
    }

    pub fn capacity(&self) -> f64 {
        self.definition.capacity() as f64
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Try to take `requested` tokens at `now`.
    ///
    /// Returns zero when the tokens were taken, otherwise the time until
    /// enough tokens will have accrued ([`NEVER`] if `requested` exceeds the
    /// capacity). A rejected request takes nothing.
    pub fn consume(&mut self, requested: i64, now: DateTime<Utc>) -> Duration {
        if requested <= 0 {
            return Duration::ZERO;
        }
        self.refill(now);
        let delay = self.delay_for(requested);
        if delay.is_zero() {
            self.debit(requested);
        }
        delay
    }

    /// Credit the tokens regenerated since the last update.
    pub(crate) fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = elapsed_between(self.last_updated, now);
        let regenerated = elapsed.as_secs_f64() / self.definition.emission_interval_secs();
        self.available = (self.available + regenerated).min(self.capacity());
        // A clock stepping backwards must not let the same interval accrue twice.
        if now > self.last_updated {
            self.last_updated = now;
        }
    }

    /// Time until `requested` tokens are available, without touching state.
    pub(crate) fn delay_for(&self, requested: i64) -> Duration {
        if requested <= 0 {
            return Duration::ZERO;
        }
        let requested = requested as f64;
        if requested > self.capacity() {
            return NEVER;
        }
        if self.available + TOKEN_EPSILON >= requested {
            return Duration::ZERO;
        }

        let missing = requested - self.available;
        round_up_to_nanos(missing * self.definition.emission_interval_secs())
    }

    pub(crate) fn debit(&mut self, requested: i64) {
        if requested > 0 {
            self.available = (self.available - requested as f64).max(0.0);
        }
    }

    /// Swap in a new definition for the same period, keeping accrued tokens.
    pub(crate) fn redefine(&mut self, definition: RateDefinition) {
        self.definition = definition;
        self.available = self.available.min(self.capacity());
    }
}

/// Convert seconds to a delay, rounding up to the next whole nanosecond so
/// that waiting the returned delay always accrues enough tokens.
fn round_up_to_nanos(secs: f64) -> Duration {
    let nanos = (secs * 1e9).ceil();
    if !nanos.is_finite() {
        return NEVER;
    }
    if nanos < u64::MAX as f64 {
        return Duration::from_nanos(nanos as u64).max(Duration::from_nanos(1));
    }
    Duration::try_from_secs_f64(secs).unwrap_or(NEVER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::add_duration;

    fn per_second(average: u64, burst: u64) -> RateDefinition {
        RateDefinition::new(Duration::from_secs(1), average, burst).unwrap()
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    #[test]
    fn test_new_bucket_is_full() {
        let bucket = TokenBucket::new(per_second(10, 0), epoch());
        assert_eq!(bucket.available(), 10.0);
    }

    #[test]
    fn test_consume_until_empty() {
        let mut bucket = TokenBucket::new(per_second(1, 1), epoch());

        assert_eq!(bucket.consume(1, epoch()), Duration::ZERO);

        let delay = bucket.consume(1, epoch());
        assert_eq!(delay, Duration::from_secs(1));
        assert_eq!(bucket.available(), 0.0);
    }

    #[test]
    fn test_replenishes_over_time() {
        let mut bucket = TokenBucket::new(per_second(1, 1), epoch());
        bucket.consume(1, epoch());

        let later = add_duration(epoch(), Duration::from_secs(1));
        assert_eq!(bucket.consume(1, later), Duration::ZERO);
    }

    #[test]
    fn test_fractional_accrual_is_kept() {
        let mut bucket = TokenBucket::new(per_second(2, 2), epoch());
        bucket.consume(2, epoch());

        // Half a token after 250ms: not enough, and the partial token stays.
        let t1 = add_duration(epoch(), Duration::from_millis(250));
        assert_eq!(bucket.consume(1, t1), Duration::from_millis(250));
        assert!((bucket.available() - 0.5).abs() < 1e-9);

        let t2 = add_duration(epoch(), Duration::from_millis(500));
        assert_eq!(bucket.consume(1, t2), Duration::ZERO);
        assert!(bucket.available().abs() < 1e-9);
    }

    #[test]
    fn test_refill_is_capped_at_burst() {
        let mut bucket = TokenBucket::new(per_second(10, 5), epoch());
        bucket.consume(5, epoch());

        let later = add_duration(epoch(), Duration::from_secs(60));
        bucket.refill(later);
        assert_eq!(bucket.available(), 5.0);
    }

    #[test]
    fn test_rejection_takes_nothing() {
        let mut bucket = TokenBucket::new(per_second(5, 5), epoch());
        bucket.consume(3, epoch());

        let delay = bucket.consume(3, epoch());
        assert_eq!(delay, Duration::from_millis(200));
        assert_eq!(bucket.available(), 2.0);
    }

    #[test]
    fn test_waiting_the_delay_is_enough() {
        let mut bucket = TokenBucket::new(per_second(3, 3), epoch());
        bucket.consume(3, epoch());

        let delay = bucket.consume(1, epoch());
        assert_eq!(delay, Duration::from_nanos(333_333_334));

        let later = add_duration(epoch(), delay);
        assert_eq!(bucket.consume(1, later), Duration::ZERO);
    }

    #[test]
    fn test_delay_rounds_up_to_whole_nanos() {
        assert_eq!(round_up_to_nanos(0.2), Duration::from_millis(200));
        assert_eq!(round_up_to_nanos(1.0 / 3.0), Duration::from_nanos(333_333_334));
        assert_eq!(round_up_to_nanos(1e-12), Duration::from_nanos(1));
        assert_eq!(round_up_to_nanos(f64::INFINITY), NEVER);
    }

    #[test]
    fn test_non_positive_request_is_a_no_op() {
        let mut bucket = TokenBucket::new(per_second(1, 1), epoch());
        bucket.consume(1, epoch());
        let updated = bucket.last_updated();

        let later = add_duration(epoch(), Duration::from_millis(500));
        assert_eq!(bucket.consume(0, later), Duration::ZERO);
        assert_eq!(bucket.consume(-5, later), Duration::ZERO);
        assert_eq!(bucket.available(), 0.0);
        assert_eq!(bucket.last_updated(), updated);
    }

    #[test]
    fn test_oversized_request_never_fits() {
        let mut bucket = TokenBucket::new(per_second(3, 3), epoch());

        assert_eq!(bucket.consume(4, epoch()), NEVER);
        assert_eq!(bucket.available(), 3.0);
    }

    #[test]
    fn test_backwards_clock_does_not_double_accrue() {
        let mut bucket = TokenBucket::new(per_second(1, 1), epoch());
        let t1 = add_duration(epoch(), Duration::from_secs(10));
        bucket.consume(1, t1);

        // Clock steps back, then returns to t1: no tokens were earned.
        bucket.refill(epoch());
        bucket.refill(t1);
        assert_eq!(bucket.available(), 0.0);
        assert_eq!(bucket.last_updated(), t1);
    }

    #[test]
    fn test_redefine_clamps_to_new_capacity() {
        let mut bucket = TokenBucket::new(per_second(10, 10), epoch());

        bucket.redefine(per_second(4, 4));
        assert_eq!(bucket.available(), 4.0);
        assert_eq!(bucket.definition().average(), 4);
    }
}

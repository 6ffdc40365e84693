//! Core rate limiter implementation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::bucket::NEVER;
use super::bucket_set::TokenBucketSet;
use super::rates::RateSet;
use super::store::{ExpiringKeyStore, DEFAULT_CAPACITY};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TollgateError};

/// Key used when a request carries no key of its own.
pub const DEFAULT_KEY: &str = "tollgate-default";

/// Idle keys are forgotten after this many of their longest period.
const IDLE_PERIODS: u64 = 10;

/// The outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    delay: Duration,
}

impl Decision {
    pub fn allowed(&self) -> bool {
        self.delay.is_zero()
    }

    /// How long until the same request would be admitted.
    ///
    /// `None` when the request was admitted or can never be admitted.
    pub fn retry_after(&self) -> Option<Duration> {
        if self.allowed() || self.is_permanent() {
            None
        } else {
            Some(self.delay)
        }
    }

    /// The request asks for more tokens than some tier can ever hold.
    pub fn is_permanent(&self) -> bool {
        self.delay == NEVER
    }
}

/// Per-key multi-tier token bucket rate limiter.
///
/// This struct is thread-safe and can be shared across multiple tasks. All
/// key state sits behind one lock, so concurrent checks for the same key
/// never interleave.
pub struct Limiter {
    state: Mutex<LimiterState>,
    clock: Arc<dyn Clock>,
}

struct LimiterState {
    /// Rates applied to every key
    default_rates: RateSet,
    /// Token buckets indexed by key
    bucket_sets: ExpiringKeyStore<String, TokenBucketSet>,
}

/// Builder for a [`Limiter`] with a custom capacity or clock.
pub struct LimiterBuilder {
    rates: RateSet,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl LimiterBuilder {
    /// Maximum number of keys tracked at once.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Time source used for refills and key expiry.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Limiter> {
        if self.rates.is_empty() {
            return Err(TollgateError::Config("provide default rates".to_string()));
        }
        let bucket_sets = ExpiringKeyStore::new(self.capacity)?;

        Ok(Limiter {
            state: Mutex::new(LimiterState {
                default_rates: self.rates,
                bucket_sets,
            }),
            clock: self.clock,
        })
    }
}

impl Limiter {
    /// Create a limiter on the system clock with the default capacity.
    pub fn new(rates: RateSet) -> Result<Self> {
        Self::builder(rates).build()
    }

    pub fn builder(rates: RateSet) -> LimiterBuilder {
        LimiterBuilder {
            rates,
            capacity: DEFAULT_CAPACITY,
            clock: Arc::new(SystemClock),
        }
    }

    /// Take `amount` tokens for `key`, returning whether the request is allowed.
    pub fn consume(&self, amount: i64, key: &str) -> Result<bool> {
        Ok(self.check(amount, key)?.allowed())
    }

    /// Take `amount` tokens for `key` and report the full decision.
    ///
    /// An empty key is tracked under [`DEFAULT_KEY`]. Existing keys pick up
    /// the current default rates before consuming.
    pub fn check(&self, amount: i64, key: &str) -> Result<Decision> {
        let key = if key.is_empty() { DEFAULT_KEY } else { key };
        let now = self.clock.now();

        trace!(key = key, amount = amount, "Checking rate limit");

        let delay = {
            let mut state = self.state.lock();
            let LimiterState {
                default_rates,
                bucket_sets,
            } = &mut *state;

            match bucket_sets.get_mut(key, now) {
                Some(bucket_set) => {
                    bucket_set.update(default_rates, now)?;
                    bucket_set.consume(amount, now)
                }
                None => {
                    let mut bucket_set = TokenBucketSet::new(default_rates, now)?;
                    let ttl = idle_ttl(bucket_set.max_period());
                    debug!(key = key, ttl = ?ttl, "Creating new bucket set");

                    let delay = bucket_set.consume(amount, now);
                    if let Some(evicted) = bucket_sets.set(key.to_string(), bucket_set, ttl, now)
                    {
                        debug!(evicted = %evicted, "Evicted key to stay within capacity");
                    }
                    delay
                }
            }
        };

        let decision = Decision { delay };
        if !decision.allowed() {
            debug!(
                key = key,
                amount = amount,
                retry_after = ?decision.retry_after(),
                permanent = decision.is_permanent(),
                "Rate limit exceeded"
            );
        }
        Ok(decision)
    }

    /// Replace the default rates; live keys adopt them on their next check.
    pub fn update_rates(&self, rates: RateSet) -> Result<()> {
        if rates.is_empty() {
            return Err(TollgateError::Config("provide default rates".to_string()));
        }
        info!(rates = %rates, "Default rates updated");
        self.state.lock().default_rates = rates;
        Ok(())
    }

    /// The current default rates.
    pub fn rates(&self) -> RateSet {
        self.state.lock().default_rates.clone()
    }

    /// Forget every key that has gone idle.
    ///
    /// Returns the number of keys reclaimed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        self.state.lock().bucket_sets.purge_expired(now)
    }

    /// Number of keys currently held, including idle ones not yet reclaimed.
    pub fn tracked_keys(&self) -> usize {
        self.state.lock().bucket_sets.len()
    }

    /// Maximum number of keys held at once.
    pub fn capacity(&self) -> usize {
        self.state.lock().bucket_sets.capacity()
    }

    /// Forget all keys.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.state.lock().bucket_sets.clear();
    }
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// TTL for a new key: ten of its longest periods (in whole seconds) plus one second.
fn idle_ttl(max_period: Duration) -> Duration {
    Duration::from_secs(max_period.as_secs().saturating_mul(IDLE_PERIODS).saturating_add(1))
}

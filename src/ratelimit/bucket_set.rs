//! Multi-tier token bucket set.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::bucket::TokenBucket;
use super::rates::RateSet;
use crate::error::{Result, TollgateError};

/// One [`TokenBucket`] per tier of a [`RateSet`], consumed all-or-nothing.
///
/// A request is admitted only when every tier can cover it. When any tier
/// rejects, no tier is debited and the longest delay is reported.
#[derive(Debug, Clone)]
pub struct TokenBucketSet {
    /// Buckets in rate set order
    buckets: Vec<TokenBucket>,
    /// Longest period among the buckets
    max_period: Duration,
}

impl TokenBucketSet {
    /// Create a set of full buckets for `rates`.
    pub fn new(rates: &RateSet, now: DateTime<Utc>) -> Result<Self> {
        if rates.is_empty() {
            return Err(TollgateError::Config(
                "bucket set requires at least one rate".to_string(),
            ));
        }
        Ok(Self {
            buckets: rates
                .iter()
                .map(|definition| TokenBucket::new(*definition, now))
                .collect(),
            max_period: rates.max_period(),
        })
    }

    /// Try to take `amount` tokens from every tier at `now`.
    ///
    /// Returns zero when admitted, otherwise the largest delay across tiers.
    pub fn consume(&mut self, amount: i64, now: DateTime<Utc>) -> Duration {
        if amount <= 0 {
            return Duration::ZERO;
        }

        for bucket in &mut self.buckets {
            bucket.refill(now);
        }

        let delay = self
            .buckets
            .iter()
            .map(|bucket| bucket.delay_for(amount))
            .max()
            .unwrap_or(Duration::ZERO);

        if delay.is_zero() {
            for bucket in &mut self.buckets {
                bucket.debit(amount);
            }
        }
        delay
    }

    /// Reconcile the buckets with a possibly changed rate set.
    ///
    /// Tiers whose period is unchanged keep their tokens, tiers with a new
    /// period start full and tiers no longer present are dropped. On error
    /// the set is left as it was.
    pub fn update(&mut self, rates: &RateSet, now: DateTime<Utc>) -> Result<()> {
        if rates.is_empty() {
            return Err(TollgateError::Config(
                "cannot update bucket set with an empty rate set".to_string(),
            ));
        }

        let unchanged = self.buckets.len() == rates.len()
            && self
                .buckets
                .iter()
                .zip(rates.iter())
                .all(|(bucket, definition)| bucket.definition() == definition);
        if unchanged {
            return Ok(());
        }

        let mut previous = std::mem::take(&mut self.buckets);
        self.buckets = rates
            .iter()
            .map(|definition| {
                match previous
                    .iter()
                    .position(|bucket| bucket.definition().period() == definition.period())
                {
                    Some(index) => {
                        let mut bucket = previous.swap_remove(index);
                        bucket.redefine(*definition);
                        bucket
                    }
                    None => TokenBucket::new(*definition, now),
                }
            })
            .collect();
        self.max_period = rates.max_period();

        debug!(
            tiers = self.buckets.len(),
            dropped = previous.len(),
            max_period = ?self.max_period,
            "Bucket set reconciled with updated rates"
        );
        Ok(())
    }

    /// The longest period among the tiers.
    pub fn max_period(&self) -> Duration {
        self.max_period
    }

    /// The bucket enforcing the tier with exactly this period.
    pub fn bucket(&self, period: Duration) -> Option<&TokenBucket> {
        self.buckets
            .iter()
            .find(|bucket| bucket.definition().period() == period)
    }

    pub fn buckets(&self) -> &[TokenBucket] {
        &self.buckets
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

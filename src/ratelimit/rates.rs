//! Rate definitions and rate sets.
//!
//! A [`RateDefinition`] is one tier: "`average` tokens per `period`, holding at
//! most `capacity` tokens". A [`RateSet`] is the ordered list of tiers enforced
//! together for every key.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Named rate periods (matches the configuration file format).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }

    fn parse(unit: &str) -> Option<Self> {
        match unit.to_ascii_lowercase().as_str() {
            "s" | "sec" | "second" => Some(TimeUnit::Second),
            "m" | "min" | "minute" => Some(TimeUnit::Minute),
            "h" | "hour" => Some(TimeUnit::Hour),
            "d" | "day" => Some(TimeUnit::Day),
            _ => None,
        }
    }
}

/// A single rate tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateDefinition {
    period: Duration,
    average: u64,
    burst: u64,
}

impl RateDefinition {
    /// Create a validated rate definition.
    ///
    /// A `burst` of zero means the bucket holds exactly `average` tokens.
    pub fn new(period: Duration, average: u64, burst: u64) -> Result<Self> {
        if period.is_zero() {
            return Err(TollgateError::Config(
                "rate period must be greater than zero".to_string(),
            ));
        }
        if average == 0 {
            return Err(TollgateError::Config(format!(
                "rate limit for period {:?} must be greater than zero",
                period
            )));
        }
        Ok(Self {
            period,
            average,
            burst,
        })
    }

    /// The refill period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Tokens regenerated per period.
    pub fn average(&self) -> u64 {
        self.average
    }

    /// The configured burst (zero when it defaults to `average`).
    pub fn burst(&self) -> u64 {
        self.burst
    }

    /// Maximum number of tokens the bucket may hold.
    pub fn capacity(&self) -> u64 {
        if self.burst > 0 {
            self.burst
        } else {
            self.average
        }
    }

    /// Time to regenerate one token, in fractional seconds.
    pub fn emission_interval_secs(&self) -> f64 {
        self.period.as_secs_f64() / self.average as f64
    }

    /// Time to regenerate one token, saturating at `Duration::MAX`.
    pub fn emission_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.emission_interval_secs()).unwrap_or(Duration::MAX)
    }
}

impl fmt::Display for RateDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}s burst {}",
            self.average,
            self.period.as_secs_f64(),
            self.capacity()
        )
    }
}

/// Parses the compact form `<average>/<unit>[:<burst>]`, e.g. `100/sec`,
/// `1000/hour:50` or `3/3` (a bare number is a period in seconds).
impl FromStr for RateDefinition {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TollgateError::Config(format!("invalid rate '{}'", s));

        let (rate, burst) = match s.trim().split_once(':') {
            Some((rate, burst)) => (rate, burst.trim().parse::<u64>().map_err(|_| invalid())?),
            None => (s.trim(), 0),
        };
        let (average, unit) = rate.split_once('/').ok_or_else(invalid)?;
        let average = average.trim().parse::<u64>().map_err(|_| invalid())?;

        let unit = unit.trim();
        let period = match TimeUnit::parse(unit) {
            Some(unit) => unit.duration(),
            None => Duration::from_secs(unit.parse::<u64>().map_err(|_| invalid())?),
        };

        RateDefinition::new(period, average, burst)
    }
}

/// An ordered collection of rate tiers, at most one per period.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateSet {
    definitions: Vec<RateDefinition>,
}

impl RateSet {
    /// Create an empty rate set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a rate set from definitions, rejecting duplicate periods.
    pub fn from_definitions<I>(definitions: I) -> Result<Self>
    where
        I: IntoIterator<Item = RateDefinition>,
    {
        let mut set = Self::new();
        for definition in definitions {
            set.insert(definition)?;
        }
        Ok(set)
    }

    /// Add a tier of `average` tokens per `period` with the given `burst`.
    pub fn add(&mut self, period: Duration, average: u64, burst: u64) -> Result<()> {
        self.insert(RateDefinition::new(period, average, burst)?)
    }

    /// Add an already validated tier.
    pub fn insert(&mut self, definition: RateDefinition) -> Result<()> {
        if self.get(definition.period()).is_some() {
            return Err(TollgateError::Config(format!(
                "rate for period {:?} already exists",
                definition.period()
            )));
        }
        self.definitions.push(definition);
        Ok(())
    }

    /// Look up the tier for an exact period.
    pub fn get(&self, period: Duration) -> Option<&RateDefinition> {
        self.definitions.iter().find(|d| d.period() == period)
    }

    /// Iterate the tiers in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, RateDefinition> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// The longest period among the tiers, zero for an empty set.
    pub fn max_period(&self) -> Duration {
        self.definitions
            .iter()
            .map(RateDefinition::period)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

impl<'a> IntoIterator for &'a RateSet {
    type Item = &'a RateDefinition;
    type IntoIter = std::slice::Iter<'a, RateDefinition>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for RateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, definition) in self.definitions.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", definition)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_add_rejects_invalid_definitions() {
        let mut rates = RateSet::new();

        assert!(rates.add(Duration::ZERO, 1, 1).is_err());
        assert!(rates.add(Duration::from_secs(1), 0, 1).is_err());
        assert!(rates.is_empty());
    }

    #[test]
    fn test_add_rejects_duplicate_period() {
        let mut rates = RateSet::new();
        rates.add(Duration::from_secs(1), 10, 10).unwrap();

        let err = rates.add(Duration::from_secs(1), 20, 20).unwrap_err();
        assert!(matches!(err, TollgateError::Config(_)));
        assert_eq!(rates.len(), 1);
        assert_eq!(rates.get(Duration::from_secs(1)).unwrap().average(), 10);
    }

    #[test]
    fn test_insertion_order_and_max_period() {
        let mut rates = RateSet::new();
        rates.add(Duration::from_secs(60), 100, 0).unwrap();
        rates.add(Duration::from_secs(1), 5, 0).unwrap();
        rates.add(Duration::from_secs(3600), 1000, 0).unwrap();

        let periods: Vec<u64> = rates.iter().map(|d| d.period().as_secs()).collect();
        assert_eq!(periods, vec![60, 1, 3600]);
        assert_eq!(rates.max_period(), Duration::from_secs(3600));
        assert_eq!(RateSet::new().max_period(), Duration::ZERO);
    }

    #[test]
    fn test_capacity_defaults_to_average() {
        let rate = RateDefinition::new(Duration::from_secs(1), 10, 0).unwrap();
        assert_eq!(rate.capacity(), 10);

        let rate = RateDefinition::new(Duration::from_secs(1), 10, 25).unwrap();
        assert_eq!(rate.capacity(), 25);
    }

    #[test]
    fn test_emission_interval_is_fractional() {
        let rate = RateDefinition::new(Duration::from_secs(1), 4, 0).unwrap();
        assert_eq!(rate.emission_interval(), Duration::from_millis(250));

        let rate = RateDefinition::new(Duration::from_secs(1), 3, 0).unwrap();
        assert!((rate.emission_interval_secs() - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_emission_interval_saturates() {
        let rate = RateDefinition::new(Duration::MAX, 1, 0).unwrap();
        assert_eq!(rate.emission_interval(), Duration::MAX);
    }

    #[test]
    fn test_parse_compact_rates() {
        let rate: RateDefinition = "100/sec".parse::<RateDefinition>().unwrap();
        assert_eq!(rate.period(), Duration::from_secs(1));
        assert_eq!(rate.average(), 100);
        assert_eq!(rate.capacity(), 100);

        let rate: RateDefinition = "1000/hour:50".parse().unwrap();
        assert_eq!(rate.period(), Duration::from_secs(3600));
        assert_eq!(rate.capacity(), 50);

        let rate: RateDefinition = "3/3".parse().unwrap();
        assert_eq!(rate.period(), Duration::from_secs(3));
        assert_eq!(rate.average(), 3);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<RateDefinition>().is_err());
        assert!("100".parse::<RateDefinition>().is_err());
        assert!("abc/sec".parse::<RateDefinition>().is_err());
        assert!("10/fortnight".parse::<RateDefinition>().is_err());
        assert!("0/sec".parse::<RateDefinition>().is_err());
        assert!("10/0".parse::<RateDefinition>().is_err());
        assert!("10/sec:x".parse::<RateDefinition>().is_err());
    }

    #[test]
    fn test_display() {
        let rates = RateSet::from_definitions(vec![
            "100/sec".parse::<RateDefinition>().unwrap(),
            "1000/hour".parse::<RateDefinition>().unwrap(),
        ])
        .unwrap();

        assert_eq!(rates.to_string(), "100/1s burst 100, 1000/3600s burst 1000");
    }
}

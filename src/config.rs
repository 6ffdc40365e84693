//! Configuration management for Tollgate.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{RateDefinition, RateSet, TimeUnit, DEFAULT_CAPACITY};

/// Prefix for environment overrides, e.g. `TOLLGATE__LIMITER__CAPACITY=1024`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Rate limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum number of keys tracked at once
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Interval between sweeps for idle keys, in seconds (0 disables sweeping)
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_secs: u64,

    /// Rate tiers applied to every key
    #[serde(default)]
    pub rates: Vec<RateRule>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            reclaim_interval_secs: default_reclaim_interval(),
            rates: Vec::new(),
        }
    }
}

/// A single rate tier as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRule {
    /// Number of requests allowed per unit of time
    pub requests_per_unit: u64,
    /// The time unit
    pub unit: TimeUnit,
    /// Bucket size; zero means the same as `requests_per_unit`
    #[serde(default)]
    pub burst: u64,
}

impl RateRule {
    pub fn definition(&self) -> Result<RateDefinition> {
        RateDefinition::new(self.unit.duration(), self.requests_per_unit, self.burst)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_reclaim_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LimiterConfig {
    /// Build and validate the configured rate set.
    pub fn rate_set(&self) -> Result<RateSet> {
        let definitions = self
            .rates
            .iter()
            .map(RateRule::definition)
            .collect::<Result<Vec<_>>>()?;
        let rates = RateSet::from_definitions(definitions)?;
        if rates.is_empty() {
            return Err(TollgateError::Config("no rates configured".to_string()));
        }
        Ok(rates)
    }

    /// Sweep interval for idle keys, `None` when sweeping is disabled.
    pub fn reclaim_interval(&self) -> Option<Duration> {
        match self.reclaim_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Layer defaults, an optional file and `TOLLGATE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
limiter:
  capacity: 1024
  reclaim_interval_secs: 5
  rates:
    - requests_per_unit: 100
      unit: second
    - requests_per_unit: 1000
      unit: hour
      burst: 200
logging:
  format: json
"#;

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();
        assert_eq!(config.limiter.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.limiter.reclaim_interval(), Some(Duration::from_secs(30)));
        assert!(config.limiter.rates.is_empty());
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_yaml() {
        let config = TollgateConfig::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.limiter.capacity, 1024);
        assert_eq!(config.limiter.reclaim_interval(), Some(Duration::from_secs(5)));
        assert_eq!(config.logging.format, LogFormat::Json);

        let rates = config.limiter.rate_set().unwrap();
        assert_eq!(rates.len(), 2);
        let hourly = rates.get(Duration::from_secs(3600)).unwrap();
        assert_eq!(hourly.average(), 1000);
        assert_eq!(hourly.capacity(), 200);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = TollgateConfig::from_yaml("{}").unwrap();
        assert_eq!(config.limiter.capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn test_missing_rates_rejected() {
        let config = TollgateConfig::default();
        assert!(matches!(config.limiter.rate_set(), Err(TollgateError::Config(_))));
    }

    #[test]
    fn test_duplicate_unit_rejected() {
        let yaml = r#"
limiter:
  rates:
    - requests_per_unit: 10
      unit: minute
    - requests_per_unit: 20
      unit: minute
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        assert!(config.limiter.rate_set().is_err());
    }

    #[test]
    fn test_unknown_unit_rejected() {
        let yaml = r#"
limiter:
  rates:
    - requests_per_unit: 10
      unit: fortnight
"#;
        assert!(TollgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_interval_disables_reclaim() {
        let config = LimiterConfig {
            reclaim_interval_secs: 0,
            ..LimiterConfig::default()
        };
        assert_eq!(config.reclaim_interval(), None);
    }

    #[test]
    fn test_load_layers_file() {
        let path = std::env::temp_dir().join(format!("tollgate-test-{}.yaml", std::process::id()));
        std::fs::write(&path, SAMPLE).unwrap();

        let config = TollgateConfig::load(Some(&path));
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(config.limiter.capacity, 1024);
        assert_eq!(config.limiter.rate_set().unwrap().len(), 2);
    }

    #[test]
    fn test_load_env_override() {
        // Other tests load concurrently, so override a field none of them assert on.
        std::env::set_var("TOLLGATE__LIMITER__RECLAIM_INTERVAL_SECS", "77");
        let config = TollgateConfig::load(None);
        std::env::remove_var("TOLLGATE__LIMITER__RECLAIM_INTERVAL_SECS");

        let config = config.unwrap();
        assert_eq!(config.limiter.reclaim_interval(), Some(Duration::from_secs(77)));
        assert_eq!(config.limiter.capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn test_from_file_missing_path() {
        let result = TollgateConfig::from_file("/nonexistent/tollgate.yaml");
        assert!(matches!(result, Err(TollgateError::Io(_))));
    }
}

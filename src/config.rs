//! Configuration management for Readgate.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ReadgateError, Result};
use crate::ratelimit::{CategoryLimits, RetentionPolicy};

/// Prefix for environment overrides, e.g. `READGATE__LIMITER__MAX_ATTEMPTS=8`.
const ENV_PREFIX: &str = "READGATE";

/// Main configuration for Readgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadgateConfig {
    /// Counter database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Limiter behavior
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Per-category limits
    #[serde(default)]
    pub limits: CategoryLimits,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Counter database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long to wait for a pooled connection, in milliseconds
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    500
}

/// What the limiter answers when it cannot reach a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Reject the call
    #[default]
    Closed,
    /// Admit the call
    Open,
}

impl FailurePolicy {
    pub fn admits(&self) -> bool {
        matches!(self, FailurePolicy::Open)
    }
}

/// Limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Decision when the store fails or retries run out
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Minimum read-check-write attempts per call before giving up.
    ///
    /// A call for a key with limit `n` always gets at least `n + 1` attempts:
    /// each lost write means another caller was admitted, so that many
    /// attempts are enough to either win a slot or see the window full.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff between conflicting attempts, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Run a bulk sweep at most once per this many widest windows
    #[serde(default = "default_sweep_interval_windows")]
    pub sweep_interval_windows: u32,

    /// Rows older than this many widest windows are swept
    #[serde(default = "default_retention_multiplier")]
    pub retention_multiplier: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            sweep_interval_windows: default_sweep_interval_windows(),
            retention_multiplier: default_retention_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    16
}

fn default_retry_backoff_ms() -> u64 {
    2
}

fn default_sweep_interval_windows() -> u32 {
    10
}

fn default_retention_multiplier() -> u32 {
    2
}

impl LimiterConfig {
    /// The retention part of this configuration.
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            sweep_interval_windows: self.sweep_interval_windows,
            retention_multiplier: self.retention_multiplier,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ReadgateError::Config(
                "limiter.max_attempts must be at least 1".to_string(),
            ));
        }
        self.retention().validate()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ReadgateConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        let config: ReadgateConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ReadgateConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()?;
        self.limits.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::TimeUnit;

    #[test]
    fn test_defaults() {
        let config = ReadgateConfig::default();
        assert_eq!(config.limiter.failure_policy, FailurePolicy::Closed);
        assert_eq!(config.limiter.max_attempts, 16);
        assert_eq!(config.limiter.sweep_interval_windows, 10);
        assert_eq!(config.limiter.retention_multiplier, 2);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
limiter:
  failure_policy: open
  max_attempts: 4
  retention_multiplier: 3
limits:
  generation:
    requests_per_unit: 5
    unit: hour
database:
  url: postgres://localhost/readgate
"#;
        let config = ReadgateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.limiter.failure_policy, FailurePolicy::Open);
        assert_eq!(config.limiter.max_attempts, 4);
        assert_eq!(config.limiter.retention_multiplier, 3);
        // Unset fields keep their defaults
        assert_eq!(config.limiter.sweep_interval_windows, 10);
        assert_eq!(config.limits.generation.requests_per_unit, 5);
        assert_eq!(config.limits.generation.unit, TimeUnit::Hour);
        assert_eq!(config.limits.chat.requests_per_unit, 30);
        assert_eq!(
            config.database.url.as_deref(),
            Some("postgres://localhost/readgate")
        );
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = ReadgateConfig::from_yaml("{}").unwrap();
        assert_eq!(config.limiter, LimiterConfig::default());
    }

    #[test]
    fn test_rejects_zero_retention() {
        let yaml = r#"
limiter:
  retention_multiplier: 0
"#;
        assert!(matches!(
            ReadgateConfig::from_yaml(yaml),
            Err(ReadgateError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let yaml = r#"
limiter:
  max_attempts: 0
"#;
        assert!(ReadgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_failure_policy_admits() {
        assert!(!FailurePolicy::Closed.admits());
        assert!(FailurePolicy::Open.admits());
    }
}

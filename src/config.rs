/*!
 * Configuration types for the resilience primitives
 *
 * Every section is optional in a config file; missing keys fall back to the
 * same defaults the constructors use. Durations are written in milliseconds.
 *
 * ```toml
 * [logging]
 * level = "debug"
 *
 * [breakers.inventory]
 * timeout_ms = 2000
 * failure_threshold = 5
 *
 * [retry]
 * max_attempts = 3
 * initial_backoff_ms = 1000
 * backoff_increment_ms = 500
 *
 * [limiter]
 * capacity = 10
 * acquire_timeout_ms = 100
 *
 * [rate_limit]
 * capacity = 3
 * tokens_per_interval = 2
 * interval_ms = 1000
 * ```
 */

use crate::breaker::{Breaker, BreakerRegistry, BreakerSettings};
use crate::error::ResilienceError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Serde adapter storing a [`Duration`] as whole milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Verbosity of the events emitted by the primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Nothing; failures reach callers as return values
    Error,

    /// Breaker trips, timeouts, exhausted retries, over-releases
    Warn,

    /// Group configuration and refill task start/stop
    #[default]
    Info,

    /// Per-call admission, fallback, backoff and refill loop exit
    Debug,

    /// All of the crate's events
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Logging output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level applied when `RUST_LOG` is not set
    pub level: LogLevel,

    /// Emit JSON lines instead of compact text
    pub json: bool,
}

/// Concurrency limiter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Number of tickets in the pool
    pub capacity: usize,

    /// How long callers wait for a ticket
    #[serde(rename = "acquire_timeout_ms", with = "duration_ms")]
    pub acquire_timeout: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            acquire_timeout: Duration::from_millis(100),
        }
    }
}

/// Token bucket settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Maximum number of tokens held at once
    pub capacity: usize,

    /// Tokens added per interval
    pub tokens_per_interval: u32,

    /// Refill interval
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 3,
            tokens_per_interval: 2,
            interval: Duration::from_secs(1),
        }
    }
}

/// Complete configuration for a service using the primitives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Logging output
    pub logging: LoggingConfig,

    /// Breaker settings per group name
    pub breakers: BTreeMap<String, BreakerSettings>,

    /// Retry policy
    pub retry: RetryPolicy,

    /// Concurrency limiter
    pub limiter: LimiterConfig,

    /// Rate limiter
    pub rate_limit: BucketConfig,
}

impl ResilienceConfig {
    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ResilienceError> {
        let config: ResilienceConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ResilienceError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String, ResilienceError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ResilienceError> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Check every value the constructors would reject
    pub fn validate(&self) -> Result<(), ResilienceError> {
        for (group, settings) in &self.breakers {
            if settings.timeout.is_zero() {
                return Err(invalid(format!("breaker '{}': timeout_ms must be > 0", group)));
            }
            if settings.failure_threshold == 0 || settings.success_threshold == 0 {
                return Err(invalid(format!(
                    "breaker '{}': failure_threshold and success_threshold must be > 0",
                    group
                )));
            }
        }

        check_capacity("limiter", self.limiter.capacity)?;
        check_capacity("rate_limit", self.rate_limit.capacity)?;

        if self.rate_limit.tokens_per_interval == 0 {
            return Err(invalid("rate_limit: tokens_per_interval must be > 0".to_string()));
        }
        if (self.rate_limit.interval / self.rate_limit.tokens_per_interval).is_zero() {
            return Err(invalid(format!(
                "rate_limit: interval_ms {} is too short for {} tokens",
                self.rate_limit.interval.as_millis(),
                self.rate_limit.tokens_per_interval
            )));
        }

        Ok(())
    }

    /// Install every configured breaker group into `registry`
    pub fn apply_breakers(&self, registry: &BreakerRegistry) {
        for (group, settings) in &self.breakers {
            registry.configure(group, settings.clone());
        }
    }
}

fn check_capacity(section: &str, capacity: usize) -> Result<(), ResilienceError> {
    if capacity == 0 || capacity > Semaphore::MAX_PERMITS {
        return Err(invalid(format!(
            "{}: capacity must be between 1 and {}, got {}",
            section,
            Semaphore::MAX_PERMITS,
            capacity
        )));
    }
    Ok(())
}

fn invalid(message: String) -> ResilienceError {
    ResilienceError::InvalidConfig(message)
}

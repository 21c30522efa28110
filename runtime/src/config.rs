//! Configuration for the resilience stack.
//!
//! One TOML document configures every pattern:
//!
//! ```toml
//! [circuit_breaker]
//! failure_threshold = 5
//! success_threshold = 2
//! open_timeout_secs = 60
//! call_timeout_ms = 2000
//! failure_kinds = ["transient", "timeout", "retries_exhausted"]
//!
//! [circuit_breaker.adaptive]
//! min_threshold = 3
//! max_threshold = 20
//! adaptation_period_secs = 300
//! min_samples = 10
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 100
//! max_delay_ms = 30000
//! exponential_base = 2.0
//! jitter_factor = 0.1
//!
//! [rate_limiter]
//! rate = 100.0
//! per_secs = 60
//! burst = 20.0
//! acquire_timeout_ms = 500
//!
//! [dead_letter_queue]
//! backend = "file"
//! path = "/var/lib/app/dlq.jsonl"
//! retention_secs = 604800
//! alert_threshold = 100
//! ```
//!
//! Every section and field is optional; missing values take the documented
//! defaults.
//!
//! # Example
//!
//! ```no_run
//! use bulwark_runtime::config::ResilienceConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Path from BULWARK_CONFIG, defaults when unset
//! let config = ResilienceConfig::from_env()?;
//!
//! let breaker = config.circuit_breaker.to_config("payments")?;
//! let retry = config.retry.to_policy()?;
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::{AdaptiveThreshold, CircuitBreakerConfig};
use crate::rate_limiter::RateLimiterConfig;
use crate::retry::RetryPolicy;
use bulwark_core::ErrorClassifier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the configuration file path.
pub const CONFIG_ENV_VAR: &str = "BULWARK_CONFIG";

/// Configuration error
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        /// File that was requested
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid TOML for this schema
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("Invalid configuration for `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`].
    #[must_use]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceConfig {
    /// `[circuit_breaker]`
    pub circuit_breaker: CircuitBreakerSection,
    /// `[retry]`
    pub retry: RetrySection,
    /// `[rate_limiter]`
    pub rate_limiter: RateLimiterSection,
    /// `[dead_letter_queue]`
    pub dead_letter_queue: DeadLetterQueueSection,
}

impl ResilienceConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&input)?;
        tracing::info!(path = %path.display(), "Loaded resilience configuration");
        Ok(config)
    }

    /// Load from the file named by `BULWARK_CONFIG`, or defaults when unset.
    ///
    /// # Errors
    ///
    /// Same as [`from_file`](Self::from_file).
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::from_file(PathBuf::from(path)),
            None => {
                tracing::debug!("{CONFIG_ENV_VAR} not set, using default resilience configuration");
                Ok(Self::default())
            }
        }
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Invalid`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.to_config("validate")?;
        self.retry.to_policy()?;
        self.rate_limiter.to_config()?;
        self.dead_letter_queue.validate()
    }
}

/// `[circuit_breaker]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerSection {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Consecutive probe successes before closing
    pub success_threshold: u32,
    /// Seconds to stay open before probing
    pub open_timeout_secs: u64,
    /// Per-call timeout in milliseconds
    pub call_timeout_ms: Option<u64>,
    /// Error kinds that count as failures
    pub failure_kinds: ErrorClassifier,
    /// Adapt the failure threshold to the observed error rate
    pub adaptive: Option<AdaptiveSection>,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_secs: 60,
            call_timeout_ms: None,
            failure_kinds: ErrorClassifier::breaker_failures(),
            adaptive: None,
        }
    }
}

impl CircuitBreakerSection {
    /// Get open timeout as Duration
    #[must_use]
    pub const fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    /// Build a validated breaker configuration named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for out-of-range values.
    pub fn to_config(&self, name: &str) -> Result<CircuitBreakerConfig, ConfigError> {
        let mut builder = CircuitBreakerConfig::builder()
            .name(name)
            .failure_threshold(self.failure_threshold)
            .success_threshold(self.success_threshold)
            .open_timeout(self.open_timeout())
            .failure_classifier(self.failure_kinds.clone());
        if let Some(ms) = self.call_timeout_ms {
            builder = builder.call_timeout(Duration::from_millis(ms));
        }
        if let Some(adaptive) = &self.adaptive {
            builder = builder.adaptive(adaptive.to_threshold());
        }
        builder.build()
    }
}

/// `[circuit_breaker.adaptive]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdaptiveSection {
    /// Lowest failure threshold
    pub min_threshold: u32,
    /// Highest failure threshold
    pub max_threshold: u32,
    /// Seconds between adjustments
    pub adaptation_period_secs: u64,
    /// Calls needed before a window is evaluated
    pub min_samples: u32,
}

impl Default for AdaptiveSection {
    fn default() -> Self {
        let defaults = AdaptiveThreshold::default();
        Self {
            min_threshold: defaults.min_threshold,
            max_threshold: defaults.max_threshold,
            adaptation_period_secs: defaults.adaptation_period.as_secs(),
            min_samples: defaults.min_samples,
        }
    }
}

impl AdaptiveSection {
    /// Convert to the breaker's adaptive setting.
    #[must_use]
    pub const fn to_threshold(&self) -> AdaptiveThreshold {
        AdaptiveThreshold {
            min_threshold: self.min_threshold,
            max_threshold: self.max_threshold,
            adaptation_period: Duration::from_secs(self.adaptation_period_secs),
            min_samples: self.min_samples,
        }
    }
}

/// `[retry]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    /// Total tries including the first
    pub max_attempts: u32,
    /// Delay after the first failure, in milliseconds
    pub base_delay_ms: u64,
    /// Backoff cap, in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub exponential_base: f64,
    /// Jitter fraction (0.0-1.0)
    pub jitter_factor: f64,
    /// Error kinds that trigger another attempt
    pub retryable_kinds: ErrorClassifier,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            exponential_base: policy.exponential_base,
            jitter_factor: policy.jitter_factor,
            retryable_kinds: policy.retryable,
        }
    }
}

impl RetrySection {
    /// Build a validated retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for out-of-range values.
    pub fn to_policy(&self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .exponential_base(self.exponential_base)
            .jitter_factor(self.jitter_factor)
            .retryable(self.retryable_kinds.clone())
            .build()
    }
}

/// `[rate_limiter]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimiterSection {
    /// Tokens granted per window
    pub rate: f64,
    /// Window length in seconds
    pub per_secs: u64,
    /// Extra capacity above `rate`
    pub burst: f64,
    /// When set, callers wait up to this long for a token instead of being rejected
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for RateLimiterSection {
    fn default() -> Self {
        let config = RateLimiterConfig::default();
        Self {
            rate: config.rate,
            per_secs: 1,
            burst: config.burst,
            acquire_timeout_ms: None,
        }
    }
}

impl RateLimiterSection {
    /// Build a validated limiter configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for out-of-range values.
    pub fn to_config(&self) -> Result<RateLimiterConfig, ConfigError> {
        let config = RateLimiterConfig::new(self.rate, Duration::from_secs(self.per_secs))
            .with_burst(self.burst);
        config.validate()?;
        Ok(config)
    }

    /// Get acquire timeout as Duration
    #[must_use]
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

/// Storage backend names accepted in `[dead_letter_queue].backend`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process memory
    #[default]
    Memory,
    /// JSON-lines log file
    File,
    /// PostgreSQL table
    Postgres,
}

/// Resolved storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlqBackend {
    /// Process memory
    Memory,
    /// JSON-lines log at `path`
    File {
        /// Log file location
        path: PathBuf,
    },
    /// PostgreSQL reachable at `url`
    Postgres {
        /// Connection string
        url: String,
    },
}

/// `[dead_letter_queue]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeadLetterQueueSection {
    /// Storage backend
    pub backend: BackendKind,
    /// Log file for the `file` backend
    pub path: Option<PathBuf>,
    /// Connection string for the `postgres` backend
    pub url: Option<String>,
    /// Messages older than this many seconds are removed by `purge_expired`
    pub retention_secs: u64,
    /// Log a warning once the queue holds this many messages
    pub alert_threshold: Option<usize>,
}

impl Default for DeadLetterQueueSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            path: None,
            url: None,
            retention_secs: 7 * 24 * 60 * 60,
            alert_threshold: None,
        }
    }
}

impl DeadLetterQueueSection {
    /// Get retention as Duration
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Resolve the backend together with its location.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `file` has no `path` or
    /// `postgres` has no `url`.
    pub fn backend(&self) -> Result<DlqBackend, ConfigError> {
        match self.backend {
            BackendKind::Memory => Ok(DlqBackend::Memory),
            BackendKind::File => self
                .path
                .clone()
                .map(|path| DlqBackend::File { path })
                .ok_or_else(|| {
                    ConfigError::invalid("dead_letter_queue.path", "required for the file backend")
                }),
            BackendKind::Postgres => self
                .url
                .clone()
                .map(|url| DlqBackend::Postgres { url })
                .ok_or_else(|| {
                    ConfigError::invalid("dead_letter_queue.url", "required for the postgres backend")
                }),
        }
    }

    /// Validate DLQ configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend()?;
        if self.alert_threshold == Some(0) {
            return Err(ConfigError::invalid(
                "dead_letter_queue.alert_threshold",
                "must be at least 1 when set",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use bulwark_core::ErrorKind;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ResilienceConfig::from_toml_str("").unwrap();
        assert_eq!(config, ResilienceConfig::default());
        assert_eq!(config.dead_letter_queue.backend().unwrap(), DlqBackend::Memory);
    }

    #[test]
    fn test_full_document_maps_to_pattern_configs() {
        let config = ResilienceConfig::from_toml_str(
            r#"
            [circuit_breaker]
            failure_threshold = 3
            open_timeout_secs = 10
            call_timeout_ms = 250
            failure_kinds = ["transient"]

            [retry]
            max_attempts = 4
            base_delay_ms = 50
            jitter_factor = 0.0

            [rate_limiter]
            rate = 100.0
            per_secs = 60
            burst = 20.0

            [dead_letter_queue]
            backend = "file"
            path = "/tmp/dlq.jsonl"
            alert_threshold = 10
            "#,
        )
        .unwrap();

        let breaker = config.circuit_breaker.to_config("payments").unwrap();
        assert_eq!(breaker.name, "payments");
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.success_threshold, 2);
        assert_eq!(breaker.open_timeout, Duration::from_secs(10));
        assert_eq!(breaker.call_timeout, Some(Duration::from_millis(250)));
        assert!(!breaker.failure_classifier.matches(ErrorKind::Timeout));

        let retry = config.retry.to_policy().unwrap();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.base_delay, Duration::from_millis(50));

        let limiter = config.rate_limiter.to_config().unwrap();
        assert!((limiter.capacity() - 120.0).abs() < f64::EPSILON);

        assert_eq!(
            config.dead_letter_queue.backend().unwrap(),
            DlqBackend::File {
                path: PathBuf::from("/tmp/dlq.jsonl")
            }
        );
    }

    #[test]
    fn test_invalid_values_name_the_field() {
        let err = ResilienceConfig::from_toml_str("[retry]\njitter_factor = 2.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "retry.jitter_factor", .. }));

        let err = ResilienceConfig::from_toml_str("[dead_letter_queue]\nbackend = \"postgres\"")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "dead_letter_queue.url", .. }));
    }

    #[test]
    fn test_adaptive_subsection_enables_threshold_adaptation() {
        let config = ResilienceConfig::from_toml_str(
            r#"
            [circuit_breaker]
            failure_threshold = 4

            [circuit_breaker.adaptive]
            max_threshold = 8
            adaptation_period_secs = 60
            "#,
        )
        .unwrap();

        let breaker = config.circuit_breaker.to_config("payments").unwrap();
        assert_eq!(
            breaker.adaptive,
            Some(AdaptiveThreshold {
                min_threshold: 3,
                max_threshold: 8,
                adaptation_period: Duration::from_secs(60),
                min_samples: 10,
            })
        );
        let fixed = CircuitBreakerSection::default().to_config("fixed").unwrap();
        assert_eq!(fixed.adaptive, None);

        let err = ResilienceConfig::from_toml_str(
            "[circuit_breaker]\nfailure_threshold = 2\n[circuit_breaker.adaptive]\nmin_threshold = 3",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "circuit_breaker.failure_threshold", .. }));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let err = ResilienceConfig::from_toml_str("[retry]\nmax_retries = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[circuit_breaker]\nfailure_threshold = 7").unwrap();

        let config = ResilienceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 7);

        let missing = ResilienceConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}

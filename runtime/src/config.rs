//! Runtime configuration.
//!
//! Both configs come with sensible defaults, `const fn with_*` builders and
//! a `from_env()` constructor reading `DUPLEX_RPC_*` variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `DUPLEX_RPC_REQUEST_TIMEOUT_MS` | [`SessionConfig::request_timeout`] |
//! | `DUPLEX_RPC_OUTBOUND_CAPACITY` | [`SessionConfig::outbound_capacity`] |
//! | `DUPLEX_RPC_MAX_PENDING_REQUESTS` | [`SessionConfig::max_pending_requests`] |
//! | `DUPLEX_RPC_MAX_BODY_BYTES` | [`SessionConfig::max_body_bytes`] |
//! | `DUPLEX_RPC_TASK_TTL_MS` | [`TaskEngineConfig::default_ttl`] (`0` = keep forever) |
//! | `DUPLEX_RPC_TASK_POLL_INTERVAL_MS` | [`TaskEngineConfig::poll_interval`] |
//! | `DUPLEX_RPC_TASK_PAGE_SIZE` | [`TaskEngineConfig::page_size`] |
//! | `DUPLEX_RPC_TASK_RESULT_WAIT_MS` | [`TaskEngineConfig::result_wait`] |
//!
//! # Example
//!
//! ```
//! use duplex_rpc_runtime::config::SessionConfig;
//! use std::time::Duration;
//!
//! let config = SessionConfig::default()
//!     .with_request_timeout(Duration::from_secs(5))
//!     .with_max_pending_requests(64);
//! assert!(config.validate().is_ok());
//! ```

use duplex_rpc_core::body::DEFAULT_MAX_BODY_BYTES;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable could not be parsed.
    #[error("Failed to parse {key}={value}: {reason}")]
    Parse {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// A value is out of range.
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Settings for one [`Session`](crate::session::Session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline for outbound requests without a per-call timeout.
    pub request_timeout: Duration,
    /// Capacity of the bounded queue feeding the writer task.
    pub outbound_capacity: usize,
    /// Maximum number of concurrently pending outbound requests.
    pub max_pending_requests: usize,
    /// Maximum message body size for byte-framed transports.
    pub max_body_bytes: usize,
}

impl SessionConfig {
    /// Set the default request timeout
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the outbound queue capacity
    #[must_use]
    pub const fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Set the pending request limit
    #[must_use]
    pub const fn with_max_pending_requests(mut self, limit: usize) -> Self {
        self.max_pending_requests = limit;
        self
    }

    /// Set the body size limit
    #[must_use]
    pub const fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Load from `DUPLEX_RPC_*` environment variables over the defaults.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is malformed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup over the defaults.
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or the result is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ms) = parse_var::<u64>(&lookup, "DUPLEX_RPC_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_var(&lookup, "DUPLEX_RPC_OUTBOUND_CAPACITY")? {
            config.outbound_capacity = capacity;
        }
        if let Some(limit) = parse_var(&lookup, "DUPLEX_RPC_MAX_PENDING_REQUESTS")? {
            config.max_pending_requests = limit;
        }
        if let Some(limit) = parse_var(&lookup, "DUPLEX_RPC_MAX_BODY_BYTES")? {
            config.max_body_bytes = limit;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if any limit is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Validation("request_timeout must be > 0".to_string()));
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Validation("outbound_capacity must be > 0".to_string()));
        }
        if self.max_pending_requests == 0 {
            return Err(ConfigError::Validation("max_pending_requests must be > 0".to_string()));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Validation("max_body_bytes must be > 0".to_string()));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            outbound_capacity: 256,
            max_pending_requests: 1024,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Settings for the [`TaskEngine`](crate::tasks::TaskEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEngineConfig {
    /// Retention after a terminal status when the request asks for none.
    /// `None` keeps tasks until deleted.
    pub default_ttl: Option<Duration>,
    /// Poll interval advertised to callers.
    pub poll_interval: Duration,
    /// Tasks per `tasks/list` page.
    pub page_size: usize,
    /// How long `tasks/result` waits for a terminal status.
    pub result_wait: Duration,
}

impl TaskEngineConfig {
    /// Set the default retention
    #[must_use]
    pub const fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the advertised poll interval
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the list page size
    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the `tasks/result` wait
    #[must_use]
    pub const fn with_result_wait(mut self, wait: Duration) -> Self {
        self.result_wait = wait;
        self
    }

    /// Load from `DUPLEX_RPC_TASK_*` environment variables over the defaults.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is malformed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup over the defaults.
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or the result is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ms) = parse_var::<u64>(&lookup, "DUPLEX_RPC_TASK_TTL_MS")? {
            config.default_ttl = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "DUPLEX_RPC_TASK_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(page_size) = parse_var(&lookup, "DUPLEX_RPC_TASK_PAGE_SIZE")? {
            config.page_size = page_size;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "DUPLEX_RPC_TASK_RESULT_WAIT_MS")? {
            config.result_wait = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if the page size or poll interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Validation("page_size must be > 0".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Validation("poll_interval must be > 0".to_string()));
        }
        Ok(())
    }
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(Duration::from_secs(60 * 60)),
            poll_interval: Duration::from_millis(500),
            page_size: 50,
            result_wait: Duration::from_secs(30),
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError::Parse {
                key: key.to_string(),
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(TaskEngineConfig::default().validate().is_ok());
        assert_eq!(SessionConfig::default().max_body_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn session_config_from_lookup() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("DUPLEX_RPC_REQUEST_TIMEOUT_MS", "1500"),
            ("DUPLEX_RPC_MAX_PENDING_REQUESTS", " 8 "),
        ]))
        .unwrap();
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_pending_requests, 8);
        assert_eq!(config.outbound_capacity, SessionConfig::default().outbound_capacity);
    }

    #[test]
    fn malformed_values_are_reported() {
        let err = SessionConfig::from_lookup(lookup(&[("DUPLEX_RPC_OUTBOUND_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Parse { ref key, .. } if key == "DUPLEX_RPC_OUTBOUND_CAPACITY"
        ));
    }

    #[test]
    fn zero_limits_fail_validation() {
        let err = SessionConfig::from_lookup(lookup(&[("DUPLEX_RPC_MAX_BODY_BYTES", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(TaskEngineConfig::default().with_page_size(0).validate().is_err());
    }

    #[test]
    fn zero_ttl_means_keep_forever() {
        let config = TaskEngineConfig::from_lookup(lookup(&[
            ("DUPLEX_RPC_TASK_TTL_MS", "0"),
            ("DUPLEX_RPC_TASK_PAGE_SIZE", "10"),
        ]))
        .unwrap();
        assert_eq!(config.default_ttl, None);
        assert_eq!(config.page_size, 10);
    }
}

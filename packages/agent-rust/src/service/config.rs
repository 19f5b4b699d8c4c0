//! Configuration for the operation service.
//!
//! Values are looked up by nested path (e.g. `agent.operations.interval`) from
//! a [`ConfigSource`]. Every key is required and must be a positive integer.

use std::collections::HashMap;
use std::time::Duration;

/// Configuration keys read by [`OperationServiceConfig::from_source`].
pub mod keys {
    /// Poll interval in seconds.
    pub const INTERVAL: &str = "agent.operations.interval";
    /// Page size for operation collection queries.
    pub const RESULT_SIZE: &str = "agent.operations.result_size";
    /// Bound on stopping the worker, in milliseconds.
    pub const SHUTDOWN_TIMEOUT: &str = "agent.operations.shutdown_timeout";
    /// Bound on stopping all handlers, in milliseconds.
    pub const HANDLERS_SHUTDOWN_TIMEOUT: &str = "agent.operations.handlers_shutdown_timeout";
}

/// Configuration lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration key {key}")]
    Missing { key: &'static str },
    #[error("configuration key {key} must be positive, got {value}")]
    NotPositive { key: &'static str, value: String },
    #[error("configuration key {key} is not an integer: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Path-keyed configuration lookup.
pub trait ConfigSource: Send + Sync {
    /// Returns the raw value at `path`, if present.
    fn get(&self, path: &str) -> Option<String>;
}

/// In-memory [`ConfigSource`].
#[derive(Debug, Clone, Default)]
pub struct MapConfigSource {
    values: HashMap<String, String>,
}

impl MapConfigSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion.
    #[must_use]
    pub fn with(mut self, path: impl Into<String>, value: impl ToString) -> Self {
        self.values.insert(path.into(), value.to_string());
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, value: impl ToString) {
        self.values.insert(path.into(), value.to_string());
    }
}

impl ConfigSource for MapConfigSource {
    fn get(&self, path: &str) -> Option<String> {
        self.values.get(path).cloned()
    }
}

/// Settings for the operation service and its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationServiceConfig {
    /// Wait between polls when no pending operation is available.
    pub poll_interval: Duration,
    /// Page size for operation collection queries during reconciliation.
    pub result_page_size: u32,
    /// Bound on waiting for the worker loop to exit.
    pub shutdown_timeout: Duration,
    /// Bound on stopping all handlers in parallel.
    pub handlers_shutdown_timeout: Duration,
}

impl Default for OperationServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            result_page_size: 100,
            shutdown_timeout: Duration::from_millis(10_000),
            handlers_shutdown_timeout: Duration::from_millis(10_000),
        }
    }
}

impl OperationServiceConfig {
    /// Reads and validates all keys from `source`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for the first key that is missing, not an
    /// integer, or not positive.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let interval = required_positive(source, keys::INTERVAL)?;
        let result_size = required_positive(source, keys::RESULT_SIZE)?;
        let shutdown = required_positive(source, keys::SHUTDOWN_TIMEOUT)?;
        let handlers_shutdown = required_positive(source, keys::HANDLERS_SHUTDOWN_TIMEOUT)?;

        let result_page_size = u32::try_from(result_size).map_err(|_| ConfigError::Invalid {
            key: keys::RESULT_SIZE,
            value: result_size.to_string(),
        })?;

        Ok(Self {
            poll_interval: Duration::from_secs(interval),
            result_page_size,
            shutdown_timeout: Duration::from_millis(shutdown),
            handlers_shutdown_timeout: Duration::from_millis(handlers_shutdown),
        })
    }

    /// Checks that every setting is positive.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotPositive`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (keys::INTERVAL, self.poll_interval.is_zero(), self.poll_interval.as_secs()),
            (keys::RESULT_SIZE, self.result_page_size == 0, u64::from(self.result_page_size)),
            (
                keys::SHUTDOWN_TIMEOUT,
                self.shutdown_timeout.is_zero(),
                duration_millis(self.shutdown_timeout),
            ),
            (
                keys::HANDLERS_SHUTDOWN_TIMEOUT,
                self.handlers_shutdown_timeout.is_zero(),
                duration_millis(self.handlers_shutdown_timeout),
            ),
        ];
        for (key, invalid, value) in checks {
            if invalid {
                return Err(ConfigError::NotPositive {
                    key,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn required_positive(source: &dyn ConfigSource, key: &'static str) -> Result<u64, ConfigError> {
    let raw = source.get(key).ok_or(ConfigError::Missing { key })?;
    let value: i64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.clone(),
    })?;
    if value <= 0 {
        return Err(ConfigError::NotPositive { key, value: raw });
    }
    u64::try_from(value).map_err(|_| ConfigError::Invalid { key, value: raw })
}

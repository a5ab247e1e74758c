//! # Syncback Configuration
//!
//! Configuration for the syncback action delivery service.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! `SyncbackConfig`. Every knob has a production default; `build()` enforces
//! fail-fast validation so an inconsistent combination (for example a lease
//! shorter than the remote call timeout) is rejected before any worker starts.
//!
//! ## Usage
//!
//! ```
//! use core_runtime::config::{RetryPolicy, SyncbackConfig};
//! use std::time::Duration;
//!
//! let config = SyncbackConfig::builder()
//!     .pool_size(4)
//!     .poll_interval(Duration::from_secs(1))
//!     .retry_policy(RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(60)))
//!     .build()
//!     .expect("valid configuration");
//!
//! assert_eq!(config.pool_size, 4);
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::SyncbackConfig;
//!
//! // A pool without workers can never drain the log
//! SyncbackConfig::builder()
//!     .pool_size(0)
//!     .build()
//!     .expect("Should fail - empty pool");
//! ```

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default number of concurrently active account workers.
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Default interval between scans of the action log.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default dispatch attempts before an action is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default hierarchy separator when the server reports none.
pub const DEFAULT_SEPARATOR: &str = ".";

/// Exponential backoff policy for transient failures.
///
/// The delay before attempt `n + 1` is `base_delay * 2^(n - 1)`, capped at
/// `max_delay`. An action is dispatched at most `max_attempts` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum dispatch attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay to wait after `attempt` failed attempts.
    ///
    /// `attempt` is 1-based: `backoff(1)` is the delay after the first failure.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts_made`.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config(
                "Retry policy must allow at least one attempt".to_string(),
            ));
        }

        if self.base_delay > self.max_delay {
            return Err(Error::Config(format!(
                "Retry base delay ({:?}) exceeds max delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }

        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// Configuration for the syncback service and its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncbackConfig {
    /// SQLite database holding the action log; `None` when the host injects a pool
    pub database_path: Option<PathBuf>,

    /// Maximum number of account workers running at once
    pub pool_size: usize,

    /// How often the dispatcher scans the log for new work
    pub poll_interval: Duration,

    /// Retry and backoff policy for transient failures
    pub retry: RetryPolicy,

    /// How long a claimed action stays leased before it is considered orphaned
    pub lease_duration: Duration,

    /// Upper bound for a single remote call; exceeding it is a transient failure
    pub remote_call_timeout: Duration,

    /// Dispatches a worker performs before yielding its pool slot
    pub max_actions_per_run: usize,

    /// Hierarchy separator used when neither NAMESPACE nor LIST report one
    pub default_separator: String,

    /// Name of this process, recorded as part of every lease owner
    pub instance_name: String,
}

impl Default for SyncbackConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            pool_size: DEFAULT_POOL_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryPolicy::default(),
            lease_duration: Duration::from_secs(120),
            remote_call_timeout: Duration::from_secs(60),
            max_actions_per_run: 50,
            default_separator: DEFAULT_SEPARATOR.to_string(),
            instance_name: "syncback".to_string(),
        }
    }
}

impl SyncbackConfig {
    /// Creates a new builder seeded with defaults.
    pub fn builder() -> SyncbackConfigBuilder {
        SyncbackConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Config(
                "Pool size must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(Error::Config(
                "Poll interval must be greater than 0".to_string(),
            ));
        }

        self.retry.validate()?;

        if self.remote_call_timeout.is_zero() {
            return Err(Error::Config(
                "Remote call timeout must be greater than 0".to_string(),
            ));
        }

        // An in-flight call must never outlive its lease, otherwise another
        // worker could reclaim and redispatch the same action concurrently.
        if self.lease_duration <= self.remote_call_timeout {
            return Err(Error::Config(format!(
                "Lease duration ({:?}) must exceed remote call timeout ({:?})",
                self.lease_duration, self.remote_call_timeout
            )));
        }

        if self.max_actions_per_run == 0 {
            return Err(Error::Config(
                "Max actions per run must be greater than 0".to_string(),
            ));
        }

        if self.default_separator.chars().count() > 1 {
            return Err(Error::Config(format!(
                "Default separator must be a single character, got {:?}",
                self.default_separator
            )));
        }

        if self.instance_name.trim().is_empty() {
            return Err(Error::Config(
                "Instance name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for constructing [`SyncbackConfig`] instances.
#[derive(Debug, Default)]
pub struct SyncbackConfigBuilder {
    database_path: Option<PathBuf>,
    pool_size: Option<usize>,
    poll_interval: Option<Duration>,
    retry: Option<RetryPolicy>,
    lease_duration: Option<Duration>,
    remote_call_timeout: Option<Duration>,
    max_actions_per_run: Option<usize>,
    default_separator: Option<String>,
    instance_name: Option<String>,
}

impl SyncbackConfigBuilder {
    /// Sets the SQLite database the service opens on its own.
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Shorthand for changing only the attempt limit of the retry policy.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        let mut policy = self.retry.unwrap_or_default();
        policy.max_attempts = attempts;
        self.retry = Some(policy);
        self
    }

    pub fn lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = Some(duration);
        self
    }

    pub fn remote_call_timeout(mut self, timeout: Duration) -> Self {
        self.remote_call_timeout = Some(timeout);
        self
    }

    pub fn max_actions_per_run(mut self, count: usize) -> Self {
        self.max_actions_per_run = Some(count);
        self
    }

    pub fn default_separator(mut self, separator: impl Into<String>) -> Self {
        self.default_separator = Some(separator.into());
        self
    }

    pub fn instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    /// Builds and validates the final `SyncbackConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any value is out of range.
    pub fn build(self) -> Result<SyncbackConfig> {
        let defaults = SyncbackConfig::default();

        let config = SyncbackConfig {
            database_path: self.database_path,
            pool_size: self.pool_size.unwrap_or(defaults.pool_size),
            poll_interval: self.poll_interval.unwrap_or(defaults.poll_interval),
            retry: self.retry.unwrap_or(defaults.retry),
            lease_duration: self.lease_duration.unwrap_or(defaults.lease_duration),
            remote_call_timeout: self
                .remote_call_timeout
                .unwrap_or(defaults.remote_call_timeout),
            max_actions_per_run: self
                .max_actions_per_run
                .unwrap_or(defaults.max_actions_per_run),
            default_separator: self
                .default_separator
                .unwrap_or(defaults.default_separator),
            instance_name: self.instance_name.unwrap_or(defaults.instance_name),
        };

        config.validate()?;

        Ok(config)
    }
}

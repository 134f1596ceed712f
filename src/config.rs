//! Task tunables and retry policies.
//!
//! Defaults match the control plane's historical settings:
//!
//! | setting                   | default |
//! |---------------------------|---------|
//! | `unresponsive_timeout`    | 15 min  |
//! | `retry_limit`             | 20      |
//! | `max_delay`               | 60 s    |
//! | `rpc_timeout`             | 30 s    |
//! | `tablet_creation_timeout` | 30 s    |
//!
//! ```rust
//! use remote_tasks::TaskConfig;
//! use std::time::Duration;
//!
//! let config = TaskConfig::builder()
//!     .retry_limit(5)
//!     .max_delay(Duration::from_secs(2))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.retry_limit(), 5);
//! assert_eq!(config.rpc_timeout(), Duration::from_secs(30));
//! ```

use crate::error::ConfigError;
use std::time::Duration;

pub const DEFAULT_UNRESPONSIVE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_RETRY_LIMIT: u32 = 20;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TABLET_CREATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How many attempts a task may make before failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RetryPolicy {
    /// The first failure is terminal.
    NoRetry,
    /// Up to [`TaskConfig::retry_limit`] retries.
    RetryLimited,
    /// Retry until the deadline passes.
    RetryUntilDeadline,
}

impl RetryPolicy {
    /// Largest attempt number that may still be retried.
    pub fn attempt_threshold(&self, config: &TaskConfig) -> u32 {
        match self {
            RetryPolicy::NoRetry => 0,
            RetryPolicy::RetryLimited => config.retry_limit,
            RetryPolicy::RetryUntilDeadline => u32::MAX,
        }
    }
}

/// Validated configuration shared by all tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TaskConfig {
    unresponsive_timeout: Duration,
    retry_limit: u32,
    max_delay: Duration,
    rpc_timeout: Duration,
    tablet_creation_timeout: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            unresponsive_timeout: DEFAULT_UNRESPONSIVE_TIMEOUT,
            retry_limit: DEFAULT_RETRY_LIMIT,
            max_delay: DEFAULT_MAX_DELAY,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            tablet_creation_timeout: DEFAULT_TABLET_CREATION_TIMEOUT,
        }
    }
}

impl TaskConfig {
    pub fn builder() -> TaskConfigBuilder {
        TaskConfigBuilder { config: TaskConfig::default() }
    }

    /// How long a task keeps retrying an unresponsive node.
    pub fn unresponsive_timeout(&self) -> Duration {
        self.unresponsive_timeout
    }

    /// Attempt threshold for [`RetryPolicy::RetryLimited`] tasks.
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Ceiling of the exponential base delay.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Upper bound on a single RPC attempt.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Deadline for replica creation and leader election.
    pub fn tablet_creation_timeout(&self) -> Duration {
        self.tablet_creation_timeout
    }

    /// Check the invariants enforced by the builder, for configs obtained elsewhere
    /// (deserialization, live updates).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("unresponsive_timeout", self.unresponsive_timeout),
            ("max_delay", self.max_delay),
            ("rpc_timeout", self.rpc_timeout),
            ("tablet_creation_timeout", self.tablet_creation_timeout),
        ];
        for (field, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::MustBePositive { field });
            }
        }
        if self.rpc_timeout > self.unresponsive_timeout {
            return Err(ConfigError::RpcTimeoutExceedsTaskTimeout {
                rpc_timeout: self.rpc_timeout,
                unresponsive_timeout: self.unresponsive_timeout,
            });
        }
        Ok(())
    }
}

/// Builder for [`TaskConfig`]; unset fields keep their defaults.
#[derive(Debug, Clone)]
pub struct TaskConfigBuilder {
    config: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn unresponsive_timeout(mut self, timeout: Duration) -> Self {
        self.config.unresponsive_timeout = timeout;
        self
    }

    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.config.retry_limit = limit;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = timeout;
        self
    }

    pub fn tablet_creation_timeout(mut self, timeout: Duration) -> Self {
        self.config.tablet_creation_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<TaskConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

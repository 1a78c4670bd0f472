//! Pool and dispatch tuning.

use std::time::Duration;

use courier_common::error::ConfigError;
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;

/// Connection pool sizing and throughput.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum simultaneous relay connections.
    ///
    /// Default: 5
    #[serde(default = "defaults::max_connections")]
    pub max_connections: usize,

    /// Messages sent over one connection before it is replaced.
    ///
    /// Default: 100
    #[serde(default = "defaults::max_messages")]
    pub max_messages: u32,

    /// Messages allowed per `rate_delta_ms`.
    ///
    /// Default: 5
    #[serde(default = "defaults::rate_limit")]
    pub rate_limit: u32,

    /// Rate window in milliseconds.
    ///
    /// Default: 1000
    #[serde(default = "defaults::rate_delta_ms")]
    pub rate_delta_ms: u64,

    /// Idle connections older than this are dropped instead of reused.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: defaults::max_connections(),
            max_messages: defaults::max_messages(),
            rate_limit: defaults::rate_limit(),
            rate_delta_ms: defaults::rate_delta_ms(),
            idle_timeout_secs: defaults::idle_timeout_secs(),
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub const fn rate_delta(&self) -> Duration {
        Duration::from_millis(self.rate_delta_ms)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// # Errors
    ///
    /// Returns an error if any size, rate, or interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::invalid("pool.max_connections", "must be at least 1"));
        }
        if self.max_messages == 0 {
            return Err(ConfigError::invalid("pool.max_messages", "must be at least 1"));
        }
        if self.rate_limit == 0 {
            return Err(ConfigError::invalid("pool.rate_limit", "must be at least 1"));
        }
        if self.rate_delta_ms == 0 {
            return Err(ConfigError::invalid("pool.rate_delta_ms", "must be at least 1"));
        }
        Ok(())
    }
}

/// Retry and timeout behaviour of the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Retries after the first attempt. A send makes at most
    /// `max_retries + 1` attempts.
    ///
    /// Default: 3
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Deadline for one attempt, lease acquisition included.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// First backoff delay; doubles on every retry.
    ///
    /// Default: 1000 ms
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for a single backoff delay. Unbounded when unset.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,

    /// Randomizes each delay within `±jitter_factor`. `0.0` disables jitter.
    #[serde(default)]
    pub jitter_factor: f64,

    /// Value of the `X-Mailer` header.
    ///
    /// Default: `Courier`
    #[serde(default = "defaults::mailer")]
    pub mailer: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            attempt_timeout_secs: defaults::attempt_timeout_secs(),
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: None,
            jitter_factor: 0.0,
            mailer: defaults::mailer(),
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    #[must_use]
    pub fn backoff(&self) -> BackoffPolicy {
        let policy = BackoffPolicy::new(Duration::from_millis(self.base_delay_ms))
            .with_jitter(self.jitter_factor);
        match self.max_delay_ms {
            Some(max) => policy.with_max_delay(Duration::from_millis(max)),
            None => policy,
        }
    }

    /// # Errors
    ///
    /// Returns an error if the attempt timeout is zero or the jitter factor
    /// is outside `0.0..=1.0`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attempt_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "dispatch.attempt_timeout_secs",
                "must be at least 1 second",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::invalid(
                "dispatch.jitter_factor",
                "must be between 0.0 and 1.0",
            ));
        }
        if let Some(max) = self.max_delay_ms
            && max < self.base_delay_ms
        {
            return Err(ConfigError::invalid(
                "dispatch.max_delay_ms",
                "must not be smaller than base_delay_ms",
            ));
        }
        Ok(())
    }
}

mod defaults {
    pub const fn max_connections() -> usize {
        5
    }

    pub const fn max_messages() -> u32 {
        100
    }

    pub const fn rate_limit() -> u32 {
        5
    }

    pub const fn rate_delta_ms() -> u64 {
        1000
    }

    pub const fn idle_timeout_secs() -> u64 {
        300
    }

    pub const fn max_retries() -> u32 {
        3
    }

    pub const fn attempt_timeout_secs() -> u64 {
        30
    }

    pub const fn base_delay_ms() -> u64 {
        1000
    }

    pub fn mailer() -> String {
        "Courier".to_string()
    }
}

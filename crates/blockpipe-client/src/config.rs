//! Configuration for the batching layer.
//!
//! All durations are `*_ms` integers so the struct maps one-to-one onto a
//! TOML table. Missing fields fall back to their defaults.
//!
//! ## Example
//!
//! ```toml
//! [caller]
//! max_batch_size = 100
//! request_timeout_ms = 45000
//!
//! [caller.governor]
//! initial_limit = 8
//! max_limit = 8
//!
//! [caller.breaker]
//! failure_threshold = 10
//! cooldown_ms = 60000
//! ```

use crate::cache::CacheConfig;
use crate::circuit_breaker::BreakerConfig;
use crate::error::{ClientError, Result};
use crate::governor::GovernorConfig;
use blockpipe_core::retry::MAX_DELAY_MS;
use blockpipe_core::{PerformanceRecorder, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_batch_size() -> usize {
    100
}

fn default_sub_batch_pause_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    45_000
}

fn default_adapt_every() -> u64 {
    16
}

fn default_recorder_capacity() -> usize {
    1_024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub governor: GovernorConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Largest sub-batch executed at once (default: 100)
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Pause between consecutive sub-batches (default: 100ms)
    #[serde(default = "default_sub_batch_pause_ms")]
    pub sub_batch_pause_ms: u64,

    /// Per-attempt timeout (default: 45s)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Re-evaluate the concurrency limit every N recorded outcomes (default: 16).
    /// Rate-limited outcomes always trigger an evaluation.
    #[serde(default = "default_adapt_every")]
    pub adapt_every: u64,

    /// Samples kept by the performance recorder (default: 1,024)
    #[serde(default = "default_recorder_capacity")]
    pub recorder_capacity: usize,

    /// Halve the concurrency limit whenever the breaker opens (default: false)
    #[serde(default)]
    pub shrink_governor_on_trip: bool,
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            governor: GovernorConfig::default(),
            retry: RetryPolicy::default(),
            max_batch_size: default_max_batch_size(),
            sub_batch_pause_ms: default_sub_batch_pause_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            adapt_every: default_adapt_every(),
            recorder_capacity: default_recorder_capacity(),
            shrink_governor_on_trip: false,
        }
    }
}

impl CallerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sub_batch_pause(&self) -> Duration {
        Duration::from_millis(self.sub_batch_pause_ms)
    }

    /// Recorder sized by `recorder_capacity`.
    pub fn recorder(&self) -> PerformanceRecorder {
        PerformanceRecorder::new(self.recorder_capacity)
    }

    pub fn validate(&self) -> Result<()> {
        let g = &self.governor;
        if g.min_limit == 0 {
            return Err(ClientError::InvalidConfig(
                "governor.min_limit must be at least 1".to_string(),
            ));
        }
        if g.min_limit > g.max_limit {
            return Err(ClientError::InvalidConfig(format!(
                "governor.min_limit ({}) exceeds governor.max_limit ({})",
                g.min_limit, g.max_limit
            )));
        }
        if g.initial_limit < g.min_limit || g.initial_limit > g.max_limit {
            return Err(ClientError::InvalidConfig(format!(
                "governor.initial_limit ({}) outside [{}, {}]",
                g.initial_limit, g.min_limit, g.max_limit
            )));
        }
        if self.cache.capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "cache.capacity must be at least 1".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ClientError::InvalidConfig(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(ClientError::InvalidConfig(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.recorder_capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "recorder_capacity must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ClientError::InvalidConfig(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.request_timeout_ms > MAX_DELAY_MS || self.sub_batch_pause_ms > MAX_DELAY_MS {
            return Err(ClientError::InvalidConfig(format!(
                "request_timeout_ms and sub_batch_pause_ms must be at most {}",
                MAX_DELAY_MS
            )));
        }
        self.retry.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(CallerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: CallerConfig =
            serde_json::from_str(r#"{"max_batch_size": 25, "governor": {"max_limit": 16}}"#).unwrap();
        assert_eq!(config.max_batch_size, 25);
        assert_eq!(config.governor.max_limit, 16);
        assert_eq!(config.governor.initial_limit, 8);
        assert_eq!(config.request_timeout(), Duration::from_secs(45));
        assert!(!config.shrink_governor_on_trip);
    }

    #[test]
    fn test_validate_rejects_bad_governor_bounds() {
        let mut config = CallerConfig::default();
        config.governor.min_limit = 0;
        assert!(config.validate().is_err());

        let mut config = CallerConfig::default();
        config.governor.min_limit = 10;
        config.governor.max_limit = 5;
        assert!(config.validate().is_err());

        let mut config = CallerConfig::default();
        config.governor.initial_limit = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unbounded_delays() {
        let mut config = CallerConfig::default();
        config.request_timeout_ms = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = CallerConfig::default();
        config.retry.rate_limit_cooldown_ms = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_recorder_uses_configured_capacity() {
        let config: CallerConfig = serde_json::from_str(r#"{"recorder_capacity": 64}"#).unwrap();
        assert_eq!(config.recorder().capacity(), 64);
        assert_eq!(
            CallerConfig::default().recorder().capacity(),
            default_recorder_capacity()
        );
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = CallerConfig::default();
        config.recorder_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = CallerConfig::default();
        config.max_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = CallerConfig::default();
        config.cache.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = CallerConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ClientError::Policy(_))));
    }
}

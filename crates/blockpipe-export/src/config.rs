//! Export pipeline configuration.
//!
//! ## Flush triggers
//!
//! A buffered flush happens on whichever comes first:
//! - `max_buffered_records` distinct primary keys buffered
//! - `max_buffered_bytes` estimated payload bytes buffered
//! - the oldest buffered record is older than `max_buffer_age_ms` (0 disables)
//! - an explicit flush request
//!
//! ## Usage
//!
//! ```ignore
//! let config = ExportConfig {
//!     max_buffered_records: 5_000,
//!     writer_parallelism: 8,
//!     failure_log_path: Some("/var/lib/blockpipe/failed.jsonl".into()),
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use crate::error::{ExportError, Result};
use blockpipe_core::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_max_buffered_records() -> usize {
    10_000
}

fn default_max_buffered_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_max_buffer_age_ms() -> u64 {
    5_000
}

fn default_writer_parallelism() -> usize {
    4
}

fn default_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 200,
        max_backoff_ms: 5_000,
        backoff_multiplier: 2.0,
        jitter: 0.25,
        rate_limit_cooldown_ms: 0,
    }
}

fn default_max_requeues() -> u32 {
    3
}

fn default_channel_capacity() -> usize {
    10_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Distinct records buffered before a flush (default: 10,000)
    #[serde(default = "default_max_buffered_records")]
    pub max_buffered_records: usize,

    /// Estimated bytes buffered before a flush (default: 64 MiB)
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,

    /// Age of the oldest buffered record that forces a flush (default: 5s, 0 = never)
    #[serde(default = "default_max_buffer_age_ms")]
    pub max_buffer_age_ms: u64,

    /// Partitions written concurrently (default: 4)
    #[serde(default = "default_writer_parallelism")]
    pub writer_parallelism: usize,

    /// Retry policy for `StorageTransient` partition failures inside one flush
    #[serde(default = "default_retry")]
    pub retry: RetryPolicy,

    /// Times a transiently failing partition is put back into the buffer
    /// before it goes to the failure log (default: 3)
    #[serde(default = "default_max_requeues")]
    pub max_requeues: u32,

    /// Hand-off channel capacity between producers and the flusher (default: 10,000)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// JSON-lines file receiving partitions that could not be written
    #[serde(default)]
    pub failure_log_path: Option<PathBuf>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_buffered_records: default_max_buffered_records(),
            max_buffered_bytes: default_max_buffered_bytes(),
            max_buffer_age_ms: default_max_buffer_age_ms(),
            writer_parallelism: default_writer_parallelism(),
            retry: default_retry(),
            max_requeues: default_max_requeues(),
            channel_capacity: default_channel_capacity(),
            failure_log_path: None,
        }
    }
}

impl ExportConfig {
    pub fn max_buffer_age(&self) -> Option<Duration> {
        (self.max_buffer_age_ms > 0).then(|| Duration::from_millis(self.max_buffer_age_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_buffered_records == 0 {
            return Err(ExportError::InvalidConfig(
                "max_buffered_records must be at least 1".to_string(),
            ));
        }
        if self.max_buffered_bytes == 0 {
            return Err(ExportError::InvalidConfig(
                "max_buffered_bytes must be at least 1".to_string(),
            ));
        }
        if self.writer_parallelism == 0 {
            return Err(ExportError::InvalidConfig(
                "writer_parallelism must be at least 1".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ExportError::InvalidConfig(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        self.retry.validate()?;
        Ok(())
    }
}

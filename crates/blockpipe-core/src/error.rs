//! Error Taxonomy for blockpipe
//!
//! Every failure that crosses a component boundary is classified into one of
//! the [`ErrorKind`] variants. The kind alone decides whether the failure is
//! retried locally or surfaced to the caller.
//!
//! ## Error Categories
//!
//! ### Upstream Errors (RPC calls)
//! - `RateLimited`: upstream throttling signal (HTTP 429, JSON-RPC -32005)
//! - `Timeout`: no response within the request timeout or caller deadline
//! - `TransientUpstream`: connection reset, 5xx, undecodable response
//! - `PermanentRequest`: malformed or rejected call, never retried
//!
//! ### Local Decisions
//! - `BreakerOpen`: the circuit breaker rejected the call without contacting upstream
//!
//! ### Storage Errors (partition writes)
//! - `StorageTransient`: connection loss, serialization failure, deadlock
//! - `StorageConflictUnresolvable`: constraint violation, schema mismatch, unknown table
//!
//! ## Propagation
//!
//! | Kind                          | Retried | Consumes an attempt |
//! |-------------------------------|---------|---------------------|
//! | `RateLimited`                 | yes     | yes                 |
//! | `Timeout`                     | yes     | yes                 |
//! | `TransientUpstream`           | yes     | yes                 |
//! | `StorageTransient`            | yes     | yes                 |
//! | `PermanentRequest`            | no      | yes                 |
//! | `StorageConflictUnresolvable` | no      | yes                 |
//! | `BreakerOpen`                 | no      | no                  |
//!
//! ## Example
//! ```ignore
//! use blockpipe_core::{CallError, ErrorKind};
//!
//! let err = CallError::rate_limited("HTTP 429 Too Many Requests");
//! assert!(err.kind.is_retryable());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a failed call or partition write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Timeout,
    TransientUpstream,
    PermanentRequest,
    BreakerOpen,
    StorageConflictUnresolvable,
    StorageTransient,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::RateLimited,
        ErrorKind::Timeout,
        ErrorKind::TransientUpstream,
        ErrorKind::PermanentRequest,
        ErrorKind::BreakerOpen,
        ErrorKind::StorageConflictUnresolvable,
        ErrorKind::StorageTransient,
    ];

    /// Whether a failure of this kind is retried locally before being surfaced.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::Timeout
                | ErrorKind::TransientUpstream
                | ErrorKind::StorageTransient
        )
    }

    /// Whether the failure says something about upstream health.
    ///
    /// A rejected request still proves upstream answered, and a breaker
    /// rejection never reached upstream at all.
    pub fn is_upstream_fault(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::Timeout | ErrorKind::TransientUpstream
        )
    }

    /// Stable label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransientUpstream => "transient_upstream",
            ErrorKind::PermanentRequest => "permanent_request",
            ErrorKind::BreakerOpen => "breaker_open",
            ErrorKind::StorageConflictUnresolvable => "storage_conflict_unresolvable",
            ErrorKind::StorageTransient => "storage_transient",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that carries an [`ErrorKind`].
///
/// Lets [`retry_with_backoff`](crate::retry::retry_with_backoff) decide on
/// retries without knowing the concrete error type.
pub trait Classified {
    fn kind(&self) -> ErrorKind;
}

/// A classified failure of a single upstream call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct CallError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientUpstream, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermanentRequest, message)
    }

    pub fn breaker_open() -> Self {
        Self::new(ErrorKind::BreakerOpen, "circuit breaker is open")
    }
}

impl Classified for CallError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// A classified failure of one partition write.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StoreError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::StorageTransient,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::StorageConflictUnresolvable,
            message: message.into(),
        }
    }
}

impl Classified for StoreError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Errors raised by the core data model itself.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid retry policy: {0}")]
    InvalidPolicy(String),
}

pub type Result<T> = std::result::Result<T, Error>;

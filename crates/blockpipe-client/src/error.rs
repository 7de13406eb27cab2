//! Client construction errors.
//!
//! Per-call failures are not errors of this type: they resolve to a
//! [`CallResult`](blockpipe_core::CallResult) carrying a classified
//! [`CallError`](blockpipe_core::CallError), so sibling calls in a batch are
//! never affected by one another.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration rejected by `validate()`.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// HTTP client could not be built (TLS backend, invalid URL).
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid retry policy: {0}")]
    Policy(#[from] blockpipe_core::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

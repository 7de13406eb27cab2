//! Export pipeline errors.
//!
//! Partition write failures are *not* represented here: they are classified
//! [`StoreError`](blockpipe_core::StoreError)s carried inside a
//! [`FlushReport`](crate::writer::FlushReport) together with the unwritten
//! records. `ExportError` covers everything that stops the pipeline itself.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The flusher task has stopped; no more records are accepted.
    #[error("Export pipeline is closed")]
    PipelineClosed,

    #[error("Failure log I/O error: {0}")]
    FailureLog(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Flusher task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Invalid retry policy: {0}")]
    Policy(#[from] blockpipe_core::Error),
}

pub type Result<T> = std::result::Result<T, ExportError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_display_contains(err: ExportError, expected: &str) {
        let msg = err.to_string();
        assert!(msg.contains(expected), "expected '{}' in '{}'", expected, msg);
    }

    #[test]
    fn test_display_messages() {
        assert_display_contains(ExportError::PipelineClosed, "closed");
        assert_display_contains(
            ExportError::InvalidConfig("writer_parallelism must be at least 1".into()),
            "writer_parallelism",
        );
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ExportError = io.into();
        assert!(matches!(err, ExportError::FailureLog(_)));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: ExportError = json_err.into();
        assert!(matches!(err, ExportError::Serialization(_)));
    }
}

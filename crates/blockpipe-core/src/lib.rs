//! blockpipe core
//!
//! Shared building blocks for the call-batching layer and the export
//! pipeline:
//!
//! - [`call`]: call requests, fingerprints and results
//! - [`record`]: typed export records keyed by primary-key tuples
//! - [`error`]: the error taxonomy every component classifies into
//! - [`retry`]: retry policy and the retry state machine
//! - [`recorder`]: lock-free rolling performance statistics

pub mod call;
pub mod error;
pub mod record;
pub mod recorder;
pub mod retry;

pub use call::{CallRequest, CallResult, Fingerprint};
pub use error::{CallError, Classified, Error, ErrorKind, Result, StoreError};
pub use record::{ExportRecord, KeyPart, PrimaryKey, RecordKind};
pub use recorder::{FlushStats, LifetimeStats, PerformanceRecorder, RecorderSnapshot, WindowStats};
pub use retry::{retry_with_backoff, RetryDecision, RetryPolicy, RetryState};

//! blockpipe export
//!
//! Durable, idempotent export of typed records into a relational store.
//!
//! ## Architecture
//!
//! - [`buffer`]: per-kind buffer coalescing records by primary key, with
//!   count, memory, age and explicit flush triggers
//! - [`writer`]: writes a flush batch as parallel per-kind upserts, retrying
//!   transient failures and returning the records of failed partitions
//! - [`store`]: the [`RecordStore`] contract and an in-memory store
//! - [`postgres`]: SQL generation for Postgres, and the `sqlx` store behind
//!   the `postgres` feature
//! - [`failure_log`]: JSON-lines log of partitions that could not be written
//! - [`pipeline`]: the single-owner flusher task and its producer handles
//!
//! ## Example
//!
//! ```ignore
//! let pipeline = ExportPipeline::spawn(config, store, recorder).await?;
//! let handle = pipeline.handle();
//! handle.submit_many(records).await?;
//! let outcome = handle.flush().await?;
//! let report = pipeline.shutdown().await?;
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod failure_log;
pub mod pipeline;
pub mod postgres;
pub mod store;
pub mod writer;

pub use buffer::{ExportBuffer, FlushBatch, FlushReason};
pub use config::ExportConfig;
pub use error::{ExportError, Result};
pub use failure_log::{FailureEntry, FailureLog};
pub use pipeline::{ExportPipeline, FlushOutcome, PipelineHandle, PipelineReport, PipelineStats};
pub use postgres::TableSpec;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use store::{MemoryStore, RecordStore};
pub use writer::{BatchWriter, CommittedPartition, FailedPartition, FlushReport};

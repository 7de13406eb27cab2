//! Export pipeline.
//!
//! A single flusher task owns the [`ExportBuffer`]. Producers hand records
//! to it through a bounded channel via cloneable [`PipelineHandle`]s, so only
//! one flush runs at a time and no snapshot ever interleaves with another.
//!
//! ```text
//! producer ─┐
//! producer ─┼─ mpsc ─→ flusher task ─→ ExportBuffer ─→ BatchWriter ─→ RecordStore
//! producer ─┘                │                              │
//!                            │         failed partitions ◄──┘
//!                            ├─ StorageTransient: requeue (up to max_requeues)
//!                            └─ otherwise: failure log / dead letters
//! ```
//!
//! Records either commit, wait in the buffer for another attempt, or are
//! dead-lettered. Shutdown flushes everything still buffered before the
//! task exits.

use crate::buffer::{ExportBuffer, FlushBatch, FlushReason};
use crate::config::ExportConfig;
use crate::error::{ExportError, Result};
use crate::failure_log::{FailureEntry, FailureLog};
use crate::store::RecordStore;
use crate::writer::{BatchWriter, FailedPartition};
use blockpipe_core::{ErrorKind, ExportRecord, FlushStats, PerformanceRecorder};
use blockpipe_observability::metrics::{EXPORT_BUFFERED_BYTES, EXPORT_BUFFERED_RECORDS};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tracing::{debug, error, info, warn};

enum Command {
    Submit(Vec<ExportRecord>),
    Flush(oneshot::Sender<FlushOutcome>),
    Stats(oneshot::Sender<PipelineStats>),
    Shutdown,
}

/// Result of one explicit flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushOutcome {
    /// `None` when there was nothing to flush.
    pub batch_id: Option<u64>,
    pub committed_rows: u64,
    pub failed_partitions: usize,
    /// Records put back into the buffer after a transient failure.
    pub requeued_records: usize,
    pub dead_lettered_records: usize,
}

impl FlushOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed_partitions == 0
    }
}

/// Running totals of the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub buffered_records: usize,
    pub buffered_bytes: usize,
    pub submitted_records: u64,
    pub flushes: u64,
    pub partial_flushes: u64,
    pub committed_rows: u64,
    pub requeued_records: u64,
    pub dead_lettered_records: u64,
    pub failure_log_errors: u64,
}

/// Final state returned by [`ExportPipeline::shutdown`].
#[derive(Debug)]
pub struct PipelineReport {
    pub stats: PipelineStats,
    pub flush_stats: FlushStats,
    /// Dead-lettered partitions not persisted to a failure log, either
    /// because none is configured or because appending failed.
    pub dead_letters: Vec<FailureEntry>,
}

impl PipelineReport {
    pub fn is_clean(&self) -> bool {
        self.stats.dead_lettered_records == 0
    }
}

/// Cloneable producer-side handle.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<Command>,
}

impl PipelineHandle {
    /// Hand one record to the pipeline. Waits only if the channel is full.
    pub async fn submit(&self, record: ExportRecord) -> Result<()> {
        self.send(Command::Submit(vec![record])).await
    }

    pub async fn submit_many(&self, records: Vec<ExportRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.send(Command::Submit(records)).await
    }

    /// Flush everything buffered up to this point and wait for the outcome.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Flush(reply)).await?;
        rx.await.map_err(|_| ExportError::PipelineClosed)
    }

    pub async fn stats(&self) -> Result<PipelineStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply)).await?;
        rx.await.map_err(|_| ExportError::PipelineClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ExportError::PipelineClosed)
    }
}

/// Owner of the flusher task.
pub struct ExportPipeline {
    handle: PipelineHandle,
    task: JoinHandle<PipelineReport>,
}

impl ExportPipeline {
    pub async fn spawn(
        config: ExportConfig,
        store: Arc<dyn RecordStore>,
        recorder: Arc<PerformanceRecorder>,
    ) -> Result<Self> {
        config.validate()?;

        let failure_log = match &config.failure_log_path {
            Some(path) => Some(FailureLog::open(path).await?),
            None => None,
        };

        info!(
            store = store.name(),
            max_buffered_records = config.max_buffered_records,
            max_buffered_bytes = config.max_buffered_bytes,
            writer_parallelism = config.writer_parallelism,
            failure_log = ?config.failure_log_path,
            "Starting export pipeline"
        );

        let writer = BatchWriter::new(
            store,
            config.writer_parallelism,
            config.retry.clone(),
            recorder,
        );
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let flusher = Flusher {
            buffer: ExportBuffer::new(&config),
            max_requeues: config.max_requeues,
            writer,
            failure_log,
            dead_letters: Vec::new(),
            stats: PipelineStats::default(),
        };
        let task = tokio::spawn(flusher.run(rx));

        Ok(Self {
            handle: PipelineHandle { tx },
            task,
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Stop accepting records, flush whatever is buffered and wait for the
    /// flusher task to finish.
    pub async fn shutdown(self) -> Result<PipelineReport> {
        // the task may already be gone if every handle was dropped
        let _ = self.handle.tx.send(Command::Shutdown).await;
        Ok(self.task.await?)
    }
}

struct Flusher {
    buffer: ExportBuffer,
    max_requeues: u32,
    writer: BatchWriter,
    failure_log: Option<FailureLog>,
    dead_letters: Vec<FailureEntry>,
    stats: PipelineStats,
}

impl Flusher {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) -> PipelineReport {
        loop {
            let command = match self.buffer.age_deadline() {
                Some(deadline) => tokio::select! {
                    command = rx.recv() => command,
                    _ = sleep_until(deadline) => {
                        if let Some(batch) = self.buffer.flush_if_due() {
                            self.flush(batch).await;
                        }
                        continue;
                    }
                },
                None => rx.recv().await,
            };

            match command {
                Some(Command::Submit(records)) => {
                    self.accept(records);
                    if let Some(batch) = self.buffer.flush_if_due() {
                        self.flush(batch).await;
                    }
                }
                Some(Command::Flush(reply)) => {
                    let outcome = match self.buffer.take_all(FlushReason::Requested) {
                        Some(batch) => self.flush(batch).await,
                        None => FlushOutcome::default(),
                    };
                    let _ = reply.send(outcome);
                }
                Some(Command::Stats(reply)) => {
                    let _ = reply.send(self.snapshot());
                }
                Some(Command::Shutdown) | None => break,
            }
        }

        // Commands already queued behind the shutdown are still served:
        // records are flushed, and flush/stats requests are answered once
        // the final drain is done.
        rx.close();
        let mut flush_waiters = Vec::new();
        let mut stats_waiters = Vec::new();
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::Submit(records) => self.accept(records),
                Command::Flush(reply) => flush_waiters.push(reply),
                Command::Stats(reply) => stats_waiters.push(reply),
                Command::Shutdown => {}
            }
        }

        let outcome = self.drain().await;
        for reply in flush_waiters {
            let _ = reply.send(outcome.clone());
        }
        if !stats_waiters.is_empty() {
            let stats = self.snapshot();
            for reply in stats_waiters {
                let _ = reply.send(stats.clone());
            }
        }
        self.finish()
    }

    fn accept(&mut self, records: Vec<ExportRecord>) {
        self.stats.submitted_records += records.len() as u64;
        for record in records {
            self.buffer.add(record);
        }
        self.update_gauges();
    }

    /// Flush until the buffer stays empty. Returns the combined outcome.
    async fn drain(&mut self) -> FlushOutcome {
        let mut total = FlushOutcome::default();
        while let Some(batch) = self.buffer.take_all(FlushReason::Shutdown) {
            let outcome = self.flush(batch).await;
            total.batch_id = outcome.batch_id.or(total.batch_id);
            total.committed_rows += outcome.committed_rows;
            total.failed_partitions += outcome.failed_partitions;
            total.requeued_records += outcome.requeued_records;
            total.dead_lettered_records += outcome.dead_lettered_records;
        }
        total
    }

    async fn flush(&mut self, batch: FlushBatch) -> FlushOutcome {
        self.update_gauges();
        let report = self.writer.write(batch).await;

        let mut outcome = FlushOutcome {
            batch_id: Some(report.batch_id),
            committed_rows: report.committed_rows(),
            failed_partitions: report.failed.len(),
            ..Default::default()
        };
        self.stats.flushes += 1;
        self.stats.committed_rows += outcome.committed_rows;
        if !report.is_complete() {
            self.stats.partial_flushes += 1;
        }

        let batch_id = report.batch_id;
        let (failed, requeues) = report.split_failed();
        for partition in failed {
            if partition.error.kind != ErrorKind::StorageTransient {
                outcome.dead_lettered_records += self.dead_letter(batch_id, partition).await;
                continue;
            }

            let mut exhausted = Vec::new();
            let mut requeued = 0;
            for record in partition.records {
                let count = requeues
                    .get(&partition.kind)
                    .and_then(|keys| keys.get(record.key()))
                    .copied()
                    .unwrap_or(0);
                if count < self.max_requeues {
                    // a newer record for the same key may already be buffered
                    requeued += self.buffer.requeue(vec![record], count + 1);
                } else {
                    exhausted.push(record);
                }
            }
            if requeued > 0 {
                debug!(
                    batch_id,
                    kind = %partition.kind,
                    requeued,
                    "Requeued records after transient failure"
                );
            }
            outcome.requeued_records += requeued;
            if !exhausted.is_empty() {
                let partition = FailedPartition {
                    records: exhausted,
                    ..partition
                };
                outcome.dead_lettered_records += self.dead_letter(batch_id, partition).await;
            }
        }

        self.stats.requeued_records += outcome.requeued_records as u64;
        self.update_gauges();
        outcome
    }

    async fn dead_letter(&mut self, batch_id: u64, partition: FailedPartition) -> usize {
        let rows = partition.records.len();
        let entry = FailureEntry::new(batch_id, partition);
        self.stats.dead_lettered_records += rows as u64;

        match self.failure_log.as_mut() {
            Some(log) => match log.append(&entry).await {
                Ok(()) => {
                    warn!(
                        batch_id,
                        kind = %entry.kind,
                        rows,
                        error_type = %entry.error.kind,
                        path = %log.path().display(),
                        "Partition written to failure log"
                    );
                }
                Err(e) => {
                    error!(
                        batch_id,
                        kind = %entry.kind,
                        rows,
                        error = %e,
                        "Failed to append to failure log, keeping partition in memory"
                    );
                    self.stats.failure_log_errors += 1;
                    self.dead_letters.push(entry);
                }
            },
            None => {
                warn!(
                    batch_id,
                    kind = %entry.kind,
                    rows,
                    error_type = %entry.error.kind,
                    "Partition dead-lettered"
                );
                self.dead_letters.push(entry);
            }
        }
        rows
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            buffered_records: self.buffer.len(),
            buffered_bytes: self.buffer.estimated_bytes(),
            ..self.stats.clone()
        }
    }

    fn update_gauges(&self) {
        EXPORT_BUFFERED_RECORDS.set(self.buffer.len() as i64);
        EXPORT_BUFFERED_BYTES.set(self.buffer.estimated_bytes() as i64);
    }

    fn finish(self) -> PipelineReport {
        let flush_stats = self.writer.recorder().flush_stats();
        let stats = self.snapshot();
        info!(
            flushes = flush_stats.flushes,
            committed_rows = flush_stats.committed_rows,
            committed_partitions = flush_stats.committed_partitions,
            failed_partitions = flush_stats.failed_partitions,
            mean_flush_ms = flush_stats.mean_flush_time().as_millis() as u64,
            requeued_records = stats.requeued_records,
            dead_lettered_records = stats.dead_lettered_records,
            "Export pipeline stopped"
        );
        PipelineReport {
            stats,
            flush_stats,
            dead_letters: self.dead_letters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use blockpipe_core::{KeyPart, PrimaryKey, RecordKind, RetryPolicy, StoreError};
    use serde_json::{json, Map, Value};
    use std::time::Duration;

    fn record(kind: &str, key: u64, value: Value) -> ExportRecord {
        let mut payload = Map::new();
        payload.insert("value".to_string(), value);
        ExportRecord::new(kind, PrimaryKey::single(KeyPart::UInt(key)), payload).unwrap()
    }

    fn config() -> ExportConfig {
        ExportConfig {
            max_buffered_records: 1_000,
            max_buffer_age_ms: 0,
            retry: RetryPolicy::no_retry(),
            max_requeues: 2,
            ..Default::default()
        }
    }

    async fn spawn(config: ExportConfig, store: Arc<MemoryStore>) -> ExportPipeline {
        ExportPipeline::spawn(config, store, Arc::new(PerformanceRecorder::new(64)))
            .await
            .unwrap()
    }

    // ---------------------------------------------------------------
    // Flush triggers
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_explicit_flush_commits_everything() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = spawn(config(), store.clone()).await;
        let handle = pipeline.handle();

        handle
            .submit_many((0..10).map(|n| record("blocks", n, json!(n))).collect())
            .await
            .unwrap();
        let outcome = handle.flush().await.unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.committed_rows, 10);
        assert_eq!(store.row_count(&RecordKind::from("blocks")), 10);

        let empty = handle.flush().await.unwrap();
        assert_eq!(empty, FlushOutcome::default());
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_record_limit_flushes_without_request() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = spawn(
            ExportConfig {
                max_buffered_records: 5,
                ..config()
            },
            store.clone(),
        )
        .await;
        let handle = pipeline.handle();

        for n in 0..5 {
            handle.submit(record("blocks", n, json!(n))).await.unwrap();
        }
        let stats = handle.stats().await.unwrap();

        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.buffered_records, 0);
        assert_eq!(store.row_count(&RecordKind::from("blocks")), 5);
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_flush() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = spawn(
            ExportConfig {
                max_buffer_age_ms: 500,
                ..config()
            },
            store.clone(),
        )
        .await;
        let handle = pipeline.handle();

        handle.submit(record("blocks", 1, json!(1))).await.unwrap();
        assert_eq!(handle.stats().await.unwrap().flushes, 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.flushes, 1);
        assert_eq!(store.row_count(&RecordKind::from("blocks")), 1);
        pipeline.shutdown().await.unwrap();
    }

    // ---------------------------------------------------------------
    // Failure disposition
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_transient_failure_is_requeued_then_committed() {
        let store = Arc::new(MemoryStore::new());
        store.inject_failure("logs", StoreError::transient("connection reset"), 1);
        let pipeline = spawn(config(), store.clone()).await;
        let handle = pipeline.handle();

        handle
            .submit_many(vec![record("blocks", 1, json!("b")), record("logs", 1, json!("l"))])
            .await
            .unwrap();

        let first = handle.flush().await.unwrap();
        assert!(!first.is_complete());
        assert_eq!(first.committed_rows, 1);
        assert_eq!(first.requeued_records, 1);
        assert_eq!(first.dead_lettered_records, 0);

        let second = handle.flush().await.unwrap();
        assert!(second.is_complete());
        assert_eq!(second.committed_rows, 1);
        assert_eq!(store.upsert_calls(&RecordKind::from("blocks")), 1);
        assert_eq!(store.row_count(&RecordKind::from("logs")), 1);

        let report = pipeline.shutdown().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.stats.partial_flushes, 1);
    }

    #[tokio::test]
    async fn test_conflict_goes_to_failure_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.jsonl");
        let store = Arc::new(MemoryStore::new());
        store.inject_failure("logs", StoreError::conflict("value too long"), 1);

        let pipeline = spawn(
            ExportConfig {
                failure_log_path: Some(path.clone()),
                ..config()
            },
            store.clone(),
        )
        .await;
        let handle = pipeline.handle();
        handle
            .submit_many(vec![record("logs", 1, json!("x")), record("logs", 2, json!("y"))])
            .await
            .unwrap();

        let outcome = handle.flush().await.unwrap();
        assert_eq!(outcome.dead_lettered_records, 2);
        assert_eq!(outcome.requeued_records, 0);

        let report = pipeline.shutdown().await.unwrap();
        assert!(report.dead_letters.is_empty());
        assert_eq!(report.stats.dead_lettered_records, 2);

        let entries = FailureLog::read_all(&path).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, RecordKind::from("logs"));
        assert_eq!(entries[0].error.kind, ErrorKind::StorageConflictUnresolvable);
        assert_eq!(entries[0].records.len(), 2);
    }

    #[tokio::test]
    async fn test_requeue_budget_exhaustion_dead_letters_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        store.inject_failure("logs", StoreError::transient("database is shutting down"), 100);
        let pipeline = spawn(config(), store.clone()).await;
        let handle = pipeline.handle();

        handle.submit(record("logs", 1, json!("x"))).await.unwrap();
        handle.submit(record("blocks", 1, json!("y"))).await.unwrap();

        let report = pipeline.shutdown().await.unwrap();

        // one initial write plus max_requeues retries
        assert_eq!(store.upsert_calls(&RecordKind::from("logs")), 3);
        assert_eq!(store.row_count(&RecordKind::from("blocks")), 1);
        assert_eq!(report.stats.requeued_records, 2);
        assert_eq!(report.stats.dead_lettered_records, 1);
        assert_eq!(report.dead_letters.len(), 1);
        assert_eq!(report.dead_letters[0].error.kind, ErrorKind::StorageTransient);
        assert_eq!(report.stats.buffered_records, 0);
    }

    // ---------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_shutdown_flushes_buffer_and_closes_handles() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = spawn(config(), store.clone()).await;
        let handle = pipeline.handle();

        handle
            .submit_many((0..3).map(|n| record("blocks", n, json!(n))).collect())
            .await
            .unwrap();
        let report = pipeline.shutdown().await.unwrap();

        assert_eq!(store.row_count(&RecordKind::from("blocks")), 3);
        assert_eq!(report.stats.submitted_records, 3);
        assert_eq!(report.flush_stats.committed_rows, 3);
        assert!(report.is_clean());

        let err = handle.submit(record("blocks", 9, json!(9))).await.unwrap_err();
        assert!(matches!(err, ExportError::PipelineClosed));
        assert!(matches!(handle.flush().await, Err(ExportError::PipelineClosed)));
    }

    #[tokio::test]
    async fn test_flush_and_stats_queued_behind_shutdown_are_answered() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = spawn(config(), store.clone()).await;
        let tx = pipeline.handle().tx;

        let records = (0..4).map(|n| record("blocks", n, json!(n))).collect();
        tx.send(Command::Submit(records)).await.unwrap();
        tx.send(Command::Shutdown).await.unwrap();
        let (flush_reply, flushed) = oneshot::channel();
        tx.send(Command::Flush(flush_reply)).await.unwrap();
        let (stats_reply, stats) = oneshot::channel();
        tx.send(Command::Stats(stats_reply)).await.unwrap();

        let outcome = flushed.await.unwrap();
        assert_eq!(outcome.committed_rows, 4);
        assert!(outcome.is_complete());
        let stats = stats.await.unwrap();
        assert_eq!(stats.submitted_records, 4);
        assert_eq!(stats.committed_rows, 4);
        assert_eq!(stats.buffered_records, 0);

        let report = pipeline.task.await.unwrap();
        assert_eq!(store.row_count(&RecordKind::from("blocks")), 4);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = ExportPipeline::spawn(
            ExportConfig {
                writer_parallelism: 0,
                ..config()
            },
            Arc::new(MemoryStore::new()),
            Arc::new(PerformanceRecorder::new(8)),
        )
        .await;
        assert!(matches!(result, Err(ExportError::InvalidConfig(_))));
    }
}

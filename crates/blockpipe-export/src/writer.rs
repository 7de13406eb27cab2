//! Batch writer.
//!
//! Executes one [`FlushBatch`] as one upsert per record kind, with at most
//! `parallelism` partitions in flight. `StorageTransient` failures are
//! retried per partition with backoff; a partition that still fails is
//! returned, records included, in the [`FlushReport`]. Committed sibling
//! partitions are never rolled back.

use crate::buffer::{FlushBatch, FlushReason};
use crate::store::RecordStore;
use blockpipe_core::{
    retry_with_backoff, ExportRecord, PerformanceRecorder, PrimaryKey, RecordKind, RetryPolicy,
    StoreError,
};
use blockpipe_observability::metrics::{
    EXPORT_FAILED_PARTITIONS_TOTAL, EXPORT_FLUSHES_TOTAL, EXPORT_FLUSH_LATENCY, EXPORT_ROWS_TOTAL,
};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// A partition that committed.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedPartition {
    pub kind: RecordKind,
    pub rows: u64,
    pub attempts: u32,
}

/// A partition that did not commit, with every record it held.
#[derive(Debug, Clone)]
pub struct FailedPartition {
    pub kind: RecordKind,
    pub error: StoreError,
    pub attempts: u32,
    pub records: Vec<ExportRecord>,
}

/// Outcome of writing one flush batch.
#[derive(Debug, Clone)]
pub struct FlushReport {
    pub batch_id: u64,
    pub reason: FlushReason,
    pub committed: Vec<CommittedPartition>,
    pub failed: Vec<FailedPartition>,
    pub elapsed: Duration,
    requeues: HashMap<RecordKind, HashMap<PrimaryKey, u32>>,
}

impl FlushReport {
    /// True only when every partition committed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn committed_rows(&self) -> u64 {
        self.committed.iter().map(|p| p.rows).sum()
    }

    pub fn failed_records(&self) -> impl Iterator<Item = &ExportRecord> {
        self.failed.iter().flat_map(|p| p.records.iter())
    }

    /// Requeue count the record carried into this flush.
    pub fn requeue_count(&self, kind: &RecordKind, key: &PrimaryKey) -> u32 {
        self.requeues
            .get(kind)
            .and_then(|keys| keys.get(key))
            .copied()
            .unwrap_or(0)
    }

    /// A batch holding only the failed partitions, for replay. Committed
    /// partitions are not included.
    pub fn retry_batch(&self) -> Option<FlushBatch> {
        if self.failed.is_empty() {
            return None;
        }
        let mut partitions = BTreeMap::new();
        let mut requeues: HashMap<RecordKind, HashMap<PrimaryKey, u32>> = HashMap::new();
        for failed in &self.failed {
            let counts = requeues.entry(failed.kind.clone()).or_default();
            for record in &failed.records {
                counts.insert(
                    record.key().clone(),
                    self.requeue_count(&failed.kind, record.key()) + 1,
                );
            }
            partitions.insert(failed.kind.clone(), failed.records.clone());
        }
        Some(FlushBatch::from_parts(
            self.batch_id,
            FlushReason::Retry,
            partitions,
            requeues,
        ))
    }

    pub fn into_failed(self) -> Vec<FailedPartition> {
        self.failed
    }

    pub(crate) fn split_failed(
        self,
    ) -> (
        Vec<FailedPartition>,
        HashMap<RecordKind, HashMap<PrimaryKey, u32>>,
    ) {
        (self.failed, self.requeues)
    }
}

/// Writes flush batches against a [`RecordStore`].
#[derive(Clone)]
pub struct BatchWriter {
    store: Arc<dyn RecordStore>,
    parallelism: usize,
    retry: RetryPolicy,
    recorder: Arc<PerformanceRecorder>,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn RecordStore>,
        parallelism: usize,
        retry: RetryPolicy,
        recorder: Arc<PerformanceRecorder>,
    ) -> Self {
        Self {
            store,
            parallelism: parallelism.max(1),
            retry,
            recorder,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn recorder(&self) -> &Arc<PerformanceRecorder> {
        &self.recorder
    }

    pub async fn write(&self, batch: FlushBatch) -> FlushReport {
        let started = Instant::now();
        let batch_id = batch.id();
        let reason = batch.reason();
        let (partitions, requeues) = batch.into_parts();

        let outcomes: Vec<Result<CommittedPartition, FailedPartition>> = stream::iter(partitions)
            .map(|(kind, records)| self.write_partition(kind, records))
            .buffer_unordered(self.parallelism)
            .collect()
            .await;

        let mut committed = Vec::new();
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(partition) => committed.push(partition),
                Err(partition) => failed.push(partition),
            }
        }
        committed.sort_by(|a, b| a.kind.cmp(&b.kind));
        failed.sort_by(|a, b| a.kind.cmp(&b.kind));

        let report = FlushReport {
            batch_id,
            reason,
            committed,
            failed,
            elapsed: started.elapsed(),
            requeues,
        };
        self.observe(&report);
        report
    }

    async fn write_partition(
        &self,
        kind: RecordKind,
        records: Vec<ExportRecord>,
    ) -> Result<CommittedPartition, FailedPartition> {
        let store = &self.store;
        let kind_ref = &kind;
        let rows = records.as_slice();
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let outcome = retry_with_backoff(&self.retry, "upsert_partition", move || {
            counter.fetch_add(1, Ordering::Relaxed);
            store.upsert(kind_ref, rows)
        })
        .await;

        match outcome {
            Ok(written) => {
                EXPORT_ROWS_TOTAL
                    .with_label_values(&[kind.as_str()])
                    .inc_by(written);
                Ok(CommittedPartition {
                    kind,
                    rows: written,
                    attempts: attempts.load(Ordering::Relaxed),
                })
            }
            Err((error, attempts)) => {
                EXPORT_FAILED_PARTITIONS_TOTAL
                    .with_label_values(&[kind.as_str(), error.kind.as_str()])
                    .inc();
                warn!(
                    kind = %kind,
                    rows = records.len(),
                    attempts,
                    error_type = %error.kind,
                    error = %error.message,
                    "Partition write failed"
                );
                Err(FailedPartition {
                    kind,
                    error,
                    attempts,
                    records,
                })
            }
        }
    }

    fn observe(&self, report: &FlushReport) {
        let status = if report.is_complete() { "complete" } else { "partial" };
        EXPORT_FLUSHES_TOTAL.with_label_values(&[status]).inc();
        EXPORT_FLUSH_LATENCY
            .with_label_values(&[status])
            .observe(report.elapsed.as_secs_f64());

        self.recorder.record_flush(
            report.committed.len() as u64,
            report.committed_rows(),
            report.failed.len() as u64,
            report.elapsed,
        );

        if report.is_complete() {
            info!(
                batch_id = report.batch_id,
                reason = %report.reason,
                partitions = report.committed.len(),
                rows = report.committed_rows(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Flush committed"
            );
        } else {
            warn!(
                batch_id = report.batch_id,
                reason = %report.reason,
                committed_partitions = report.committed.len(),
                failed_partitions = report.failed.len(),
                failed_rows = report.failed_records().count(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Flush partially failed"
            );
        }
    }
}

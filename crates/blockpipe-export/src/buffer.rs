//! In-memory export buffer.
//!
//! Records are accumulated per record kind and coalesced by primary key
//! until a flush trigger fires, then handed out as an immutable
//! [`FlushBatch`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐
//! │  add(record) │ producer hand-off (via the pipeline task)
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────────────────────────────┐
//! │  ExportBuffer                        │
//! │  kind -> { primary key -> record }   │ last add wins
//! │  record count, estimated bytes       │
//! │  oldest entry time                   │
//! └──────┬───────────────────────────────┘
//!        │
//!        ├─→ Flush on record count
//!        ├─→ Flush on estimated bytes
//!        ├─→ Flush on age of oldest record
//!        ├─→ Flush on explicit request
//!        │
//!        ▼
//! ┌──────────────────────────────────────┐
//! │  FlushBatch                          │
//! │  kind -> records (sorted by key)     │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## Thread Safety
//!
//! `ExportBuffer` is NOT thread-safe. It has a single owner, the pipeline's
//! flusher task, which receives records from producers over a channel.

use crate::config::ExportConfig;
use blockpipe_core::{ExportRecord, PrimaryKey, RecordKind};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Why a flush batch was cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    RecordLimit,
    ByteLimit,
    Age,
    Requested,
    Retry,
    Shutdown,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlushReason::RecordLimit => "record_limit",
            FlushReason::ByteLimit => "byte_limit",
            FlushReason::Age => "age",
            FlushReason::Requested => "requested",
            FlushReason::Retry => "retry",
            FlushReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Immutable snapshot of buffered records, partitioned by record kind.
///
/// Within a partition every primary key appears at most once and records
/// are ordered by key, so concurrent writers touch rows in a consistent
/// order.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    id: u64,
    reason: FlushReason,
    partitions: BTreeMap<RecordKind, Vec<ExportRecord>>,
    /// Sparse: only records that were requeued at least once.
    requeues: HashMap<RecordKind, HashMap<PrimaryKey, u32>>,
}

impl FlushBatch {
    /// Build a batch from records in arrival order, coalescing duplicate
    /// primary keys so the last record wins.
    pub fn from_records(
        id: u64,
        reason: FlushReason,
        records: impl IntoIterator<Item = ExportRecord>,
    ) -> Self {
        let mut by_kind: HashMap<RecordKind, HashMap<PrimaryKey, ExportRecord>> = HashMap::new();
        for record in records {
            by_kind
                .entry(record.kind().clone())
                .or_default()
                .insert(record.key().clone(), record);
        }
        Self::from_coalesced(id, reason, by_kind, HashMap::new())
    }

    fn from_coalesced(
        id: u64,
        reason: FlushReason,
        by_kind: HashMap<RecordKind, HashMap<PrimaryKey, ExportRecord>>,
        requeues: HashMap<RecordKind, HashMap<PrimaryKey, u32>>,
    ) -> Self {
        let partitions = by_kind
            .into_iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(kind, records)| {
                let mut rows: Vec<(PrimaryKey, ExportRecord)> = records.into_iter().collect();
                rows.sort_by(|a, b| a.0.cmp(&b.0));
                (kind, rows.into_iter().map(|(_, r)| r).collect())
            })
            .collect();
        Self {
            id,
            reason,
            partitions,
            requeues,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn reason(&self) -> FlushReason {
        self.reason
    }

    pub fn record_count(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &RecordKind> {
        self.partitions.keys()
    }

    pub fn partition(&self, kind: &RecordKind) -> Option<&[ExportRecord]> {
        self.partitions.get(kind).map(Vec::as_slice)
    }

    /// How many times this record has already been put back after a
    /// transient write failure.
    pub fn requeue_count(&self, kind: &RecordKind, key: &PrimaryKey) -> u32 {
        self.requeues
            .get(kind)
            .and_then(|keys| keys.get(key))
            .copied()
            .unwrap_or(0)
    }

    pub fn into_partitions(self) -> BTreeMap<RecordKind, Vec<ExportRecord>> {
        self.partitions
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        BTreeMap<RecordKind, Vec<ExportRecord>>,
        HashMap<RecordKind, HashMap<PrimaryKey, u32>>,
    ) {
        (self.partitions, self.requeues)
    }

    pub(crate) fn from_parts(
        id: u64,
        reason: FlushReason,
        partitions: BTreeMap<RecordKind, Vec<ExportRecord>>,
        requeues: HashMap<RecordKind, HashMap<PrimaryKey, u32>>,
    ) -> Self {
        Self {
            id,
            reason,
            partitions,
            requeues,
        }
    }
}

#[derive(Debug)]
struct Buffered {
    record: ExportRecord,
    size: usize,
    requeues: u32,
}

/// Per-kind, key-coalescing record buffer with flush triggers.
///
/// # Examples
///
/// ```ignore
/// let mut buffer = ExportBuffer::new(&ExportConfig::default());
/// if buffer.add(record) {
///     if let Some(batch) = buffer.flush_if_due() {
///         writer.write(batch).await;
///     }
/// }
/// ```
#[derive(Debug)]
pub struct ExportBuffer {
    partitions: HashMap<RecordKind, HashMap<PrimaryKey, Buffered>>,
    len: usize,
    bytes: usize,
    oldest: Option<Instant>,
    flush_requested: bool,
    next_batch_id: u64,

    max_records: usize,
    max_bytes: usize,
    max_age: Option<Duration>,
}

impl ExportBuffer {
    pub fn new(config: &ExportConfig) -> Self {
        Self {
            partitions: HashMap::new(),
            len: 0,
            bytes: 0,
            oldest: None,
            flush_requested: false,
            next_batch_id: 1,
            max_records: config.max_buffered_records,
            max_bytes: config.max_buffered_bytes,
            max_age: config.max_buffer_age(),
        }
    }

    /// Buffer a record, replacing any buffered record with the same kind and
    /// primary key. Returns `true` when a flush is now due.
    pub fn add(&mut self, record: ExportRecord) -> bool {
        self.insert(record, 0, true);
        self.due().is_some()
    }

    /// Put back records from a failed partition write.
    ///
    /// A record is only restored if no newer record with the same key has
    /// been added since the batch was cut. Returns the number restored.
    pub fn requeue(&mut self, records: Vec<ExportRecord>, requeues: u32) -> usize {
        let mut restored = 0;
        for record in records {
            if self.insert(record, requeues, false) {
                restored += 1;
            }
        }
        restored
    }

    fn insert(&mut self, record: ExportRecord, requeues: u32, replace: bool) -> bool {
        let size = record.estimated_size();
        let partition = self.partitions.entry(record.kind().clone()).or_default();

        if let Some(existing) = partition.get_mut(record.key()) {
            if !replace {
                return false;
            }
            trace!(kind = %record.kind(), key = %record.key(), "Coalesced buffered record");
            self.bytes = self.bytes - existing.size + size;
            existing.record = record;
            existing.size = size;
            existing.requeues = 0;
            return true;
        }

        partition.insert(
            record.key().clone(),
            Buffered {
                record,
                size,
                requeues,
            },
        );
        self.len += 1;
        self.bytes += size;
        self.oldest.get_or_insert_with(Instant::now);
        true
    }

    /// Ask for a flush at the next opportunity, regardless of thresholds.
    pub fn request_flush(&mut self) {
        self.flush_requested = true;
    }

    /// The trigger that currently calls for a flush, if any.
    pub fn due(&self) -> Option<FlushReason> {
        if self.len == 0 {
            return None;
        }
        if self.flush_requested {
            return Some(FlushReason::Requested);
        }
        if self.len >= self.max_records {
            return Some(FlushReason::RecordLimit);
        }
        if self.bytes >= self.max_bytes {
            return Some(FlushReason::ByteLimit);
        }
        match (self.max_age, self.oldest) {
            (Some(max_age), Some(oldest)) if oldest.elapsed() >= max_age => Some(FlushReason::Age),
            _ => None,
        }
    }

    /// When the age trigger will fire for the current contents.
    pub fn age_deadline(&self) -> Option<Instant> {
        match (self.max_age, self.oldest) {
            (Some(max_age), Some(oldest)) => Some(oldest + max_age),
            _ => None,
        }
    }

    /// Cut a batch if any trigger has fired.
    pub fn flush_if_due(&mut self) -> Option<FlushBatch> {
        match self.due() {
            Some(reason) => self.take_all(reason),
            None => {
                // an explicit request against an empty buffer is satisfied
                self.flush_requested = false;
                None
            }
        }
    }

    /// Cut a batch from everything buffered, or `None` if empty.
    pub fn take_all(&mut self, reason: FlushReason) -> Option<FlushBatch> {
        self.flush_requested = false;
        if self.len == 0 {
            return None;
        }

        let mut by_kind = HashMap::with_capacity(self.partitions.len());
        let mut requeues: HashMap<RecordKind, HashMap<PrimaryKey, u32>> = HashMap::new();
        for (kind, entries) in self.partitions.drain() {
            let mut records = HashMap::with_capacity(entries.len());
            for (key, buffered) in entries {
                if buffered.requeues > 0 {
                    requeues
                        .entry(kind.clone())
                        .or_default()
                        .insert(key.clone(), buffered.requeues);
                }
                records.insert(key, buffered.record);
            }
            by_kind.insert(kind, records);
        }

        let id = self.next_batch_id;
        self.next_batch_id += 1;
        let batch = FlushBatch::from_coalesced(id, reason, by_kind, requeues);

        debug!(
            batch_id = id,
            reason = %reason,
            records = self.len,
            bytes = self.bytes,
            "Cut flush batch"
        );

        self.len = 0;
        self.bytes = 0;
        self.oldest = None;
        Some(batch)
    }

    /// Allocate an id for a batch built outside the buffer.
    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_batch_id;
        self.next_batch_id += 1;
        id
    }

    /// Distinct records buffered.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn estimated_bytes(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockpipe_core::KeyPart;
    use serde_json::{json, Map, Value};

    fn record(kind: &str, key: u64, value: Value) -> ExportRecord {
        let mut payload = Map::new();
        payload.insert("value".to_string(), value);
        ExportRecord::new(kind, PrimaryKey::single(KeyPart::UInt(key)), payload).unwrap()
    }

    fn config(max_records: usize, max_bytes: usize, max_age_ms: u64) -> ExportConfig {
        ExportConfig {
            max_buffered_records: max_records,
            max_buffered_bytes: max_bytes,
            max_buffer_age_ms: max_age_ms,
            ..Default::default()
        }
    }

    // ---------------------------------------------------------------
    // Coalescing
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_last_add_wins_for_same_key() {
        let mut buffer = ExportBuffer::new(&config(100, usize::MAX, 0));
        buffer.add(record("blocks", 1, json!("a")));
        buffer.add(record("blocks", 1, json!("b")));

        assert_eq!(buffer.len(), 1);
        let batch = buffer.take_all(FlushReason::Requested).unwrap();
        let rows = batch.partition(&RecordKind::from("blocks")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload()["value"], json!("b"));
    }

    #[tokio::test]
    async fn test_same_key_different_kinds_are_distinct() {
        let mut buffer = ExportBuffer::new(&config(100, usize::MAX, 0));
        buffer.add(record("blocks", 1, json!(1)));
        buffer.add(record("transactions", 1, json!(2)));

        assert_eq!(buffer.len(), 2);
        let batch = buffer.take_all(FlushReason::Requested).unwrap();
        assert_eq!(batch.kinds().count(), 2);
        assert_eq!(batch.record_count(), 2);
    }

    #[tokio::test]
    async fn test_coalescing_adjusts_byte_estimate() {
        let mut buffer = ExportBuffer::new(&config(100, usize::MAX, 0));
        buffer.add(record("blocks", 1, json!("short")));
        let before = buffer.estimated_bytes();
        buffer.add(record("blocks", 1, json!("a much longer replacement value")));
        assert!(buffer.estimated_bytes() > before);
        assert_eq!(
            buffer.estimated_bytes(),
            record("blocks", 1, json!("a much longer replacement value")).estimated_size()
        );
    }

    #[tokio::test]
    async fn test_partition_is_sorted_by_key() {
        let mut buffer = ExportBuffer::new(&config(100, usize::MAX, 0));
        for key in [5, 1, 3] {
            buffer.add(record("blocks", key, json!(key)));
        }
        let batch = buffer.take_all(FlushReason::Requested).unwrap();
        let keys: Vec<_> = batch
            .partition(&RecordKind::from("blocks"))
            .unwrap()
            .iter()
            .map(|r| r.key().clone())
            .collect();
        assert_eq!(
            keys,
            vec![
                PrimaryKey::single(KeyPart::UInt(1)),
                PrimaryKey::single(KeyPart::UInt(3)),
                PrimaryKey::single(KeyPart::UInt(5)),
            ]
        );
    }

    // ---------------------------------------------------------------
    // Flush triggers
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_record_limit_trigger() {
        let mut buffer = ExportBuffer::new(&config(3, usize::MAX, 0));
        assert!(!buffer.add(record("blocks", 1, json!(1))));
        assert!(!buffer.add(record("blocks", 2, json!(2))));
        // coalesced add does not count toward the limit
        assert!(!buffer.add(record("blocks", 2, json!(3))));
        assert!(buffer.add(record("blocks", 3, json!(4))));

        let batch = buffer.flush_if_due().unwrap();
        assert_eq!(batch.reason(), FlushReason::RecordLimit);
        assert_eq!(batch.record_count(), 3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.estimated_bytes(), 0);
    }

    #[tokio::test]
    async fn test_byte_limit_trigger() {
        let one = record("blocks", 1, json!("x")).estimated_size();
        let mut buffer = ExportBuffer::new(&config(1_000, one * 2, 0));
        assert!(!buffer.add(record("blocks", 1, json!("x"))));
        assert!(buffer.add(record("blocks", 2, json!("x"))));
        assert_eq!(buffer.due(), Some(FlushReason::ByteLimit));
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_trigger() {
        let mut buffer = ExportBuffer::new(&config(1_000, usize::MAX, 500));
        assert!(buffer.age_deadline().is_none());
        assert!(!buffer.add(record("blocks", 1, json!(1))));
        assert!(buffer.flush_if_due().is_none());

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(buffer.flush_if_due().is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        let batch = buffer.flush_if_due().unwrap();
        assert_eq!(batch.reason(), FlushReason::Age);
        assert!(buffer.age_deadline().is_none());
    }

    #[tokio::test]
    async fn test_requested_flush() {
        let mut buffer = ExportBuffer::new(&config(1_000, usize::MAX, 0));
        buffer.add(record("blocks", 1, json!(1)));
        assert!(buffer.flush_if_due().is_none());

        buffer.request_flush();
        let batch = buffer.flush_if_due().unwrap();
        assert_eq!(batch.reason(), FlushReason::Requested);
    }

    #[tokio::test]
    async fn test_request_on_empty_buffer_is_cleared() {
        let mut buffer = ExportBuffer::new(&config(1_000, usize::MAX, 0));
        buffer.request_flush();
        assert!(buffer.flush_if_due().is_none());

        buffer.add(record("blocks", 1, json!(1)));
        assert!(buffer.flush_if_due().is_none());
    }

    #[tokio::test]
    async fn test_batch_ids_increase() {
        let mut buffer = ExportBuffer::new(&config(1_000, usize::MAX, 0));
        buffer.add(record("blocks", 1, json!(1)));
        let first = buffer.take_all(FlushReason::Requested).unwrap();
        buffer.add(record("blocks", 2, json!(2)));
        let second = buffer.take_all(FlushReason::Requested).unwrap();
        assert!(second.id() > first.id());
        assert!(buffer.take_all(FlushReason::Requested).is_none());
    }

    // ---------------------------------------------------------------
    // Requeue
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_requeue_does_not_override_newer_record() {
        let mut buffer = ExportBuffer::new(&config(1_000, usize::MAX, 0));
        buffer.add(record("blocks", 1, json!("newer")));

        let restored = buffer.requeue(
            vec![record("blocks", 1, json!("older")), record("blocks", 2, json!("older"))],
            1,
        );
        assert_eq!(restored, 1);

        let batch = buffer.take_all(FlushReason::Retry).unwrap();
        let rows = batch.partition(&RecordKind::from("blocks")).unwrap();
        assert_eq!(rows[0].payload()["value"], json!("newer"));
        assert_eq!(rows[1].payload()["value"], json!("older"));

        let kind = RecordKind::from("blocks");
        assert_eq!(batch.requeue_count(&kind, &PrimaryKey::single(KeyPart::UInt(1))), 0);
        assert_eq!(batch.requeue_count(&kind, &PrimaryKey::single(KeyPart::UInt(2))), 1);
    }

    #[tokio::test]
    async fn test_fresh_add_resets_requeue_count() {
        let mut buffer = ExportBuffer::new(&config(1_000, usize::MAX, 0));
        buffer.requeue(vec![record("blocks", 7, json!("old"))], 2);
        buffer.add(record("blocks", 7, json!("new")));

        let batch = buffer.take_all(FlushReason::Requested).unwrap();
        assert_eq!(
            batch.requeue_count(&RecordKind::from("blocks"), &PrimaryKey::single(KeyPart::UInt(7))),
            0
        );
    }

    #[test]
    fn test_from_records_coalesces() {
        let batch = FlushBatch::from_records(
            9,
            FlushReason::Requested,
            vec![
                record("blocks", 1, json!("A")),
                record("logs", 1, json!("L")),
                record("blocks", 1, json!("B")),
            ],
        );
        assert_eq!(batch.id(), 9);
        assert_eq!(batch.record_count(), 2);
        let blocks = batch.partition(&RecordKind::from("blocks")).unwrap();
        assert_eq!(blocks[0].payload()["value"], json!("B"));
        assert!(batch.partition(&RecordKind::from("traces")).is_none());
    }
}

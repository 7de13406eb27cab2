//! Storage abstraction for export records.
//!
//! A [`RecordStore`] is addressed by record kind (table) and primary key. The
//! only write operation is a per-partition upsert that must be atomic: every
//! record of the partition is committed, or none is.

use async_trait::async_trait;
use blockpipe_core::{ExportRecord, PrimaryKey, RecordKind, StoreError};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Upsert-capable transactional store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or overwrite, by primary key, every record of one partition in
    /// a single atomic operation. Returns the number of rows written.
    async fn upsert(&self, kind: &RecordKind, records: &[ExportRecord]) -> Result<u64, StoreError>;

    /// Read back the payload stored under `key`.
    async fn fetch(
        &self,
        kind: &RecordKind,
        key: &PrimaryKey,
    ) -> Result<Option<Map<String, Value>>, StoreError>;

    fn name(&self) -> &str;
}

/// In-memory [`RecordStore`].
///
/// Used by tests and dry runs. Supports injecting failures per record kind.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<RecordKind, HashMap<PrimaryKey, Map<String, Value>>>>,
    faults: Mutex<HashMap<RecordKind, (StoreError, u32)>>,
    upserts: Mutex<HashMap<RecordKind, u64>>,
    rows_written: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` upserts of `kind` with `error`.
    pub fn inject_failure(&self, kind: impl Into<RecordKind>, error: StoreError, times: u32) {
        self.faults.lock().insert(kind.into(), (error, times));
    }

    pub fn clear_failures(&self) {
        self.faults.lock().clear();
    }

    /// Rows currently stored for `kind`.
    pub fn row_count(&self, kind: &RecordKind) -> usize {
        self.tables.read().get(kind).map_or(0, HashMap::len)
    }

    /// Upsert calls that reached the table (successful or not) for `kind`.
    pub fn upsert_calls(&self, kind: &RecordKind) -> u64 {
        self.upserts.lock().get(kind).copied().unwrap_or(0)
    }

    /// Total rows applied by successful upserts, counting overwrites.
    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    fn take_fault(&self, kind: &RecordKind) -> Option<StoreError> {
        let mut faults = self.faults.lock();
        let (error, remaining) = faults.get_mut(kind)?;
        let error = error.clone();
        *remaining -= 1;
        if *remaining == 0 {
            faults.remove(kind);
        }
        Some(error)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(&self, kind: &RecordKind, records: &[ExportRecord]) -> Result<u64, StoreError> {
        *self.upserts.lock().entry(kind.clone()).or_insert(0) += 1;

        if let Some(error) = self.take_fault(kind) {
            return Err(error);
        }
        if let Some(stray) = records.iter().find(|r| r.kind() != kind) {
            return Err(StoreError::conflict(format!(
                "record {} of kind {} written to partition {}",
                stray.key(),
                stray.kind(),
                kind
            )));
        }

        let mut tables = self.tables.write();
        let table = tables.entry(kind.clone()).or_default();
        for record in records {
            table.insert(record.key().clone(), record.payload().clone());
        }
        let rows = records.len() as u64;
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
        Ok(rows)
    }

    async fn fetch(
        &self,
        kind: &RecordKind,
        key: &PrimaryKey,
    ) -> Result<Option<Map<String, Value>>, StoreError> {
        Ok(self
            .tables
            .read()
            .get(kind)
            .and_then(|table| table.get(key))
            .cloned())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockpipe_core::{ErrorKind, KeyPart};
    use serde_json::json;

    fn record(kind: &str, key: i64, value: Value) -> ExportRecord {
        let mut payload = Map::new();
        payload.insert("value".to_string(), value);
        ExportRecord::new(kind, PrimaryKey::single(KeyPart::Int(key)), payload).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_then_fetch() {
        let store = MemoryStore::new();
        let kind = RecordKind::from("blocks");
        let rows = store
            .upsert(&kind, &[record("blocks", 1, json!("a")), record("blocks", 2, json!("b"))])
            .await
            .unwrap();
        assert_eq!(rows, 2);

        let fetched = store
            .fetch(&kind, &PrimaryKey::single(KeyPart::Int(2)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched["value"], json!("b"));
        assert!(store
            .fetch(&kind, &PrimaryKey::single(KeyPart::Int(3)))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let store = MemoryStore::new();
        let kind = RecordKind::from("blocks");
        store.upsert(&kind, &[record("blocks", 1, json!("a"))]).await.unwrap();
        store.upsert(&kind, &[record("blocks", 1, json!("b"))]).await.unwrap();

        assert_eq!(store.row_count(&kind), 1);
        assert_eq!(store.rows_written(), 2);
        let fetched = store
            .fetch(&kind, &PrimaryKey::single(KeyPart::Int(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched["value"], json!("b"));
    }

    #[tokio::test]
    async fn test_injected_failure_is_atomic_and_finite() {
        let store = MemoryStore::new();
        let kind = RecordKind::from("logs");
        store.inject_failure("logs", StoreError::transient("connection reset"), 2);

        for _ in 0..2 {
            let err = store
                .upsert(&kind, &[record("logs", 1, json!(1))])
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::StorageTransient);
            assert_eq!(store.row_count(&kind), 0);
        }
        store.upsert(&kind, &[record("logs", 1, json!(1))]).await.unwrap();
        assert_eq!(store.row_count(&kind), 1);
        assert_eq!(store.upsert_calls(&kind), 3);
    }

    #[tokio::test]
    async fn test_mismatched_kind_is_conflict() {
        let store = MemoryStore::new();
        let err = store
            .upsert(&RecordKind::from("blocks"), &[record("logs", 1, json!(1))])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StorageConflictUnresolvable);
        assert_eq!(store.row_count(&RecordKind::from("blocks")), 0);
    }
}

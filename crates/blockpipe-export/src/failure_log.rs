//! Durable failure log.
//!
//! Partitions that cannot be committed are appended here as JSON lines, one
//! [`FailureEntry`] per line, so they can be inspected and replayed later.
//! Every append is flushed and synced before returning.

use crate::error::Result;
use crate::writer::FailedPartition;
use blockpipe_core::{ExportRecord, RecordKind, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// One dead-lettered partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub logged_at: DateTime<Utc>,
    pub batch_id: u64,
    pub kind: RecordKind,
    pub error: StoreError,
    pub attempts: u32,
    pub records: Vec<ExportRecord>,
}

impl FailureEntry {
    pub fn new(batch_id: u64, partition: FailedPartition) -> Self {
        Self {
            logged_at: Utc::now(),
            batch_id,
            kind: partition.kind,
            error: partition.error,
            attempts: partition.attempts,
            records: partition.records,
        }
    }
}

/// Append-only JSON-lines file of [`FailureEntry`] values.
#[derive(Debug)]
pub struct FailureLog {
    path: PathBuf,
    file: File,
    appended: u64,
}

impl FailureLog {
    /// Open `path` for appending, creating it if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Self {
            path,
            file,
            appended: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries appended through this handle.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    pub async fn append(&mut self, entry: &FailureEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        self.appended += 1;
        Ok(())
    }

    /// Read every entry of a failure log.
    ///
    /// A torn final line, left by a crash mid-append, is skipped.
    pub async fn read_all(path: impl AsRef<Path>) -> Result<Vec<FailureEntry>> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();

        let mut entries = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<FailureEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if i + 1 == lines.len() && !contents.ends_with('\n') => {
                    warn!(path = %path.as_ref().display(), error = %e, "Skipping torn final line");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExportError;
    use blockpipe_core::{KeyPart, PrimaryKey};
    use serde_json::{json, Map};

    fn partition(kind: &str, keys: &[i64]) -> FailedPartition {
        FailedPartition {
            kind: RecordKind::from(kind),
            error: StoreError::conflict("null value in column \"hash\""),
            attempts: 1,
            records: keys
                .iter()
                .map(|k| {
                    let mut payload = Map::new();
                    payload.insert("n".to_string(), json!(k));
                    ExportRecord::new(kind, PrimaryKey::single(KeyPart::Int(*k)), payload).unwrap()
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.jsonl");

        let mut log = FailureLog::open(&path).await.unwrap();
        let first = FailureEntry::new(3, partition("blocks", &[1, 2]));
        let second = FailureEntry::new(4, partition("logs", &[9]));
        log.append(&first).await.unwrap();
        log.append(&second).await.unwrap();
        assert_eq!(log.appended(), 2);

        let entries = FailureLog::read_all(&path).await.unwrap();
        assert_eq!(entries, vec![first, second]);
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("failed.jsonl");

        FailureLog::open(&path)
            .await
            .unwrap()
            .append(&FailureEntry::new(1, partition("blocks", &[1])))
            .await
            .unwrap();
        FailureLog::open(&path)
            .await
            .unwrap()
            .append(&FailureEntry::new(2, partition("blocks", &[2])))
            .await
            .unwrap();

        let entries = FailureLog::read_all(&path).await.unwrap();
        assert_eq!(entries.iter().map(|e| e.batch_id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_torn_final_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.jsonl");

        let mut log = FailureLog::open(&path).await.unwrap();
        log.append(&FailureEntry::new(1, partition("blocks", &[1]))).await.unwrap();
        {
            use std::io::Write;
            std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .unwrap()
                .write_all(b"{\"logged_at\":\"2024-")
                .unwrap();
        }

        let entries = FailureLog::read_all(&path).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.jsonl");
        tokio::fs::write(&path, "not json\n{}\n").await.unwrap();

        let result = FailureLog::read_all(&path).await;
        assert!(matches!(result, Err(ExportError::Serialization(_))));
    }
}

//! Export guarantees exercised through the public API.

use blockpipe_core::{
    ExportRecord, KeyPart, PerformanceRecorder, PrimaryKey, RecordKind, RetryPolicy, StoreError,
};
use blockpipe_export::{
    BatchWriter, ExportConfig, ExportPipeline, FailureLog, FlushBatch, FlushReason, MemoryStore,
    RecordStore,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn block(number: u64, hash: &str) -> ExportRecord {
    let mut payload = Map::new();
    payload.insert("hash".to_string(), json!(hash));
    ExportRecord::new("blocks", PrimaryKey::single(KeyPart::UInt(number)), payload).unwrap()
}

fn transaction(number: u64, index: u64, value: Value) -> ExportRecord {
    let mut payload = Map::new();
    payload.insert("value".to_string(), value);
    ExportRecord::new(
        "transactions",
        PrimaryKey::new(vec![KeyPart::UInt(number), KeyPart::UInt(index)]),
        payload,
    )
    .unwrap()
}

fn pipeline_config() -> ExportConfig {
    ExportConfig {
        max_buffer_age_ms: 0,
        retry: RetryPolicy::no_retry(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_last_write_wins_through_pipeline() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = ExportPipeline::spawn(
        pipeline_config(),
        store.clone(),
        Arc::new(PerformanceRecorder::default()),
    )
    .await
    .unwrap();
    let handle = pipeline.handle();

    handle.submit(block(100, "0xA")).await.unwrap();
    handle.submit(block(100, "0xB")).await.unwrap();
    let outcome = handle.flush().await.unwrap();
    assert_eq!(outcome.committed_rows, 1);

    let stored = store
        .fetch(&RecordKind::from("blocks"), &PrimaryKey::single(KeyPart::UInt(100)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored["hash"], json!("0xB"));
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_partial_flush_then_retry_of_failed_partition_only() {
    let store = Arc::new(MemoryStore::new());
    store.inject_failure("transactions", StoreError::transient("connection reset by peer"), 1);
    let writer = BatchWriter::new(
        store.clone(),
        2,
        RetryPolicy::no_retry(),
        Arc::new(PerformanceRecorder::default()),
    );

    let batch = FlushBatch::from_records(
        1,
        FlushReason::Requested,
        vec![
            block(1, "0x01"),
            block(2, "0x02"),
            transaction(1, 0, json!("0x10")),
            transaction(1, 1, json!("0x20")),
        ],
    );
    let report = writer.write(batch).await;

    assert!(!report.is_complete());
    assert_eq!(report.committed.len(), 1);
    assert_eq!(report.committed[0].kind, RecordKind::from("blocks"));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed_records().count(), 2);
    assert!(report
        .failed_records()
        .all(|r| r.kind() == &RecordKind::from("transactions")));

    let retry = report.retry_batch().unwrap();
    assert_eq!(retry.record_count(), 2);
    let second = writer.write(retry).await;

    assert!(second.is_complete());
    assert_eq!(store.row_count(&RecordKind::from("blocks")), 2);
    assert_eq!(store.row_count(&RecordKind::from("transactions")), 2);
    // blocks were applied once, in the first flush only
    assert_eq!(store.upsert_calls(&RecordKind::from("blocks")), 1);
    assert_eq!(store.rows_written(), 4);
}

#[tokio::test]
async fn test_written_record_round_trips() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = ExportPipeline::spawn(
        pipeline_config(),
        store.clone(),
        Arc::new(PerformanceRecorder::default()),
    )
    .await
    .unwrap();
    let handle = pipeline.handle();

    let original = transaction(7, 3, json!({"from": "0xabc", "gas": 21000, "input": null}));
    handle.submit(original.clone()).await.unwrap();
    pipeline.shutdown().await.unwrap();

    let fetched = store
        .fetch(original.kind(), original.key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&fetched, original.payload());
}

#[tokio::test]
async fn test_concurrent_producers_lose_nothing() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = ExportPipeline::spawn(
        ExportConfig {
            max_buffered_records: 64,
            channel_capacity: 16,
            ..pipeline_config()
        },
        store.clone(),
        Arc::new(PerformanceRecorder::default()),
    )
    .await
    .unwrap();

    let producers: Vec<_> = (0..4u64)
        .map(|p| {
            let handle = pipeline.handle();
            tokio::spawn(async move {
                for n in 0..250u64 {
                    handle
                        .submit(transaction(p, n, json!(n)))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let report = pipeline.shutdown().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.stats.submitted_records, 1_000);
    assert_eq!(report.stats.committed_rows, 1_000);
    assert!(report.stats.flushes >= 15);
    assert_eq!(store.row_count(&RecordKind::from("transactions")), 1_000);
}

#[tokio::test]
async fn test_failure_log_replay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("failed.jsonl");

    let broken = Arc::new(MemoryStore::new());
    broken.inject_failure("blocks", StoreError::conflict("relation \"blocks\" does not exist"), 1);
    let pipeline = ExportPipeline::spawn(
        ExportConfig {
            failure_log_path: Some(path.clone()),
            ..pipeline_config()
        },
        broken.clone(),
        Arc::new(PerformanceRecorder::default()),
    )
    .await
    .unwrap();
    pipeline
        .handle()
        .submit_many(vec![block(1, "0x01"), block(2, "0x02")])
        .await
        .unwrap();
    let report = pipeline.shutdown().await.unwrap();
    assert_eq!(report.stats.dead_lettered_records, 2);
    assert_eq!(broken.row_count(&RecordKind::from("blocks")), 0);

    // replay into a healthy store
    let healthy = Arc::new(MemoryStore::new());
    let pipeline = ExportPipeline::spawn(
        pipeline_config(),
        healthy.clone(),
        Arc::new(PerformanceRecorder::default()),
    )
    .await
    .unwrap();
    let handle = pipeline.handle();
    for entry in FailureLog::read_all(&path).await.unwrap() {
        handle.submit_many(entry.records).await.unwrap();
    }
    let report = pipeline.shutdown().await.unwrap();

    assert!(report.is_clean());
    assert_eq!(healthy.row_count(&RecordKind::from("blocks")), 2);
}

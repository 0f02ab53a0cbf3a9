//! Checkpoint Integration Tests
//!
//! Tests that an ingestion killed mid-run resumes from its last checkpoint
//! and ends in the same state as an uninterrupted run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use carecrew::core::{
    CheckpointStore, Context, FileCheckpointStore, ResumableOperation, SqliteCheckpointStore,
    TaskError, TaskRunner,
};
use carecrew::domain::{CheckpointRecord, Cursor, TaskStatus};
use carecrew::tasks::{BatchSink, IngestTask, JsonlSink};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Writes like `JsonlSink` until the `fail_on`-th write, which dies
struct DyingSink {
    writes: AtomicU32,
    fail_on: u32,
}

#[async_trait]
impl BatchSink for DyingSink {
    async fn write_batch(&self, target: &str, rows: &[Value]) -> Result<(), TaskError> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on {
            return Err(TaskError::fatal("process killed"));
        }
        JsonlSink.write_batch(target, rows).await
    }
}

fn write_source(dir: &Path, rows: usize) -> PathBuf {
    let path = dir.join("source.jsonl");
    let body: Vec<String> = (0..rows)
        .map(|i| json!({ "stay_id": i, "subject_id": 1000 + i }).to_string())
        .collect();
    std::fs::write(&path, body.join("\n")).unwrap();
    path
}

fn context(source: &Path, target: &Path) -> Context {
    let mut ctx = Context::new();
    ctx.insert("source_file".into(), json!(source.to_string_lossy()));
    ctx.insert("target_file".into(), json!(target.to_string_lossy()));
    ctx.insert("batch_size".into(), json!(3));
    ctx.insert("operation_id".into(), json!("ingest:icustays"));
    ctx
}

#[tokio::test]
async fn test_resume_after_kill_matches_uninterrupted_run() {
    let temp = TempDir::new().unwrap();
    let source = write_source(temp.path(), 10);
    let checkpoints = temp.path().join("checkpoints");

    // Uninterrupted reference run
    let reference_target = temp.path().join("reference.jsonl");
    let store: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::open(temp.path().join("reference-checkpoints")).unwrap());
    let mut reference = TaskRunner::new(IngestTask::new(store, Arc::new(JsonlSink)));
    let expected = reference.run(&context(&source, &reference_target)).await;
    assert!(expected.is_success());

    // First attempt dies on the third batch write
    let target = temp.path().join("target.jsonl");
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::open(&checkpoints).unwrap());
    let sink = Arc::new(DyingSink {
        writes: AtomicU32::new(0),
        fail_on: 3,
    });
    let mut first = TaskRunner::new(IngestTask::new(store, sink));
    let failed = first.run(&context(&source, &target)).await;

    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.errors, vec!["process killed".to_string()]);

    // A fresh store over the same directory sees the last checkpoint
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::open(&checkpoints).unwrap());
    let saved = store.load("ingest:icustays").await.unwrap().unwrap();
    assert_eq!(saved.cursor, Cursor::Offset(6));
    assert_eq!(saved.extra.get("rows_ingested"), Some(&json!(6)));

    // Restart
    let mut second = TaskRunner::new(IngestTask::new(Arc::clone(&store), Arc::new(JsonlSink)));
    let resumed = second.run(&context(&source, &target)).await;
    assert!(resumed.is_success());

    let output = resumed.output.as_ref().unwrap();
    assert_eq!(output["resumed_from"], json!(6));
    assert_eq!(output["rows_ingested"], json!(10));
    assert_eq!(resumed.metrics, expected.metrics);

    let written = std::fs::read_to_string(&target).unwrap();
    let reference_written = std::fs::read_to_string(&reference_target).unwrap();
    assert_eq!(written, reference_written);

    // Completion removes the checkpoint
    assert!(store.load("ingest:icustays").await.unwrap().is_none());
}

#[tokio::test]
async fn test_sqlite_checkpoint_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("state/checkpoints.db");

    {
        let store = SqliteCheckpointStore::open(&db).unwrap();
        store
            .save(&CheckpointRecord::new("export:vitals", Cursor::Token("page-7".into())))
            .await
            .unwrap();
    }

    let store = SqliteCheckpointStore::open(&db).unwrap();
    let record = store.load("export:vitals").await.unwrap().unwrap();
    assert_eq!(record.cursor, Cursor::Token("page-7".into()));
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_resumable_operation_lifecycle() {
    let temp = TempDir::new().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::open(temp.path()).unwrap());

    let op = ResumableOperation::begin(Arc::clone(&store), "train:sepsis").await.unwrap();
    assert!(op.resumed_from().is_none());
    assert_eq!(op.start_offset(), 0);

    op.checkpoint(Cursor::Offset(40), Default::default()).await.unwrap();
    op.checkpoint(Cursor::Offset(80), Default::default()).await.unwrap();
    drop(op);

    // Exactly one active record per operation
    let records = store.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].cursor, Cursor::Offset(80));

    let op = ResumableOperation::begin(Arc::clone(&store), "train:sepsis").await.unwrap();
    assert_eq!(op.start_offset(), 80);
    op.complete().await.unwrap();

    assert!(store.list().await.unwrap().is_empty());
}

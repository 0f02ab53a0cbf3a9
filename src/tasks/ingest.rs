//! Resumable batch ingestion.
//!
//! Copies a JSONL source into a `BatchSink` in fixed-size batches. After
//! each batch is written the number of source rows consumed is saved as
//! an offset checkpoint, together with the running totals, so a killed run
//! restarts after the last written batch and reports the same totals an
//! uninterrupted run would. The checkpoint is deleted once the source is
//! exhausted.
//!
//! Delivery is at-least-once per batch: a kill between a sink write and
//! its checkpoint replays that one batch.
//!
//! Context keys:
//! - `source_file` (required): JSONL file to read
//! - `target_file` (required): sink target, a path for `JsonlSink`
//! - `batch_size` (optional, default 10000)
//! - `operation_id` (optional): checkpoint key, defaults to
//!   `ingest:<source_file>:<target_file>`

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, instrument, warn};

use crate::core::{
    CheckpointStore, CircuitBreaker, Context, ResumableOperation, RetryPolicy, Task, TaskError,
};
use crate::domain::{Cursor, TaskOutput, ValidationResult};

use super::context_str;

/// Default rows per batch
pub const DEFAULT_BATCH_SIZE: u64 = 10_000;

/// Destination of ingested rows (the external store)
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Write one batch to `target`
    async fn write_batch(&self, target: &str, rows: &[Value]) -> Result<(), TaskError>;
}

/// Appends rows to a JSONL file
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonlSink;

#[async_trait]
impl BatchSink for JsonlSink {
    async fn write_batch(&self, target: &str, rows: &[Value]) -> Result<(), TaskError> {
        let path = Path::new(target);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut buf = String::new();
        for row in rows {
            buf.push_str(&serde_json::to_string(row)?);
            buf.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Running totals, persisted with every checkpoint
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Progress {
    /// Non-empty source rows consumed so far (the resume offset)
    consumed: u64,
    ingested: u64,
    skipped: u64,
    batches: u64,
}

impl Progress {
    fn resume(operation: &ResumableOperation) -> Self {
        let extra = |key: &str| {
            operation
                .resumed_extra(key)
                .and_then(Value::as_u64)
                .unwrap_or(0)
        };
        Self {
            consumed: operation.start_offset(),
            ingested: extra("rows_ingested"),
            skipped: extra("rows_skipped"),
            batches: extra("batches"),
        }
    }

    fn extra(&self) -> HashMap<String, Value> {
        HashMap::from([
            ("rows_ingested".to_string(), json!(self.ingested)),
            ("rows_skipped".to_string(), json!(self.skipped)),
            ("batches".to_string(), json!(self.batches)),
        ])
    }
}

/// Batch copy from a JSONL source into a sink, resumable via checkpoints
pub struct IngestTask {
    name: String,
    sink: Arc<dyn BatchSink>,
    store: Arc<dyn CheckpointStore>,
    retry: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl IngestTask {
    pub fn new(store: Arc<dyn CheckpointStore>, sink: Arc<dyn BatchSink>) -> Self {
        Self {
            name: "ingest".to_string(),
            sink,
            store,
            retry: RetryPolicy::default(),
            breaker: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Retry policy around each sink write
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Breaker around the retried sink write; it counts batches whose
    /// retries ran out, not individual attempts
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    fn batch_size(context: &Context) -> u64 {
        context
            .get("batch_size")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_BATCH_SIZE)
    }

    fn operation_id(context: &Context, source: &str, target: &str) -> String {
        context_str(context, "operation_id")
            .map(str::to_string)
            .unwrap_or_else(|| format!("ingest:{}:{}", source, target))
    }

    /// One sink write: the breaker sees a single call per batch, made of
    /// however many attempts the retry policy needed
    async fn write_guarded(&self, target: &str, rows: &[Value]) -> Result<(), TaskError> {
        let sink = &self.sink;
        let retried = || self.retry.execute(move || sink.write_batch(target, rows));
        match &self.breaker {
            Some(breaker) => breaker.call(retried).await,
            None => retried().await,
        }
    }

    /// Write a pending batch and checkpoint past it
    async fn flush(
        &self,
        operation: &ResumableOperation,
        target: &str,
        batch: &mut Vec<Value>,
        progress: &mut Progress,
        position: u64,
        pending_skipped: &mut u64,
    ) -> Result<(), TaskError> {
        if !batch.is_empty() {
            self.write_guarded(target, batch).await?;
            progress.ingested += batch.len() as u64;
            progress.batches += 1;
        }
        progress.skipped += *pending_skipped;
        progress.consumed = position;

        operation
            .checkpoint(Cursor::Offset(position), progress.extra())
            .await?;

        info!(
            batch = progress.batches,
            rows = batch.len(),
            consumed = position,
            "Batch ingested"
        );

        batch.clear();
        *pending_skipped = 0;
        Ok(())
    }
}

#[async_trait]
impl Task for IngestTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, context: &Context) -> ValidationResult {
        let mut errors = Vec::new();

        match context_str(context, "source_file") {
            None => errors.push("Missing required field: source_file".to_string()),
            Some(source) if !Path::new(source).exists() => {
                errors.push(format!("Source file does not exist: {}", source))
            }
            Some(_) => {}
        }

        if context_str(context, "target_file").is_none() {
            errors.push("Missing required field: target_file".to_string());
        }

        if let Some(size) = context.get("batch_size") {
            if size.as_u64().map_or(true, |n| n == 0) {
                errors.push(format!("batch_size must be a positive integer, got {}", size));
            }
        }

        ValidationResult::from_errors(errors)
    }

    #[instrument(skip(self, context), fields(task = %self.name))]
    async fn run(&self, context: &Context) -> Result<TaskOutput, TaskError> {
        let source = context_str(context, "source_file")
            .ok_or_else(|| TaskError::fatal("Missing required field: source_file"))?;
        let target = context_str(context, "target_file")
            .ok_or_else(|| TaskError::fatal("Missing required field: target_file"))?;
        let batch_size = Self::batch_size(context);

        let operation = ResumableOperation::begin(
            Arc::clone(&self.store),
            Self::operation_id(context, source, target),
        )
        .await?;

        let mut progress = Progress::resume(&operation);
        let resumed_from = operation.resumed_from().map(|_| progress.consumed);
        let start = progress.consumed;

        info!(%source, %target, batch_size, start, "Starting ingestion");

        let mut lines = BufReader::new(File::open(source).await?).lines();
        let mut position = 0u64;
        let mut batch = Vec::new();
        let mut pending_skipped = 0u64;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            position += 1;
            if position <= start {
                continue;
            }

            match serde_json::from_str::<Value>(&line) {
                Ok(row) => batch.push(row),
                Err(e) => {
                    warn!(row = position, error = %e, "Skipping malformed row");
                    pending_skipped += 1;
                }
            }

            if batch.len() as u64 + pending_skipped >= batch_size {
                self.flush(
                    &operation,
                    target,
                    &mut batch,
                    &mut progress,
                    position,
                    &mut pending_skipped,
                )
                .await?;
            }
        }

        if !batch.is_empty() || pending_skipped > 0 {
            self.flush(
                &operation,
                target,
                &mut batch,
                &mut progress,
                position,
                &mut pending_skipped,
            )
            .await?;
        }

        operation.complete().await?;

        let total = progress.ingested + progress.skipped;
        let success_rate = if total > 0 {
            progress.ingested as f64 / total as f64
        } else {
            0.0
        };

        info!(
            rows_ingested = progress.ingested,
            rows_skipped = progress.skipped,
            batches = progress.batches,
            "Ingestion complete"
        );

        Ok(TaskOutput::new(json!({
            "source_file": source,
            "target_file": target,
            "rows_ingested": progress.ingested,
            "rows_skipped": progress.skipped,
            "total_rows": total,
            "success_rate": success_rate,
            "resumed_from": resumed_from,
        }))
        .with_metric("rows_ingested", progress.ingested)
        .with_metric("rows_skipped", progress.skipped)
        .with_metric("batches", progress.batches)
        .with_metric("success_rate", success_rate))
    }
}

//! Built-in tasks for data pipelines.
//!
//! - `IngestTask`: resumable batch copy of a JSONL dataset into a sink
//! - `QualityCheckTask`: completeness and uniqueness scoring of a dataset

pub mod ingest;
pub mod quality;

use std::path::Path;

use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::core::{Context, TaskError};

pub use ingest::{BatchSink, IngestTask, JsonlSink};
pub use quality::{QualityCheckTask, QualityReport};

/// String entry of the task context
pub(crate) fn context_str<'a>(context: &'a Context, key: &str) -> Option<&'a str> {
    context.get(key).and_then(Value::as_str)
}

/// Read every non-empty line of a JSONL file as a JSON value
pub(crate) async fn read_jsonl(path: &Path) -> Result<Vec<Value>, TaskError> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut rows = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        rows.push(serde_json::from_str(&line)?);
    }

    Ok(rows)
}

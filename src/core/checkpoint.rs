//! Durable resume cursors for long batch operations.
//!
//! A resumable operation loads its checkpoint on start, saves a new one
//! after each unit of progress (overwriting the previous record in place)
//! and deletes it once the operation completes. A checkpoint that survives
//! a successful run is a bug.
//!
//! Backends:
//! - `FileCheckpointStore`: one JSON document per operation, replaced
//!   atomically (temp file + rename) under an exclusive `fs2` lock
//! - `SqliteCheckpointStore`: one row per operation
//! - `MemoryCheckpointStore`: for tests and ephemeral runs

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{CheckpointRecord, Cursor};

use super::error::TaskError;

/// Errors raised by checkpoint backends
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to replace checkpoint file: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Checkpoint worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Invalid saved_at timestamp '{value}' for {operation_id}: {source}")]
    InvalidTimestamp {
        operation_id: String,
        value: String,
        source: chrono::ParseError,
    },
}

impl From<CheckpointError> for TaskError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Io(e) => TaskError::from(e),
            other => TaskError::fatal(format!("Checkpoint store failed: {}", other)),
        }
    }
}

/// Key -> state store backing resumable operations
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert or overwrite the record for `record.operation_id`
    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError>;

    async fn load(&self, operation_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError>;

    /// Remove the record; deleting a missing record is not an error
    async fn delete(&self, operation_id: &str) -> Result<(), CheckpointError>;

    /// All active records
    async fn list(&self) -> Result<Vec<CheckpointRecord>, CheckpointError>;
}

/// Which backend to build from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackend {
    #[default]
    File,
    Sqlite,
}

/// Drives one resumable operation against a store
pub struct ResumableOperation {
    store: Arc<dyn CheckpointStore>,
    operation_id: String,
    resumed_from: Option<CheckpointRecord>,
}

impl ResumableOperation {
    /// Load any existing checkpoint for `operation_id`
    pub async fn begin(
        store: Arc<dyn CheckpointStore>,
        operation_id: impl Into<String>,
    ) -> Result<Self, CheckpointError> {
        let operation_id = operation_id.into();
        let resumed_from = store.load(&operation_id).await?;

        match &resumed_from {
            Some(record) => info!(
                operation = %operation_id,
                cursor = %record.cursor,
                saved_at = %record.saved_at,
                "Resuming from checkpoint"
            ),
            None => debug!(operation = %operation_id, "No checkpoint, starting fresh"),
        }

        Ok(Self {
            store,
            operation_id,
            resumed_from,
        })
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// The checkpoint this run resumed from, if any
    pub fn resumed_from(&self) -> Option<&CheckpointRecord> {
        self.resumed_from.as_ref()
    }

    /// Numeric resume point (0 when starting fresh)
    pub fn start_offset(&self) -> u64 {
        self.resumed_from
            .as_ref()
            .and_then(|r| r.cursor.as_offset())
            .unwrap_or(0)
    }

    /// Extra state saved alongside the resume cursor
    pub fn resumed_extra(&self, key: &str) -> Option<&Value> {
        self.resumed_from.as_ref().and_then(|r| r.extra.get(key))
    }

    /// Persist progress
    pub async fn checkpoint(
        &self,
        cursor: Cursor,
        extra: HashMap<String, Value>,
    ) -> Result<(), CheckpointError> {
        let mut record = CheckpointRecord::new(self.operation_id.clone(), cursor);
        record.extra = extra;
        self.store.save(&record).await?;
        debug!(operation = %self.operation_id, cursor = %record.cursor, "Checkpoint saved");
        Ok(())
    }

    /// Mark the operation finished and drop its checkpoint
    pub async fn complete(self) -> Result<(), CheckpointError> {
        self.store.delete(&self.operation_id).await?;
        info!(operation = %self.operation_id, "Operation complete, checkpoint removed");
        Ok(())
    }
}

// ============================================================================
// File backend
// ============================================================================

/// One `<hash>.json` file per operation inside a directory
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a checkpoint directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing a given operation
    pub fn record_path(&self, operation_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", hash_operation_id(operation_id)))
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(".lock")
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce(&Path, File) -> Result<T, CheckpointError> + Send + 'static,
    {
        let dir = self.dir.clone();
        let lock_path = self.lock_path();
        tokio::task::spawn_blocking(move || {
            let lock = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            f(&dir, lock)
        })
        .await?
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let path = self.record_path(&record.operation_id);
        let json = serde_json::to_vec_pretty(record)?;

        self.blocking(move |dir, lock| {
            lock.lock_exclusive()?;
            let mut tmp = NamedTempFile::new_in(dir)?;
            tmp.write_all(&json)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path)?;
            Ok(())
            // Lock is released when `lock` is dropped
        })
        .await
    }

    async fn load(&self, operation_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let path = self.record_path(operation_id);
        let operation_id = operation_id.to_string();

        self.blocking(move |_, lock| {
            lock.lock_shared()?;
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            let record: CheckpointRecord = serde_json::from_slice(&bytes)?;
            if record.operation_id != operation_id {
                warn!(
                    requested = %operation_id,
                    stored = %record.operation_id,
                    "Checkpoint file belongs to another operation, ignoring"
                );
                return Ok(None);
            }
            Ok(Some(record))
        })
        .await
    }

    async fn delete(&self, operation_id: &str) -> Result<(), CheckpointError> {
        let path = self.record_path(operation_id);

        self.blocking(move |_, lock| {
            lock.lock_exclusive()?;
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn list(&self) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        self.blocking(|dir, lock| {
            lock.lock_shared()?;
            let mut records = Vec::new();
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let bytes = fs::read(&path)?;
                records.push(serde_json::from_slice::<CheckpointRecord>(&bytes)?);
            }
            records.sort_by(|a, b| a.operation_id.cmp(&b.operation_id));
            Ok(records)
        })
        .await
    }
}

/// Filesystem-safe key for an operation id (hex SHA256)
pub fn hash_operation_id(operation_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation_id.as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// SQLite backend
// ============================================================================

/// One row per operation in a `checkpoints` table
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CheckpointError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                operation_id TEXT PRIMARY KEY,
                cursor       TEXT NOT NULL,
                saved_at     TEXT NOT NULL,
                extra        TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, CheckpointError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&conn)
        })
        .await?
    }
}

type SqliteRow = (String, String, String, String);

fn row_to_record(row: SqliteRow) -> Result<CheckpointRecord, CheckpointError> {
    let (operation_id, cursor, saved_at, extra) = row;
    let saved_at = match DateTime::parse_from_rfc3339(&saved_at) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(source) => {
            return Err(CheckpointError::InvalidTimestamp {
                operation_id,
                value: saved_at,
                source,
            })
        }
    };

    Ok(CheckpointRecord {
        operation_id,
        cursor: serde_json::from_str(&cursor)?,
        saved_at,
        extra: serde_json::from_str(&extra)?,
    })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let operation_id = record.operation_id.clone();
        let cursor = serde_json::to_string(&record.cursor)?;
        let saved_at = record.saved_at.to_rfc3339();
        let extra = serde_json::to_string(&record.extra)?;

        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO checkpoints (operation_id, cursor, saved_at, extra)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(operation_id) DO UPDATE SET
                    cursor = excluded.cursor,
                    saved_at = excluded.saved_at,
                    extra = excluded.extra",
                params![operation_id, cursor, saved_at, extra],
            )?;
            Ok(())
        })
        .await
    }

    async fn load(&self, operation_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let operation_id = operation_id.to_string();

        self.blocking(move |conn| {
            let row: Option<SqliteRow> = conn
                .query_row(
                    "SELECT operation_id, cursor, saved_at, extra
                     FROM checkpoints WHERE operation_id = ?1",
                    params![operation_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            row.map(row_to_record).transpose()
        })
        .await
    }

    async fn delete(&self, operation_id: &str) -> Result<(), CheckpointError> {
        let operation_id = operation_id.to_string();

        self.blocking(move |conn| {
            conn.execute(
                "DELETE FROM checkpoints WHERE operation_id = ?1",
                params![operation_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT operation_id, cursor, saved_at, extra
                 FROM checkpoints ORDER BY operation_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row_to_record(row?)?);
            }
            Ok(records)
        })
        .await
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<String, CheckpointRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, CheckpointRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        self.records()
            .insert(record.operation_id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, operation_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Ok(self.records().get(operation_id).cloned())
    }

    async fn delete(&self, operation_id: &str) -> Result<(), CheckpointError> {
        self.records().remove(operation_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let mut records: Vec<_> = self.records().values().cloned().collect();
        records.sort_by(|a, b| a.operation_id.cmp(&b.operation_id));
        Ok(records)
    }
}

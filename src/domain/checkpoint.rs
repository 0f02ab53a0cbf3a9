//! Checkpoint records for resumable batch operations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resume position of an operation: a row offset or an opaque token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cursor {
    Offset(u64),
    Token(String),
}

impl Cursor {
    /// Offset value, if this is a numeric cursor
    pub fn as_offset(&self) -> Option<u64> {
        match self {
            Self::Offset(n) => Some(*n),
            Self::Token(_) => None,
        }
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offset(n) => write!(f, "{}", n),
            Self::Token(t) => f.write_str(t),
        }
    }
}

/// One active checkpoint per in-flight resumable operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub operation_id: String,

    pub cursor: Cursor,

    pub saved_at: DateTime<Utc>,

    /// Operation-specific state (e.g. running totals)
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl CheckpointRecord {
    pub fn new(operation_id: impl Into<String>, cursor: Cursor) -> Self {
        Self {
            operation_id: operation_id.into(),
            cursor,
            saved_at: Utc::now(),
            extra: HashMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

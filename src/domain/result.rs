//! Outcome records for task validation and execution.
//!
//! Both records are created once and never mutated afterwards: a
//! `ValidationResult` per `Task::validate` call, an `ExecutionResult` per
//! `TaskRunner::run` call.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a task runner and of a single execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Never run, or reset
    Idle,

    /// Currently executing
    Running,

    /// Completed successfully
    Success,

    /// Validation or execution failed
    Failed,

    /// Suspended (e.g. waiting on a human)
    Paused,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// Result of validating a task's input context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    /// A passing validation
    pub fn success() -> Self {
        Self {
            ok: true,
            errors: Vec::new(),
        }
    }

    /// A failing validation with the given messages
    pub fn failure<I, S>(errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ok: false,
            errors: errors.into_iter().map(Into::into).collect(),
        }
    }

    /// Build from collected errors: passes only when `errors` is empty
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            ok: errors.is_empty(),
            errors,
        }
    }
}

/// What a task hands back on success.
///
/// The core never inspects `value`; `metrics` are copied onto the
/// `ExecutionResult` so steering rules can read them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub value: Value,
    pub metrics: HashMap<String, Value>,
}

impl TaskOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            metrics: HashMap::new(),
        }
    }

    /// Attach a metric
    pub fn with_metric(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }
}

impl From<Value> for TaskOutput {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// Immutable record of one task invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: TaskStatus,

    /// Task output (success only)
    pub output: Option<Value>,

    /// Validation or execution errors (failure only)
    pub errors: Vec<String>,

    pub metrics: HashMap<String, Value>,

    pub metadata: HashMap<String, Value>,

    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    /// A successful execution carrying the task's output
    pub fn success(output: TaskOutput) -> Self {
        Self {
            status: TaskStatus::Success,
            output: Some(output.value),
            errors: Vec::new(),
            metrics: output.metrics,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// A failed execution
    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            output: None,
            errors,
            metrics: HashMap::new(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach a metadata entry (builder, used before the result is published)
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    /// Numeric metrics only, as consumed by the decision engine
    pub fn numeric_metrics(&self) -> HashMap<String, f64> {
        self.metrics
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validation_from_errors() {
        assert!(ValidationResult::from_errors(vec![]).ok);

        let failed = ValidationResult::from_errors(vec!["missing source_file".to_string()]);
        assert!(!failed.ok);
        assert_eq!(failed.errors.len(), 1);
    }

    #[test]
    fn test_success_carries_output_and_metrics() {
        let output = TaskOutput::new(json!({"rows": 10})).with_metric("rows_ingested", 10);
        let result = ExecutionResult::success(output);

        assert!(result.is_success());
        assert_eq!(result.output, Some(json!({"rows": 10})));
        assert_eq!(result.metrics.get("rows_ingested"), Some(&json!(10)));
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_numeric_metrics_skips_non_numbers() {
        let output = TaskOutput::new(Value::Null)
            .with_metric("score", 0.93)
            .with_metric("table", "raw.icustays");
        let metrics = ExecutionResult::success(output).numeric_metrics();

        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics.get("score"), Some(&0.93));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::Success).unwrap();
        assert_eq!(json, "\"success\"");
        assert_eq!(TaskStatus::Failed.to_string(), "failed");
    }
}

//! Task contract and the runner that wraps it.
//!
//! A `Task` is a unit of work supplied by the surrounding application.
//! The `TaskRunner` adds validation, failure capture, status tracking and
//! an append-only execution history. Nothing escapes `TaskRunner::run`:
//! errors and panics alike become a Failed `ExecutionResult`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};

use crate::domain::{ExecutionResult, TaskOutput, TaskStatus, ValidationResult};

use super::error::TaskError;

/// Opaque key/value input handed to tasks; the core never interprets it
pub type Context = Map<String, Value>;

/// A unit of work
#[async_trait]
pub trait Task: Send + Sync {
    /// Unique name within a crew
    fn name(&self) -> &str;

    /// Check the context before any side effects happen
    fn validate(&self, context: &Context) -> ValidationResult;

    /// Do the work
    async fn run(&self, context: &Context) -> Result<TaskOutput, TaskError>;
}

/// Wraps a task with validation, status and history
pub struct TaskRunner {
    task: Arc<dyn Task>,
    status: TaskStatus,
    history: Vec<ExecutionResult>,
}

impl TaskRunner {
    pub fn new<T: Task + 'static>(task: T) -> Self {
        Self::from_arc(Arc::new(task))
    }

    /// Wrap a task that is shared with other runners
    pub fn from_arc(task: Arc<dyn Task>) -> Self {
        Self {
            task,
            status: TaskStatus::Idle,
            history: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    /// Status of the most recent run (Idle if never run or reset)
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn history(&self) -> &[ExecutionResult] {
        &self.history
    }

    pub fn last_result(&self) -> Option<&ExecutionResult> {
        self.history.last()
    }

    /// Validate, then execute the task
    #[instrument(skip(self, context), fields(task = %self.task.name()))]
    pub async fn run(&mut self, context: &Context) -> ExecutionResult {
        self.status = TaskStatus::Running;
        let started = Instant::now();

        let validation = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.task.validate(context)
        })) {
            Ok(validation) => validation,
            Err(panic) => ValidationResult::failure([format!(
                "Validation panicked: {}",
                panic_message(panic.as_ref())
            )]),
        };

        if !validation.ok {
            error!(errors = ?validation.errors, "Input validation failed");
            let result = ExecutionResult::failure(validation.errors)
                .with_metadata("task", self.task.name())
                .with_metadata("stage", "validation");
            return self.record(result);
        }

        info!("Executing task");
        let outcome = AssertUnwindSafe(self.task.run(context))
            .catch_unwind()
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(output)) => {
                info!(duration_ms, "Task completed successfully");
                ExecutionResult::success(output)
            }
            Ok(Err(e)) => {
                error!(error = %e, kind = e.kind(), duration_ms, "Task failed");
                ExecutionResult::failure(vec![e.to_string()]).with_metadata("error_kind", e.kind())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(%message, duration_ms, "Task panicked");
                ExecutionResult::failure(vec![format!("Task panicked: {}", message)])
                    .with_metadata("error_kind", "panic")
            }
        };

        let result = result
            .with_metadata("task", self.task.name())
            .with_metadata("duration_ms", duration_ms);
        self.record(result)
    }

    /// Back to Idle with an empty history; external effects are untouched
    pub fn reset(&mut self) {
        self.status = TaskStatus::Idle;
        self.history.clear();
        info!(task = %self.task.name(), "Runner reset");
    }

    fn record(&mut self, result: ExecutionResult) -> ExecutionResult {
        self.status = result.status;
        self.history.push(result.clone());
        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! Crew orchestration.
//!
//! A `Crew` runs its task runners strictly in declared order and stops at
//! the first failure. Each stage that completes publishes
//! `crew.<crew>.<task>.completed` (or `.failed`) and the run as a whole
//! publishes `crew.<crew>.completed` / `crew.<crew>.failed`, so crews in
//! other parts of the system can chain off each other via `CrewTrigger`.
//!
//! Downstream tasks see the kickoff context plus the output value of each
//! earlier stage under the stage's task name.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::domain::{Event, ExecutionResult};

use super::event_bus::{EventBus, EventHandler};
use super::task::{Context, Task, TaskRunner};

/// Overall crew outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrewStatus {
    Success,
    Failed,
}

impl fmt::Display for CrewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Structured result of `Crew::kickoff`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrewOutcome {
    pub status: CrewStatus,

    /// One entry per task that ran, keyed by task name
    pub results: HashMap<String, ExecutionResult>,

    /// Names of the tasks that ran, in execution order
    pub order: Vec<String>,

    /// Task that stopped the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
}

impl CrewOutcome {
    pub fn is_success(&self) -> bool {
        self.status == CrewStatus::Success
    }

    /// Result of the last task that ran
    pub fn last(&self) -> Option<&ExecutionResult> {
        self.order.last().and_then(|name| self.results.get(name))
    }
}

/// Sequential, fail-fast group of task runners
pub struct Crew {
    name: String,
    runners: Vec<TaskRunner>,
    bus: Option<EventBus>,
}

impl Crew {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runners: Vec::new(),
            bus: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a task; execution order is insertion order
    pub fn add_task<T: Task + 'static>(&mut self, task: T) {
        self.runners.push(TaskRunner::new(task));
    }

    pub fn with_task<T: Task + 'static>(mut self, task: T) -> Self {
        self.add_task(task);
        self
    }

    pub fn with_runner(mut self, runner: TaskRunner) -> Self {
        self.runners.push(runner);
        self
    }

    /// Publish stage events on `bus`
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn runners(&self) -> &[TaskRunner] {
        &self.runners
    }

    /// Check the crew definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Crew name cannot be empty");
        }
        if self.runners.is_empty() {
            anyhow::bail!("Crew '{}' must have at least one task", self.name);
        }

        let mut seen = HashSet::new();
        for runner in &self.runners {
            if !seen.insert(runner.name()) {
                anyhow::bail!(
                    "Duplicate task name '{}' in crew '{}'",
                    runner.name(),
                    self.name
                );
            }
        }

        Ok(())
    }

    /// Run every task in order, stopping at the first failure
    #[instrument(skip(self, context), fields(crew = %self.name))]
    pub async fn kickoff(&mut self, context: &Context) -> CrewOutcome {
        info!(tasks = self.runners.len(), "Crew kickoff");

        let mut results = HashMap::new();
        let mut order = Vec::new();
        let mut failed_at = None;
        let mut stage_context = context.clone();

        for runner in &mut self.runners {
            let task_name = runner.name().to_string();
            let result = runner.run(&stage_context).await;

            let succeeded = result.is_success();
            publish_stage(&self.bus, &self.name, &task_name, &result);

            if succeeded {
                stage_context.insert(
                    task_name.clone(),
                    result.output.clone().unwrap_or(Value::Null),
                );
            }

            order.push(task_name.clone());
            results.insert(task_name.clone(), result);

            if !succeeded {
                error!(task = %task_name, "Task failed, aborting crew");
                failed_at = Some(task_name);
                break;
            }
        }

        let status = if failed_at.is_some() {
            CrewStatus::Failed
        } else {
            CrewStatus::Success
        };

        info!(%status, completed = order.len(), "Crew finished");

        let outcome = CrewOutcome {
            status,
            results,
            order,
            failed_at,
        };
        publish_crew(&self.bus, &self.name, &outcome);
        outcome
    }

    /// Reset every runner
    pub fn reset(&mut self) {
        for runner in &mut self.runners {
            runner.reset();
        }
    }
}

fn publish_stage(bus: &Option<EventBus>, crew: &str, task: &str, result: &ExecutionResult) {
    let Some(bus) = bus else {
        return;
    };

    let suffix = if result.is_success() { "completed" } else { "failed" };
    let mut payload = Map::new();
    payload.insert("crew".into(), json!(crew));
    payload.insert("task".into(), json!(task));
    payload.insert("status".into(), json!(result.status));
    payload.insert("metrics".into(), json!(result.metrics));
    if let Some(output) = &result.output {
        payload.insert("output".into(), output.clone());
    }
    if !result.errors.is_empty() {
        payload.insert("errors".into(), json!(result.errors));
    }

    let event_type = format!("crew.{}.{}.{}", crew, task, suffix);
    if let Err(e) = bus.publish(event_type.as_str(), payload) {
        warn!(error = %e, %event_type, "Failed to publish stage event");
    }
}

fn publish_crew(bus: &Option<EventBus>, crew: &str, outcome: &CrewOutcome) {
    let Some(bus) = bus else {
        return;
    };

    let suffix = if outcome.is_success() { "completed" } else { "failed" };
    let mut payload = Map::new();
    payload.insert("crew".into(), json!(crew));
    payload.insert("status".into(), json!(outcome.status));
    payload.insert("order".into(), json!(outcome.order));
    if let Some(failed_at) = &outcome.failed_at {
        payload.insert("failed_at".into(), json!(failed_at));
    }
    if let Some(output) = outcome.last().and_then(|r| r.output.as_ref()) {
        payload.insert("output".into(), output.clone());
    }

    let event_type = format!("crew.{}.{}", crew, suffix);
    if let Err(e) = bus.publish(event_type.as_str(), payload) {
        warn!(error = %e, %event_type, "Failed to publish crew event");
    }
}

/// Event handler that kicks off a crew with the event payload as context.
///
/// Kickoffs through one trigger are serialized by the crew lock.
pub struct CrewTrigger {
    crew: Arc<Mutex<Crew>>,
    outcomes: Option<tokio::sync::mpsc::UnboundedSender<CrewOutcome>>,
}

impl CrewTrigger {
    pub fn new(crew: Arc<Mutex<Crew>>) -> Self {
        Self {
            crew,
            outcomes: None,
        }
    }

    /// Forward every outcome to `tx`
    pub fn with_outcomes(mut self, tx: tokio::sync::mpsc::UnboundedSender<CrewOutcome>) -> Self {
        self.outcomes = Some(tx);
        self
    }
}

#[async_trait]
impl EventHandler for CrewTrigger {
    async fn handle(&self, event: &Event) -> Result<()> {
        let mut context = event.payload.clone();
        context.insert("trigger_event".into(), json!(event.event_type));

        let outcome = {
            let mut crew = self.crew.lock().await;
            info!(crew = %crew.name(), trigger = %event.event_type, "Crew triggered by event");
            crew.kickoff(&context).await
        };

        let failed = outcome.failed_at.clone();
        if let Some(tx) = &self.outcomes {
            let _ = tx.send(outcome);
        }

        match failed {
            Some(task) => anyhow::bail!("Triggered crew failed at task '{}'", task),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::TaskError;
    use crate::domain::{TaskOutput, ValidationResult};

    struct Stage {
        name: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Task for Stage {
        fn name(&self) -> &str {
            self.name
        }

        fn validate(&self, _context: &Context) -> ValidationResult {
            ValidationResult::success()
        }

        async fn run(&self, context: &Context) -> Result<TaskOutput, TaskError> {
            if self.fail {
                return Err(TaskError::fatal(format!("{} broke", self.name)));
            }
            Ok(TaskOutput::new(json!({ "seen": context.len() })))
        }
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let crew = Crew::new("data")
            .with_task(Stage { name: "a", fail: false })
            .with_task(Stage { name: "a", fail: false });
        assert!(crew.validate().is_err());

        assert!(Crew::new("empty").validate().is_err());
    }

    #[tokio::test]
    async fn test_outputs_flow_downstream() {
        let mut crew = Crew::new("data")
            .with_task(Stage { name: "a", fail: false })
            .with_task(Stage { name: "b", fail: false });

        let outcome = crew.kickoff(&Context::new()).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.order, vec!["a", "b"]);
        // b sees a's output in its context
        assert_eq!(outcome.results["b"].output, Some(json!({ "seen": 1 })));
    }

    #[tokio::test]
    async fn test_failed_at_is_reported() {
        let mut crew = Crew::new("data")
            .with_task(Stage { name: "a", fail: true })
            .with_task(Stage { name: "b", fail: false });

        let outcome = crew.kickoff(&Context::new()).await;

        assert_eq!(outcome.status, CrewStatus::Failed);
        assert_eq!(outcome.failed_at.as_deref(), Some("a"));
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results["a"].errors, vec!["a broke".to_string()]);
    }
}

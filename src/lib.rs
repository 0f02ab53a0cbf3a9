//! carecrew - Task execution and orchestration core
//!
//! Runs independent units of work (tasks) with validation, retry,
//! checkpointing and circuit breaking, chains them into fail-fast crews,
//! and steers outcomes through rule tables that auto-approve, reject or
//! escalate to a human.
//!
//! # Architecture
//!
//! - A `TaskRunner` never lets a failure escape: errors and panics become
//!   a Failed `ExecutionResult`
//! - External calls go through a `CircuitBreaker` wrapping a `RetryPolicy`
//! - Long batch operations save resume cursors in a `CheckpointStore`
//! - Crews publish stage events on an asynchronous `EventBus`
//!
//! # Modules
//!
//! - `adapters`: Notification channels (Telegram)
//! - `core`: Task runner, resilience policies, event bus, steering, crews
//! - `domain`: Data structures (ExecutionResult, Event, Decision, CheckpointRecord)
//! - `tasks`: Built-in ingest and quality-check tasks
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Ingest a dataset and score it
//! carecrew pipeline --source raw.jsonl --target clean.jsonl --key stay_id
//!
//! # Evaluate steering rules
//! carecrew decide --metric auroc=0.86 --metric auroc_improvement=0.04
//!
//! # Inspect interrupted operations
//! carecrew checkpoints list
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod tasks;

// Re-export main types at crate root for convenience
pub use core::{
    Crew, CrewOutcome, CrewStatus, DecisionEngine, EventBus, RetryPolicy, RuleTable, Task,
    TaskError, TaskRunner,
};
pub use domain::{Decision, Event, ExecutionResult, Outcome, TaskOutput, TaskStatus};

// Telegram integration
pub use adapters::{TelegramChannel, TelegramConfig};

//! Domain types for the carecrew orchestration core.
//!
//! This module contains the core data structures:
//! - Result: Task status, validation and execution outcomes
//! - Events: Immutable messages carried by the event bus
//! - Checkpoint: Resume cursors for batch operations
//! - Decision: Steering verdicts and approval records

pub mod checkpoint;
pub mod decision;
pub mod events;
pub mod result;

// Re-export commonly used types
pub use checkpoint::{CheckpointRecord, Cursor};
pub use decision::{ApprovalRequest, ApprovalResponse, Decision, Outcome};
pub use events::Event;
pub use result::{ExecutionResult, TaskOutput, TaskStatus, ValidationResult};

//! Core execution and orchestration logic.
//!
//! This module contains:
//! - Task / TaskRunner: the unit of work and its lifecycle wrapper
//! - RetryPolicy and CircuitBreaker: resilience around external calls
//! - CheckpointStore: durable resume cursors
//! - EventBus: asynchronous publish/subscribe
//! - DecisionEngine and ApprovalGateway: rule-based steering with human escalation
//! - Crew: sequential fail-fast orchestration

pub mod approval;
pub mod audit;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod decision;
pub mod error;
pub mod event_bus;
pub mod orchestrator;
pub mod retry;
pub mod task;

// Re-export commonly used types
pub use approval::{ApprovalConfig, ApprovalGateway, ChannelConfig, ChannelKind, InMemoryChannel};
pub use audit::AuditLog;
pub use checkpoint::{
    CheckpointBackend, CheckpointError, CheckpointStore, FileCheckpointStore,
    MemoryCheckpointStore, ResumableOperation, SqliteCheckpointStore,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState};
pub use decision::{CompareOp, Condition, DecisionEngine, Metrics, Rule, RuleTable, Verdict};
pub use error::TaskError;
pub use event_bus::{
    EventBus, EventBusConfig, EventBusError, EventHandler, EventPattern, FnHandler,
    SubscriptionHandle,
};
pub use orchestrator::{Crew, CrewOutcome, CrewStatus, CrewTrigger};
pub use retry::RetryPolicy;
pub use task::{Context, Task, TaskRunner};

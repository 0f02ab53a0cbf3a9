//! Error taxonomy shared by tasks and resilience policies.

use thiserror::Error;
use uuid::Uuid;

/// Errors a task (or a guarded external call) can fail with
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Transient failure; `kind` (e.g. "timeout", "connection") decides
    /// whether a retry policy retries it
    #[error("{kind}: {message}")]
    Transient { kind: String, message: String },

    /// Permanent failure: missing input, malformed configuration
    #[error("{0}")]
    Fatal(String),

    /// A data or quality threshold was not met
    #[error("Business rule '{rule}' violated: {message}")]
    BusinessRule { rule: String, message: String },

    /// The guarded collaborator is presumed unhealthy; the call was not made
    #[error("Circuit '{name}' is open")]
    CircuitOpen { name: String },

    /// A human did not answer in time
    #[error("Approval request {request_id} timed out after {timeout_seconds}s")]
    ApprovalTimeout {
        request_id: Uuid,
        timeout_seconds: u64,
    },
}

impl TaskError {
    pub fn transient(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn business_rule(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BusinessRule {
            rule: rule.into(),
            message: message.into(),
        }
    }

    /// Stable classification key used by retry policies
    pub fn kind(&self) -> &str {
        match self {
            Self::Transient { kind, .. } => kind,
            Self::Fatal(_) => "fatal",
            Self::BusinessRule { .. } => "business_rule",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ApprovalTimeout { .. } => "approval_timeout",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::TimedOut => Self::transient("timeout", err.to_string()),
            ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                Self::transient("resource_exhausted", err.to_string())
            }
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Self::transient("connection", err.to_string()),
            _ => Self::Fatal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fatal(format!("Malformed JSON: {}", err))
    }
}

//! Steering verdicts and human-approval records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What a steering rule decides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    AutoApprove,
    RequestHuman,
    Reject,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AutoApprove => "auto_approve",
            Self::RequestHuman => "request_human",
            Self::Reject => "reject",
        };
        f.write_str(s)
    }
}

/// Produced once per `DecisionEngine::decide` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub outcome: Outcome,
    pub reason: String,
    /// In `[0, 1]`
    pub confidence: f64,
    /// Name of the matching rule, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl Decision {
    /// The fail-safe verdict when nothing matched
    pub fn unmatched() -> Self {
        Self {
            outcome: Outcome::RequestHuman,
            reason: "no rule matched".to_string(),
            confidence: 0.0,
            rule: None,
        }
    }
}

/// Structured message sent to a human approver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,

    /// Short headline, e.g. "Promote sepsis model v3?"
    pub title: String,

    /// Why a human is being asked
    pub reason: String,

    /// Supporting figures shown to the approver
    #[serde(default)]
    pub metrics: HashMap<String, f64>,

    #[serde(default)]
    pub context: HashMap<String, Value>,

    pub requested_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(title: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            reason: reason.into(),
            metrics: HashMap::new(),
            context: HashMap::new(),
            requested_at: Utc::now(),
        }
    }

    pub fn with_metrics(mut self, metrics: HashMap<String, f64>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Render as a plain-text chat message
    pub fn to_message(&self) -> String {
        let mut lines = vec![
            format!("Approval requested: {}", self.title),
            format!("Reason: {}", self.reason),
        ];

        let mut metrics: Vec<_> = self.metrics.iter().collect();
        metrics.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in metrics {
            lines.push(format!("  {} = {:.4}", name, value));
        }

        lines.push(format!("Reply /approve {} or /reject {}", self.id, self.id));
        lines.join("\n")
    }
}

/// Resolution of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approved: bool,
    pub timed_out: bool,
}

impl ApprovalResponse {
    pub fn approved() -> Self {
        Self {
            approved: true,
            timed_out: false,
        }
    }

    pub fn rejected() -> Self {
        Self {
            approved: false,
            timed_out: false,
        }
    }

    /// A timeout is never an approval
    pub fn timed_out() -> Self {
        Self {
            approved: false,
            timed_out: true,
        }
    }
}

//! Rule-based steering.
//!
//! A `RuleTable` is an ordered list of rules; `DecisionEngine::decide`
//! returns the outcome of the first rule whose condition holds over the
//! supplied metrics. When nothing matches the verdict is `RequestHuman`
//! with zero confidence: an unmatched case is never auto-approved.
//!
//! Rule tables are configuration (YAML), e.g.
//!
//! ```yaml
//! rules:
//!   - name: quality_floor
//!     when: { metric: overall_score, op: lt, value: 0.90 }
//!     outcome: reject
//!     reason: data quality below threshold
//!   - name: clear_improvement
//!     when:
//!       all:
//!         - { metric: auroc_improvement, op: gte, value: 0.03 }
//!         - { metric: auroc, op: gte, value: 0.80 }
//!     outcome: auto_approve
//!     reason: model clearly better than production
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::domain::{ApprovalRequest, Decision, Outcome};

use super::approval::ApprovalGateway;

/// Metric name -> value
pub type Metrics = HashMap<String, f64>;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Lte => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Gte => lhs >= rhs,
            Self::Eq => (lhs - rhs).abs() < f64::EPSILON,
            Self::Ne => (lhs - rhs).abs() >= f64::EPSILON,
        }
    }
}

/// Code-defined condition for rules built outside configuration
#[derive(Clone)]
pub struct Predicate(Arc<dyn Fn(&Metrics) -> bool + Send + Sync>);

impl Predicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Metrics) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

/// Marker for the `always` condition (deserializes from the string "always")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlwaysMarker {
    Always,
}

/// Predicate over metrics.
///
/// Supports multiple YAML formats:
/// - Comparison: `{ metric: auroc, op: gte, value: 0.8 }`
/// - Conjunction: `{ all: [ ... ] }`
/// - Disjunction: `{ any: [ ... ] }`
/// - Negation: `{ not: { ... } }`
/// - Catch-all: `always`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Compare {
        metric: String,
        op: CompareOp,
        value: f64,
    },
    All {
        all: Vec<Condition>,
    },
    Any {
        any: Vec<Condition>,
    },
    Not {
        not: Box<Condition>,
    },
    Always(AlwaysMarker),
    #[serde(skip)]
    Custom(Predicate),
}

impl Condition {
    pub fn compare(metric: impl Into<String>, op: CompareOp, value: f64) -> Self {
        Self::Compare {
            metric: metric.into(),
            op,
            value,
        }
    }

    pub fn always() -> Self {
        Self::Always(AlwaysMarker::Always)
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Metrics) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Predicate::new(f))
    }

    /// Comparisons against a metric absent from `metrics` are false
    pub fn holds(&self, metrics: &Metrics) -> bool {
        match self {
            Self::Compare { metric, op, value } => metrics
                .get(metric)
                .map(|actual| !actual.is_nan() && op.apply(*actual, *value))
                .unwrap_or(false),
            Self::All { all } => all.iter().all(|c| c.holds(metrics)),
            Self::Any { any } => any.iter().any(|c| c.holds(metrics)),
            Self::Not { not } => !not.holds(metrics),
            Self::Always(_) => true,
            Self::Custom(predicate) => (predicate.0)(metrics),
        }
    }
}

fn default_confidence() -> f64 {
    1.0
}

/// One row of a rule table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,

    #[serde(rename = "when")]
    pub condition: Condition,

    pub outcome: Outcome,

    pub reason: String,

    /// Confidence reported when this rule decides (default: 1.0)
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        condition: Condition,
        outcome: Outcome,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            condition,
            outcome,
            reason: reason.into(),
            confidence: default_confidence(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Ordered rules, evaluated first-match-wins
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleTable {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleTable {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Load a rule table from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rule table: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a rule table from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let table: Self = serde_yaml::from_str(content).context("Failed to parse rule table YAML")?;
        table.validate()?;
        Ok(table)
    }

    /// Validate the rule table definition
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();

        for (i, rule) in self.rules.iter().enumerate() {
            if rule.name.is_empty() {
                anyhow::bail!("Rule {} has an empty name", i);
            }
            if !seen.insert(rule.name.as_str()) {
                anyhow::bail!("Duplicate rule name '{}'", rule.name);
            }
            if !(0.0..=1.0).contains(&rule.confidence) {
                anyhow::bail!(
                    "Rule '{}' has confidence {} outside [0, 1]",
                    rule.name,
                    rule.confidence
                );
            }
        }

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Result of steering: the decision plus how it was resolved
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub decision: Decision,
    pub approved: bool,
    /// Set when a human was asked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub human: Option<crate::domain::ApprovalResponse>,
}

/// Stateless evaluator of rule tables
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionEngine;

impl DecisionEngine {
    pub fn new() -> Self {
        Self
    }

    /// First matching rule wins; no match means ask a human
    pub fn decide(&self, metrics: &Metrics, table: &RuleTable) -> Decision {
        for rule in &table.rules {
            if rule.condition.holds(metrics) {
                let decision = Decision {
                    outcome: rule.outcome,
                    reason: rule.reason.clone(),
                    confidence: rule.confidence.clamp(0.0, 1.0),
                    rule: Some(rule.name.clone()),
                };
                info!(
                    rule = %rule.name,
                    outcome = %decision.outcome,
                    confidence = decision.confidence,
                    "Rule matched"
                );
                return decision;
            }
        }

        warn!(rules = table.rules.len(), "No rule matched, deferring to a human");
        Decision::unmatched()
    }

    /// Decide, and resolve `RequestHuman` through the approval gateway.
    ///
    /// A timed-out approval is treated as not approved.
    #[instrument(skip_all, fields(title = %request.title))]
    pub async fn steer(
        &self,
        metrics: &Metrics,
        table: &RuleTable,
        gateway: &ApprovalGateway,
        request: ApprovalRequest,
    ) -> Result<Verdict, super::error::TaskError> {
        let decision = self.decide(metrics, table);

        match decision.outcome {
            Outcome::AutoApprove => Ok(Verdict {
                decision,
                approved: true,
                human: None,
            }),
            Outcome::Reject => Ok(Verdict {
                decision,
                approved: false,
                human: None,
            }),
            Outcome::RequestHuman => {
                let request = ApprovalRequest {
                    reason: decision.reason.clone(),
                    metrics: metrics.clone(),
                    ..request
                };
                let response = gateway.request_approval(request, None).await?;
                Ok(Verdict {
                    decision,
                    approved: response.approved,
                    human: Some(response),
                })
            }
        }
    }
}

//! Data quality scoring.
//!
//! Two checks over a JSONL dataset:
//! - completeness: share of required fields that are present and non-null
//! - uniqueness: distinct non-null key values over total rows
//!
//! The overall score is the mean of the checks that ran. With a minimum
//! score set, a dataset below it fails the task with a business-rule error.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::{Context, Task, TaskError};
use crate::domain::{TaskOutput, ValidationResult};

use super::{context_str, read_jsonl};

/// Default minimum overall score
pub const DEFAULT_MIN_SCORE: f64 = 0.90;

/// Scores for one dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completeness: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uniqueness: Option<f64>,
    pub overall_score: f64,
    pub passed: bool,
}

impl QualityReport {
    /// Score `rows`; an empty dataset scores zero on every check
    pub fn score(
        rows: &[Value],
        required_fields: &[String],
        key_field: Option<&str>,
        min_score: f64,
    ) -> Self {
        let completeness = (!required_fields.is_empty()).then(|| completeness(rows, required_fields));
        let uniqueness = key_field.map(|key| uniqueness(rows, key));

        let scores: Vec<f64> = completeness.iter().chain(uniqueness.iter()).copied().collect();
        let overall_score = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };

        Self {
            rows: rows.len() as u64,
            completeness,
            uniqueness,
            overall_score,
            passed: overall_score >= min_score,
        }
    }
}

fn completeness(rows: &[Value], fields: &[String]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    let present: usize = rows
        .iter()
        .map(|row| {
            fields
                .iter()
                .filter(|f| row.get(f.as_str()).map_or(false, |v| !v.is_null()))
                .count()
        })
        .sum();
    present as f64 / (rows.len() * fields.len()) as f64
}

fn uniqueness(rows: &[Value], key: &str) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    let distinct: HashSet<String> = rows
        .iter()
        .filter_map(|row| row.get(key))
        .filter(|v| !v.is_null())
        .map(Value::to_string)
        .collect();
    distinct.len() as f64 / rows.len() as f64
}

/// Scores the dataset named by `target_file` in the context
pub struct QualityCheckTask {
    name: String,
    required_fields: Vec<String>,
    key_field: Option<String>,
    min_score: f64,
    enforce: bool,
}

impl QualityCheckTask {
    pub fn new() -> Self {
        Self {
            name: "quality_check".to_string(),
            required_fields: Vec::new(),
            key_field: None,
            min_score: DEFAULT_MIN_SCORE,
            enforce: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_key_field(mut self, key: impl Into<String>) -> Self {
        self.key_field = Some(key.into());
        self
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }

    /// Report the score without failing below the minimum
    pub fn report_only(mut self) -> Self {
        self.enforce = false;
        self
    }
}

impl Default for QualityCheckTask {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Task for QualityCheckTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, context: &Context) -> ValidationResult {
        let mut errors = Vec::new();

        // Existence is checked at run time; an upstream stage may create it
        if context_str(context, "target_file").is_none() {
            errors.push("Missing required field: target_file".to_string());
        }

        if self.required_fields.is_empty() && self.key_field.is_none() {
            errors.push("No quality checks configured".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_score) {
            errors.push(format!("min_score must be within [0, 1], got {}", self.min_score));
        }

        ValidationResult::from_errors(errors)
    }

    #[instrument(skip(self, context), fields(task = %self.name))]
    async fn run(&self, context: &Context) -> Result<TaskOutput, TaskError> {
        let target = context_str(context, "target_file")
            .ok_or_else(|| TaskError::fatal("Missing required field: target_file"))?;

        if !Path::new(target).exists() {
            return Err(TaskError::fatal(format!("Dataset does not exist: {}", target)));
        }

        let rows = read_jsonl(Path::new(target)).await?;
        let report = QualityReport::score(
            &rows,
            &self.required_fields,
            self.key_field.as_deref(),
            self.min_score,
        );

        info!(
            rows = report.rows,
            overall_score = report.overall_score,
            passed = report.passed,
            "Quality check complete"
        );

        if !report.passed && self.enforce {
            warn!(min_score = self.min_score, "Quality below minimum");
            return Err(TaskError::business_rule(
                "min_quality_score",
                format!(
                    "overall score {:.4} is below {:.2}",
                    report.overall_score, self.min_score
                ),
            ));
        }

        let mut output = TaskOutput::new(serde_json::to_value(&report)?)
            .with_metric("overall_score", report.overall_score)
            .with_metric("rows", report.rows);
        if let Some(score) = report.completeness {
            output = output.with_metric("completeness", score);
        }
        if let Some(score) = report.uniqueness {
            output = output.with_metric("uniqueness", score);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Value> {
        vec![
            json!({"stay_id": 1, "subject_id": 10}),
            json!({"stay_id": 2, "subject_id": null}),
            json!({"stay_id": 2, "subject_id": 12}),
            json!({"subject_id": 13}),
        ]
    }

    #[test]
    fn test_scores() {
        let fields = vec!["stay_id".to_string(), "subject_id".to_string()];
        let report = QualityReport::score(&rows(), &fields, Some("stay_id"), 0.9);

        // 6 of 8 required values present; 2 distinct keys over 4 rows
        assert_eq!(report.completeness, Some(0.75));
        assert_eq!(report.uniqueness, Some(0.5));
        assert!((report.overall_score - 0.625).abs() < 1e-9);
        assert!(!report.passed);
    }

    #[test]
    fn test_empty_dataset_fails() {
        let report = QualityReport::score(&[], &["a".to_string()], None, 0.9);
        assert_eq!(report.overall_score, 0.0);
        assert!(!report.passed);
    }

    #[test]
    fn test_validate_requires_a_check() {
        let mut ctx = Context::new();
        ctx.insert("target_file".into(), json!("x.jsonl"));

        assert!(!QualityCheckTask::new().validate(&ctx).ok);
        assert!(QualityCheckTask::new().with_key_field("id").validate(&ctx).ok);
    }

    #[tokio::test]
    async fn test_below_minimum_is_business_rule_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("d.jsonl");
        let body: Vec<String> = rows().iter().map(Value::to_string).collect();
        std::fs::write(&path, body.join("\n")).unwrap();

        let mut ctx = Context::new();
        ctx.insert("target_file".into(), json!(path.to_string_lossy()));

        let task = QualityCheckTask::new().with_key_field("stay_id");
        let err = task.run(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), "business_rule");

        let output = task.report_only().run(&ctx).await.unwrap();
        assert_eq!(output.metrics["uniqueness"], json!(0.5));
    }
}

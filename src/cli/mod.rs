//! Command-line interface for carecrew.
//!
//! Provides commands for running the ingest + quality data pipeline,
//! evaluating steering rules, and managing checkpoints.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use crate::adapters::{NotificationChannel, TelegramChannel};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    ApprovalGateway, AuditLog, ChannelKind, CircuitBreaker, Crew, CrewOutcome, DecisionEngine,
    EventBus, RuleTable, Verdict,
};
use crate::domain::{ApprovalRequest, Outcome};
use crate::tasks::{IngestTask, JsonlSink, QualityCheckTask};

/// carecrew - Task execution and orchestration for clinical ML pipelines
#[derive(Parser, Debug)]
#[command(name = "carecrew")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest a JSONL dataset, score its quality and steer on the result
    Pipeline {
        /// Source JSONL file
        #[arg(short, long)]
        source: PathBuf,

        /// Target JSONL file
        #[arg(short, long)]
        target: PathBuf,

        /// Key field checked for uniqueness
        #[arg(short, long)]
        key: Option<String>,

        /// Required fields checked for completeness (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        require: Vec<String>,

        /// Rows per batch
        #[arg(short, long)]
        batch_size: Option<u64>,

        /// Checkpoint key (defaults to source + target)
        #[arg(long)]
        operation_id: Option<String>,

        /// Steering rule table (YAML); overrides the configured rules
        #[arg(long)]
        rules: Option<PathBuf>,
    },

    /// Evaluate steering rules against metrics
    Decide {
        /// Metric as name=value (repeatable)
        #[arg(short, long = "metric", value_parser = parse_metric, required = true)]
        metrics: Vec<(String, f64)>,

        /// Steering rule table (YAML); overrides the configured rules
        #[arg(long)]
        rules: Option<PathBuf>,
    },

    /// Manage checkpoints of interrupted operations
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum CheckpointCommands {
    /// List active checkpoints
    List,

    /// Delete the checkpoint of an operation (next run starts over)
    Clear {
        /// Operation ID
        operation_id: String,
    },
}

/// Parse `name=value`
fn parse_metric(s: &str) -> Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", s))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid value for '{}': {}", name, e))?;
    Ok((name.trim().to_string(), value))
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Pipeline {
                source,
                target,
                key,
                require,
                batch_size,
                operation_id,
                rules,
            } => {
                let options = PipelineOptions {
                    source,
                    target,
                    key,
                    require,
                    batch_size,
                    operation_id,
                    rules,
                };
                run_pipeline(options).await
            }
            Commands::Decide { metrics, rules } => decide(metrics, rules).await,
            Commands::Checkpoints { command } => match command {
                CheckpointCommands::List => list_checkpoints().await,
                CheckpointCommands::Clear { operation_id } => clear_checkpoint(&operation_id).await,
            },
            Commands::Config => show_config().await,
        }
    }
}

struct PipelineOptions {
    source: PathBuf,
    target: PathBuf,
    key: Option<String>,
    require: Vec<String>,
    batch_size: Option<u64>,
    operation_id: Option<String>,
    rules: Option<PathBuf>,
}

fn load_rules(cfg: &ResolvedConfig, path: Option<PathBuf>) -> Result<RuleTable> {
    match path {
        Some(path) => RuleTable::from_file(&path),
        None => Ok(cfg.steering.clone()),
    }
}

/// Notification channel from configuration, if one is usable
fn approval_channel(cfg: &ResolvedConfig) -> Option<Arc<dyn NotificationChannel>> {
    match cfg.approval.channel.kind {
        ChannelKind::None => None,
        ChannelKind::Telegram => match cfg.telegram() {
            Some(telegram) => Some(Arc::new(TelegramChannel::from_config(telegram))),
            None => {
                eprintln!("Telegram channel configured but CARECREW_TELEGRAM_TOKEN or chat id is missing");
                None
            }
        },
    }
}

/// Run ingest + quality as one crew, then steer on the quality metrics
async fn run_pipeline(options: PipelineOptions) -> Result<()> {
    let cfg = config::config()?;
    let rules = load_rules(cfg, options.rules)?;
    let store = cfg.open_checkpoint_store()?;

    let bus = EventBus::start(&cfg.event_bus);
    let audit = Arc::new(AuditLog::open(cfg.audit_log_path()).await?);
    bus.subscribe_all(audit);

    let breaker = Arc::new(CircuitBreaker::from_config("target", &cfg.circuit_breaker));
    let ingest = IngestTask::new(store, Arc::new(JsonlSink))
        .with_retry(cfg.retry.clone())
        .with_circuit_breaker(breaker);

    let mut quality = QualityCheckTask::new()
        .with_required_fields(options.require)
        .report_only();
    if let Some(key) = options.key {
        quality = quality.with_key_field(key);
    }

    let mut crew = Crew::new("data_pipeline")
        .with_task(ingest)
        .with_task(quality)
        .with_event_bus(bus.clone());
    crew.validate()?;

    let mut context = crate::core::Context::new();
    context.insert("source_file".into(), json!(options.source.to_string_lossy()));
    context.insert("target_file".into(), json!(options.target.to_string_lossy()));
    if let Some(batch_size) = options.batch_size {
        context.insert("batch_size".into(), json!(batch_size));
    }
    if let Some(operation_id) = options.operation_id {
        context.insert("operation_id".into(), json!(operation_id));
    }

    let outcome = crew.kickoff(&context).await;

    let verdict = if outcome.is_success() {
        match steer(cfg, &rules, &outcome, bus.clone()).await {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                bus.shutdown().await;
                return Err(e);
            }
        }
    } else {
        None
    };

    bus.shutdown().await;

    let report = PipelineReport {
        outcome: &outcome,
        verdict: verdict.as_ref(),
    };
    println!("{}", report.to_json()?);

    if !report.approved() {
        std::process::exit(1);
    }
    Ok(())
}

/// Document printed by `pipeline`
#[derive(Debug, Serialize)]
struct PipelineReport<'a> {
    outcome: &'a CrewOutcome,
    /// Absent when the crew failed and nothing was steered
    #[serde(skip_serializing_if = "Option::is_none")]
    verdict: Option<&'a Verdict>,
}

impl PipelineReport<'_> {
    fn approved(&self) -> bool {
        self.outcome.is_success() && self.verdict.map_or(false, |v| v.approved)
    }

    fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize pipeline outcome")
    }
}

async fn steer(
    cfg: &ResolvedConfig,
    rules: &RuleTable,
    outcome: &CrewOutcome,
    bus: EventBus,
) -> Result<Verdict> {
    let metrics = outcome
        .last()
        .map(|r| r.numeric_metrics())
        .unwrap_or_default();
    let engine = DecisionEngine::new();

    match approval_channel(cfg) {
        Some(channel) => {
            let gateway = ApprovalGateway::from_config(channel, &cfg.approval).with_event_bus(bus);
            let request = ApprovalRequest::new("Promote ingested dataset?", "")
                .with_context("crew", "data_pipeline")
                .with_context("tasks", json!(outcome.order));
            let verdict = engine.steer(&metrics, rules, &gateway, request).await?;

            if verdict.human.map_or(false, |h| h.timed_out) {
                eprintln!("Approval timed out after {}s", cfg.approval.timeout_seconds);
            }
            Ok(verdict)
        }
        None => {
            let decision = engine.decide(&metrics, rules);
            if decision.outcome == Outcome::RequestHuman {
                eprintln!("No approval channel configured; review manually.");
            }
            Ok(Verdict {
                approved: decision.outcome == Outcome::AutoApprove,
                decision,
                human: None,
            })
        }
    }
}

/// Evaluate rules against metrics given on the command line
async fn decide(metrics: Vec<(String, f64)>, rules: Option<PathBuf>) -> Result<()> {
    let cfg = config::config()?;
    let rules = load_rules(cfg, rules)?;
    let metrics: HashMap<String, f64> = metrics.into_iter().collect();

    let decision = DecisionEngine::new().decide(&metrics, &rules);
    println!(
        "{}",
        serde_json::to_string_pretty(&decision).context("Failed to serialize decision")?
    );
    Ok(())
}

/// List active checkpoints
async fn list_checkpoints() -> Result<()> {
    let cfg = config::config()?;
    let store = cfg.open_checkpoint_store()?;
    let mut records = store.list().await?;

    if records.is_empty() {
        println!("No active checkpoints");
        return Ok(());
    }

    records.sort_by(|a, b| a.saved_at.cmp(&b.saved_at));

    println!("{:<48} {:<12} {:<25}", "OPERATION", "CURSOR", "SAVED AT");
    println!("{}", "-".repeat(85));
    for record in records {
        println!(
            "{:<48} {:<12} {:<25}",
            record.operation_id,
            record.cursor.to_string(),
            record.saved_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Delete one checkpoint
async fn clear_checkpoint(operation_id: &str) -> Result<()> {
    let cfg = config::config()?;
    let store = cfg.open_checkpoint_store()?;

    if store.load(operation_id).await?.is_none() {
        println!("No checkpoint for '{}'", operation_id);
        return Ok(());
    }

    store.delete(operation_id).await?;
    println!("Cleared checkpoint for '{}'", operation_id);
    Ok(())
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("carecrew configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:        {}", cfg.home.display());
    println!("  Checkpoints: {:?} at {}", cfg.checkpoints.backend, cfg.checkpoints_dir().display());
    println!("  Audit log:   {}", cfg.audit_log_path().display());
    println!();
    println!("Retry:");
    println!("  Max retries: {}", cfg.retry.max_retries);
    println!("  Base delay:  {}ms", cfg.retry.base_delay_ms);
    println!("  Max delay:   {}ms", cfg.retry.max_delay_ms);
    println!("  Retryable:   {}", cfg.retry.retryable_error_kinds.join(", "));
    println!();
    println!("Circuit breaker:");
    println!("  Failure threshold: {}", cfg.circuit_breaker.failure_threshold);
    println!("  Open timeout:      {}s", cfg.circuit_breaker.timeout_seconds);
    println!();
    println!("Event bus queue capacity: {}", cfg.event_bus.queue_capacity);
    println!();
    println!("Approval:");
    println!("  Channel: {:?}", cfg.approval.channel.kind);
    println!(
        "  Timeout: {}",
        humanize(Duration::from_secs(cfg.approval.timeout_seconds))
    );
    println!();
    println!("Steering rules ({}):", cfg.steering.rules.len());
    for rule in &cfg.steering.rules {
        println!("  {:<28} -> {:<14} {}", rule.name, rule.outcome.to_string(), rule.reason);
    }

    Ok(())
}

fn humanize(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

//! Configuration for carecrew.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CARECREW_HOME, CARECREW_TELEGRAM_TOKEN,
//!    CARECREW_TELEGRAM_CHAT_ID)
//! 2. Config file (.carecrew/config.yaml)
//! 3. Defaults (~/.carecrew)
//!
//! Config file discovery:
//! - Searches current directory and parents for .carecrew/config.yaml
//! - `paths.home` is relative to the .carecrew/ directory

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::TelegramConfig;
use crate::core::{
    ApprovalConfig, CheckpointBackend, CheckpointStore, CircuitBreakerConfig, CompareOp, Condition,
    EventBusConfig, FileCheckpointStore, RetryPolicy, Rule, RuleTable, SqliteCheckpointStore,
};
use crate::domain::Outcome;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".carecrew";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub checkpoints: CheckpointsConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    /// Steering rules; the built-in table is used when absent
    #[serde(default)]
    pub steering: Option<RuleTable>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to the .carecrew/ directory)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CheckpointsConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to carecrew home (engine state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub event_bus: EventBusConfig,
    pub checkpoints: CheckpointsConfig,
    pub approval: ApprovalConfig,
    pub steering: RuleTable,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`
    pub fn with_home(home: PathBuf) -> Self {
        Self {
            home,
            config_file: None,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            event_bus: EventBusConfig::default(),
            checkpoints: CheckpointsConfig::default(),
            approval: ApprovalConfig::default(),
            steering: default_rules(),
        }
    }

    /// Directory holding file-backend checkpoints
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.home.join("checkpoints")
    }

    /// SQLite database used by the sqlite checkpoint backend
    pub fn checkpoints_db(&self) -> PathBuf {
        self.home.join("checkpoints.db")
    }

    /// Audit log of bus events
    pub fn audit_log_path(&self) -> PathBuf {
        self.home.join("audit").join("events.jsonl")
    }

    /// Build the configured checkpoint backend
    pub fn open_checkpoint_store(&self) -> Result<Arc<dyn CheckpointStore>> {
        let store: Arc<dyn CheckpointStore> = match self.checkpoints.backend {
            CheckpointBackend::File => Arc::new(
                FileCheckpointStore::open(self.checkpoints_dir())
                    .context("Failed to open checkpoint directory")?,
            ),
            CheckpointBackend::Sqlite => {
                std::fs::create_dir_all(&self.home).with_context(|| {
                    format!("Failed to create home directory: {}", self.home.display())
                })?;
                Arc::new(
                    SqliteCheckpointStore::open(&self.checkpoints_db())
                        .context("Failed to open checkpoint database")?,
                )
            }
        };
        Ok(store)
    }

    /// Telegram settings, if a bot token is available and a chat is known
    pub fn telegram(&self) -> Option<TelegramConfig> {
        let bot_token = std::env::var("CARECREW_TELEGRAM_TOKEN").ok()?;
        let chat_id = std::env::var("CARECREW_TELEGRAM_CHAT_ID")
            .ok()
            .or_else(|| self.approval.channel.chat_id.clone())?;

        Some(TelegramConfig { bot_token, chat_id })
    }
}

/// Built-in steering table.
///
/// Data quality below 0.90 blocks downstream work and a model under 0.80
/// AUROC is never promoted. Clear wins are approved automatically;
/// everything in between goes to a human.
pub fn default_rules() -> RuleTable {
    RuleTable::new(vec![
        Rule::new(
            "data_quality_floor",
            Condition::compare("overall_score", CompareOp::Lt, 0.90),
            Outcome::Reject,
            "data quality below 0.90",
        ),
        Rule::new(
            "model_auroc_floor",
            Condition::compare("auroc", CompareOp::Lt, 0.80),
            Outcome::Reject,
            "model AUROC below 0.80",
        ),
        Rule::new(
            "clear_model_improvement",
            Condition::compare("auroc_improvement", CompareOp::Gte, 0.03),
            Outcome::AutoApprove,
            "AUROC improves on production by at least 0.03",
        )
        .with_confidence(0.9),
        Rule::new(
            "high_data_quality",
            Condition::compare("overall_score", CompareOp::Gte, 0.95),
            Outcome::AutoApprove,
            "data quality at or above 0.95",
        )
        .with_confidence(0.95),
    ])
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    if let Some(rules) = &config.steering {
        rules
            .validate()
            .with_context(|| format!("Invalid steering rules in {}", path.display()))?;
    }

    Ok(config)
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    // Default home directory
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let env_home = std::env::var("CARECREW_HOME").ok().map(PathBuf::from);

    let Some(config_path) = find_config_file() else {
        // No config file - use env vars or defaults
        return Ok(ResolvedConfig::with_home(env_home.unwrap_or(default_home)));
    };

    let config = load_config_file(&config_path)?;
    let config_dir = config_path.parent().unwrap_or(Path::new("."));

    let home = match (env_home, &config.paths.home) {
        (Some(home), _) => home,
        (None, Some(home_path)) => resolve_path(config_dir, home_path),
        (None, None) => default_home,
    };

    Ok(ResolvedConfig {
        home,
        config_file: Some(config_path.clone()),
        retry: config.retry,
        circuit_breaker: config.circuit_breaker,
        event_bus: config.event_bus,
        checkpoints: config.checkpoints,
        approval: config.approval,
        steering: config.steering.unwrap_or_else(default_rules),
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the carecrew home directory (engine state).
pub fn carecrew_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChannelKind, DecisionEngine};
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();

        let config_path = config_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
retry:
  max_retries: 5
  base_delay_ms: 200
circuit_breaker:
  failure_threshold: 3
event_bus:
  queue_capacity: 64
checkpoints:
  backend: sqlite
approval:
  timeout_seconds: 600
  channel:
    type: telegram
    chat_id: "-100123"
steering:
  rules:
    - name: floor
      when: {{ metric: overall_score, op: lt, value: 0.8 }}
      outcome: reject
      reason: too low
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.home, Some("./state".to_string()));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 200);
        assert_eq!(config.retry.max_delay_ms, 10_000);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.timeout_seconds, 60);
        assert_eq!(config.event_bus.queue_capacity, 64);
        assert_eq!(config.checkpoints.backend, CheckpointBackend::Sqlite);
        assert_eq!(config.approval.timeout_seconds, 600);
        assert_eq!(config.approval.channel.kind, ChannelKind::Telegram);
        assert_eq!(config.steering.unwrap().rules.len(), 1);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "version: \"1.0\"\n").unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.checkpoints.backend, CheckpointBackend::File);
        assert_eq!(config.approval.channel.kind, ChannelKind::None);
        assert!(config.steering.is_none());
    }

    #[test]
    fn test_invalid_steering_rules_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
version: "1.0"
steering:
  rules:
    - { name: a, when: always, outcome: reject, reason: x }
    - { name: a, when: always, outcome: reject, reason: y }
"#,
        )
        .unwrap();

        assert!(load_config_file(&path).is_err());
    }

    #[test]
    fn test_default_rules() {
        let engine = DecisionEngine::new();
        let rules = default_rules();
        assert!(rules.validate().is_ok());

        let decide = |pairs: &[(&str, f64)]| {
            let metrics: HashMap<String, f64> =
                pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect();
            engine.decide(&metrics, &rules).outcome
        };

        assert_eq!(decide(&[("overall_score", 0.85)]), Outcome::Reject);
        assert_eq!(decide(&[("overall_score", 0.97)]), Outcome::AutoApprove);
        assert_eq!(decide(&[("overall_score", 0.92)]), Outcome::RequestHuman);
        assert_eq!(
            decide(&[("auroc", 0.86), ("auroc_improvement", 0.04)]),
            Outcome::AutoApprove
        );
        assert_eq!(
            decide(&[("auroc", 0.78), ("auroc_improvement", 0.05)]),
            Outcome::Reject
        );
    }

    #[test]
    fn test_home_relative_paths() {
        let config = ResolvedConfig::with_home(PathBuf::from("/srv/carecrew"));
        assert_eq!(config.checkpoints_dir(), PathBuf::from("/srv/carecrew/checkpoints"));
        assert_eq!(
            config.audit_log_path(),
            PathBuf::from("/srv/carecrew/audit/events.jsonl")
        );
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}

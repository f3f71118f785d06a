use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepwiseError};
use crate::schema::ToolSchema;

/// Top-level Stepwise configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepwiseConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Extra tool schemas merged over the built-in catalog.
    #[serde(default)]
    pub schemas: Vec<ToolSchema>,
}

/// Loop ceilings and scheduling for the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard ceiling on subtasks per task, including follow-ups and replans.
    #[serde(default = "default_max_subtasks")]
    pub max_subtasks: usize,
    /// Planner calls allowed in adaptive mode.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Follow-up subtasks allowed per tool.
    #[serde(default = "default_max_follow_ups")]
    pub max_follow_ups: usize,
    #[serde(default = "default_max_replans")]
    pub max_replans: usize,
    /// Subtasks in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Run independent subtasks concurrently.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_subtasks: default_max_subtasks(),
            max_iterations: default_max_iterations(),
            max_follow_ups: default_max_follow_ups(),
            max_replans: default_max_replans(),
            max_concurrency: default_max_concurrency(),
            parallel: default_parallel(),
        }
    }
}

fn default_max_subtasks() -> usize { 50 }
fn default_max_iterations() -> usize { 20 }
fn default_max_follow_ups() -> usize { 5 }
fn default_max_replans() -> usize { 3 }
fn default_max_concurrency() -> usize { 4 }
fn default_parallel() -> bool { true }

/// Retry configuration for transient tool failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 30000 }
fn default_jitter() -> bool { true }

/// Completeness heuristics and context truncation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Text results shorter than this are implausible.
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
    /// Text fields longer than this are capped in the context view.
    #[serde(default = "default_truncate_above")]
    pub truncate_above_chars: usize,
    /// Characters kept when a field is capped.
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
    #[serde(default = "default_truncation_marker")]
    pub truncation_marker: String,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            min_text_chars: default_min_text_chars(),
            truncate_above_chars: default_truncate_above(),
            preview_chars: default_preview_chars(),
            truncation_marker: default_truncation_marker(),
        }
    }
}

fn default_min_text_chars() -> usize { 40 }
fn default_truncate_above() -> usize { 500 }
fn default_preview_chars() -> usize { 300 }
fn default_truncation_marker() -> String { "…[truncated]".to_string() }

/// Timeout budgets, per tool rather than per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_timeout_secs")]
    pub default_secs: u64,
    /// Per-tool overrides, e.g. `browse = 120`.
    #[serde(default)]
    pub tools: HashMap<String, u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_secs: default_timeout_secs(),
            tools: HashMap::new(),
        }
    }
}

fn default_timeout_secs() -> u64 { 30 }

impl TimeoutConfig {
    /// Per-tool override, if one is configured.
    pub fn for_tool(&self, tool: &str) -> Option<Duration> {
        self.tools.get(tool).map(|s| Duration::from_secs(*s))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_secs)
    }
}

/// JSONL audit logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable audit logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./stepwise-logs
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = task start/finish, 2 = subtask transitions, 3 = retries and previews.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "./stepwise-logs".to_string() }
fn default_log_level() -> u8 { 2 }

impl LogConfig {
    /// Resolve the log directory (expand ~).
    pub fn dir(&self) -> PathBuf {
        if let Some(rest) = self.log_dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.log_dir)
    }
}

impl StepwiseConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepwiseError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| StepwiseError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break termination or truncation.
    pub fn validate(&self) -> Result<()> {
        let e = &self.engine;
        if e.max_subtasks == 0 || e.max_iterations == 0 || e.max_concurrency == 0 {
            return Err(StepwiseError::Config(
                "engine ceilings (max_subtasks, max_iterations, max_concurrency) must be > 0"
                    .into(),
            ));
        }
        let ev = &self.evaluator;
        if ev.preview_chars > ev.truncate_above_chars {
            return Err(StepwiseError::Config(format!(
                "evaluator.preview_chars ({}) must not exceed truncate_above_chars ({})",
                ev.preview_chars, ev.truncate_above_chars
            )));
        }
        if self.timeouts.default_secs == 0 {
            return Err(StepwiseError::Config("timeouts.default_secs must be > 0".into()));
        }
        Ok(())
    }
}

/// Expand `${VAR}` and `${VAR:-default}` references.
///
/// An unset variable without a default, or an unterminated `${`, is left
/// in place so TOML parsing reports it at the right spot.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            result.push_str(&rest[start..]);
            return result;
        };
        let body = &after[..end];
        let (name, default) = match body.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (body, None),
        };
        match (std::env::var(name.trim()), default) {
            (Ok(value), _) => result.push_str(&value),
            (Err(_), Some(default)) => result.push_str(default),
            (Err(_), None) => result.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

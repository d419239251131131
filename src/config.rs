//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - finquery.toml (default configuration)
//! - finquery.local.toml (git-ignored local overrides)
//! - Environment variables (FINQUERY_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # finquery.toml
//! [database]
//! path = "data/clean/finances.db"
//! schema_snapshot = "data/clean/schema_snapshot.json"
//!
//! [generation]
//! backend = "ollama"
//! base_url = "http://localhost:11434"
//! model = "llama3.2"
//!
//! [guard]
//! row_cap = 200
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! FINQUERY_GUARD__MAX_ATTEMPTS=5
//! FINQUERY_GENERATION__MODEL=openai/gpt-oss-120b
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub packager: PackagerConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub query_log: QueryLogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database file and schema snapshot locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file (opened read-only per execution)
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Schema snapshot document produced by the `snapshot` command
    #[serde(default = "default_schema_snapshot")]
    pub schema_snapshot: PathBuf,
}

/// Generation backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// OpenAI-compatible chat completions (hosted routers, vLLM, llama.cpp server)
    #[default]
    Openai,
    /// Local Ollama server
    Ollama,
}

/// Text generation capability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Access token. Falls back to the HF_TOKEN environment variable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_generation_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub temperature: f32,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_generation_timeout_ms")]
    pub timeout_ms: u64,
}

/// Query guard and retry bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Rows an approved query may return; also the executor's hard cap
    #[serde(default = "default_row_cap")]
    pub row_cap: usize,

    /// Generation attempts per question before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

/// Query execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Wall-clock execution timeout in milliseconds
    #[serde(default = "default_executor_timeout_ms")]
    pub timeout_ms: u64,
}

/// Result packaging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagerConfig {
    /// Text cells longer than this are cut for display (0 = never cut)
    #[serde(default = "default_max_cell_chars")]
    pub max_cell_chars: usize,

    /// Numeric columns summed into `totals` for multi-row results
    #[serde(default = "default_total_columns")]
    pub total_columns: Vec<String>,
}

/// Natural-language summary settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_summary_temperature")]
    pub temperature: f32,

    #[serde(default = "default_summary_max_tokens")]
    pub max_tokens: u32,

    /// Groups shown to the generator for grouped aggregates
    #[serde(default = "default_preview_limit")]
    pub max_groups: usize,

    /// Rows shown to the generator for detail results (totals cover the rest)
    #[serde(default = "default_preview_limit")]
    pub preview_rows: usize,
}

/// Prompt construction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Extra project conventions appended to the built-in list
    #[serde(default)]
    pub conventions: Vec<String>,

    /// Sample rows embedded per table
    #[serde(default = "default_max_samples_per_table")]
    pub max_samples_per_table: usize,
}

/// Append-only query log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogConfig {
    /// JSON Lines file; empty disables the file sink
    #[serde(default = "default_query_log_path")]
    pub path: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_db_path() -> PathBuf {
    PathBuf::from("data/clean/finances.db")
}
fn default_schema_snapshot() -> PathBuf {
    PathBuf::from("data/clean/schema_snapshot.json")
}
fn default_base_url() -> String {
    "https://router.huggingface.co/v1".to_string()
}
fn default_model() -> String {
    "openai/gpt-oss-20b".to_string()
}
fn default_generation_max_tokens() -> u32 {
    512
}
fn default_generation_timeout_ms() -> u64 {
    30_000
}
fn default_row_cap() -> usize {
    500
}
fn default_max_attempts() -> usize {
    3
}
fn default_executor_timeout_ms() -> u64 {
    10_000
}
fn default_max_cell_chars() -> usize {
    200
}
fn default_total_columns() -> Vec<String> {
    vec![
        "amount_clp".to_string(),
        "expense".to_string(),
        "income".to_string(),
    ]
}
fn default_true() -> bool {
    true
}
fn default_summary_temperature() -> f32 {
    0.2
}
fn default_summary_max_tokens() -> u32 {
    256
}
fn default_preview_limit() -> usize {
    20
}
fn default_max_samples_per_table() -> usize {
    5
}
fn default_query_log_path() -> String {
    "logs/query_log.jsonl".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. finquery.toml (base configuration)
    /// 2. finquery.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (FINQUERY_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("finquery.toml"))
            .merge(Toml::file("finquery.local.toml"))
            .merge(Env::prefixed("FINQUERY_").split("__"))
            .extract()
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("FINQUERY_").split("__"))
            .extract()
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Configured key, else the HF_TOKEN environment variable
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("HF_TOKEN").ok().filter(|k| !k.is_empty()))
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: default_db_path(),
            schema_snapshot: default_schema_snapshot(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            backend: BackendKind::Openai,
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            max_tokens: default_generation_max_tokens(),
            temperature: 0.0,
            timeout_ms: default_generation_timeout_ms(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        GuardConfig {
            row_cap: default_row_cap(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            timeout_ms: default_executor_timeout_ms(),
        }
    }
}

impl Default for PackagerConfig {
    fn default() -> Self {
        PackagerConfig {
            max_cell_chars: default_max_cell_chars(),
            total_columns: default_total_columns(),
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        SummaryConfig {
            enabled: true,
            temperature: default_summary_temperature(),
            max_tokens: default_summary_max_tokens(),
            max_groups: default_preview_limit(),
            preview_rows: default_preview_limit(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        PromptConfig {
            conventions: Vec::new(),
            max_samples_per_table: default_max_samples_per_table(),
        }
    }
}

impl Default for QueryLogConfig {
    fn default() -> Self {
        QueryLogConfig {
            path: default_query_log_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database.path, PathBuf::from("data/clean/finances.db"));
        assert_eq!(config.guard.row_cap, 500);
        assert_eq!(config.guard.max_attempts, 3);
        assert_eq!(config.generation.backend, BackendKind::Openai);
        assert!(config.summary.enabled);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();

        // Verify it contains expected sections
        assert!(toml_str.contains("[database]"));
        assert!(toml_str.contains("[generation]"));
        assert!(toml_str.contains("[guard]"));
        assert!(toml_str.contains("[query_log]"));
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let back: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.guard.row_cap, 500);
        assert_eq!(back.packager.total_columns, default_total_columns());
        assert_eq!(back.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("[guard]\nrow_cap = 50\n").unwrap();
        assert_eq!(config.guard.row_cap, 50);
        assert_eq!(config.guard.max_attempts, 3);
        assert_eq!(config.executor.timeout_ms, 10_000);
    }

    #[test]
    fn test_backend_kind_serde() {
        let json = serde_json::to_string(&BackendKind::Openai).unwrap();
        assert_eq!(json, "\"openai\"");
        let json = serde_json::to_string(&BackendKind::Ollama).unwrap();
        assert_eq!(json, "\"ollama\"");
    }

    #[test]
    fn test_timeouts_as_durations() {
        let config = Config::default();
        assert_eq!(config.generation.timeout(), Duration::from_secs(30));
        assert_eq!(config.executor.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let generation = GenerationConfig {
            api_key: Some("hf_explicit".to_string()),
            ..GenerationConfig::default()
        };
        assert_eq!(generation.resolved_api_key().as_deref(), Some("hf_explicit"));
    }
}

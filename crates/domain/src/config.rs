//! Server configuration, loaded from `quill.toml`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub librarian: LibrarianConfig,
    #[serde(default)]
    pub agents: AgentLimitsConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: d_host(), port: d_port() }
    }
}

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    8787
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding `stories/`.
    #[serde(default = "d_data_dir")]
    pub data_dir: PathBuf,
    /// Process-wide instruction override directory.
    #[serde(default = "d_instruction_sets_dir")]
    pub instruction_sets_dir: PathBuf,
    /// Plugin manifest directory (`<dir>/<plugin>/manifest.json`).
    #[serde(default = "d_plugins_dir")]
    pub plugins_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: d_data_dir(),
            instruction_sets_dir: d_instruction_sets_dir(),
            plugins_dir: d_plugins_dir(),
        }
    }
}

fn d_data_dir() -> PathBuf {
    "./data".into()
}
fn d_instruction_sets_dir() -> PathBuf {
    "./instruction-sets".into()
}
fn d_plugins_dir() -> PathBuf {
    "./plugins".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "d_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_default_model")]
    pub default_model: String,
    #[serde(default = "d_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_base_url(),
            api_key_env: d_api_key_env(),
            default_model: d_default_model(),
            request_timeout_secs: d_request_timeout_secs(),
        }
    }
}

fn d_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn d_api_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn d_default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn d_request_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibrarianConfig {
    /// Debounce between a corpus change and the analyzer run.
    #[serde(default = "d_debounce_ms")]
    pub debounce_ms: u64,
    /// Hard cap on the rolling story summary.
    #[serde(default = "d_summary_cap_bytes")]
    pub summary_cap_bytes: usize,
}

impl Default for LibrarianConfig {
    fn default() -> Self {
        Self { debounce_ms: d_debounce_ms(), summary_cap_bytes: d_summary_cap_bytes() }
    }
}

fn d_debounce_ms() -> u64 {
    2_000
}
fn d_summary_cap_bytes() -> usize {
    8_192
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLimitsConfig {
    #[serde(default = "d_max_depth")]
    pub max_depth: u32,
    #[serde(default = "d_max_calls")]
    pub max_calls: u32,
    #[serde(default = "d_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for AgentLimitsConfig {
    fn default() -> Self {
        Self { max_depth: d_max_depth(), max_calls: d_max_calls(), timeout_ms: d_timeout_ms() }
    }
}

fn d_max_depth() -> u32 {
    3
}
fn d_max_calls() -> u32 {
    20
}
fn d_timeout_ms() -> u64 {
    120_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// High-water mark of the NDJSON event channel.
    #[serde(default = "d_buffer_capacity")]
    pub buffer_capacity: usize,
    /// How long a non-droppable event may stall on a slow client before
    /// the stream fails with `StreamAborted`.
    #[serde(default = "d_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { buffer_capacity: d_buffer_capacity(), stall_timeout_ms: d_stall_timeout_ms() }
    }
}

fn d_buffer_capacity() -> usize {
    256
}
fn d_stall_timeout_ms() -> u64 {
    30_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be non-zero".into(),
            });
        }
        if self.agents.max_depth == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "agents.max_depth".into(),
                message: "max_depth must be at least 1".into(),
            });
        }
        if self.agents.max_calls == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "agents.max_calls".into(),
                message: "max_calls must be at least 1".into(),
            });
        }
        if self.stream.buffer_capacity == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "stream.buffer_capacity".into(),
                message: "buffer_capacity must be at least 1".into(),
            });
        }
        if self.librarian.debounce_ms < 100 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "librarian.debounce_ms".into(),
                message: "debounce under 100ms will re-analyze on every keystroke".into(),
            });
        }
        if self.librarian.summary_cap_bytes < 1024 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "librarian.summary_cap_bytes".into(),
                message: "summary cap under 1KiB truncates aggressively".into(),
            });
        }

        issues
    }
}

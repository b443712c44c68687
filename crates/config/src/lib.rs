//! Configuration loading, validation, and management for TaskPilot.
//!
//! Loads configuration from `~/.taskpilot/config.toml` (or the file named by
//! `TASKPILOT_CONFIG`) with environment variable overrides. Validates all
//! settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use taskpilot_core::model::GenerationConfig;

/// The root configuration structure.
///
/// Maps directly to `~/.taskpilot/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model backend connection
    #[serde(default)]
    pub model: ModelConfig,

    /// Run loop defaults
    #[serde(default)]
    pub agent: AgentConfig,

    /// Tool executor settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Session memory settings
    #[serde(default)]
    pub memory: MemoryConfig,

    /// HTTP gateway settings
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

// ── Model ────────────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// OpenAI-compatible endpoint, e.g. a local vLLM or llama.cpp server
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_coder_model")]
    pub coder_model: String,

    #[serde(default = "default_ocr_model")]
    pub ocr_model: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000/v1".into()
}
fn default_coder_model() -> String {
    "deepseek-ai/DeepSeek-R1-0528-Qwen3-8B".into()
}
fn default_ocr_model() -> String {
    "deepseek-ai/DeepSeek-OCR".into()
}
fn default_request_timeout() -> u64 {
    300
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            coder_model: default_coder_model(),
            ocr_model: default_ocr_model(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("coder_model", &self.coder_model)
            .field("ocr_model", &self.ocr_model)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

// ── Agent ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    #[serde(default = "default_min_new_tokens")]
    pub min_new_tokens: u32,

    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_true")]
    pub lazy_load: bool,

    #[serde(default = "default_true")]
    pub sparse_load: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_gpu_memory_gib: Option<u32>,

    /// Re-prompts allowed per step when model output fails to parse
    #[serde(default = "default_max_format_retries")]
    pub max_format_retries: u32,

    /// Character budget for the message history sent to the model
    #[serde(default = "default_history_char_budget")]
    pub history_char_budget: usize,
}

fn default_max_steps() -> u32 {
    10
}
fn default_min_new_tokens() -> u32 {
    32
}
fn default_max_new_tokens() -> u32 {
    2048
}
fn default_top_p() -> f32 {
    0.95
}
fn default_max_format_retries() -> u32 {
    3
}
fn default_history_char_budget() -> usize {
    24_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            min_new_tokens: default_min_new_tokens(),
            max_new_tokens: default_max_new_tokens(),
            temperature: 0.0,
            top_p: default_top_p(),
            lazy_load: true,
            sparse_load: true,
            max_gpu_memory_gib: None,
            max_format_retries: default_max_format_retries(),
            history_char_budget: default_history_char_budget(),
        }
    }
}

// ── Tools ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_true")]
    pub allow_shell: bool,

    #[serde(default = "default_shell_timeout")]
    pub shell_timeout_secs: u64,

    /// Cap for per-call `timeout_sec` overrides
    #[serde(default = "default_max_shell_timeout")]
    pub max_shell_timeout_secs: u64,

    #[serde(default = "default_output_char_limit")]
    pub output_char_limit: usize,

    /// Additional regex patterns refused by `run_shell`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_denylist: Vec<String>,
}

fn default_shell_timeout() -> u64 {
    45
}
fn default_max_shell_timeout() -> u64 {
    600
}
fn default_output_char_limit() -> usize {
    4_000
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allow_shell: true,
            shell_timeout_secs: default_shell_timeout(),
            max_shell_timeout_secs: default_max_shell_timeout(),
            output_char_limit: default_output_char_limit(),
            extra_denylist: vec![],
        }
    }
}

// ── Memory ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_capacity")]
    pub capacity: usize,

    /// Entries rendered into a new run's first prompt
    #[serde(default = "default_context_entries")]
    pub context_entries: usize,

    #[serde(default = "default_context_chars")]
    pub context_chars: usize,

    /// JSONL file for persistence; in-memory only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_memory_capacity() -> usize {
    30
}
fn default_context_entries() -> usize {
    8
}
fn default_context_chars() -> usize {
    5_000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_memory_capacity(),
            context_entries: default_context_entries(),
            context_chars: default_context_chars(),
            path: None,
        }
    }
}

// ── Gateway ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Directory relative workspaces resolve against; defaults to the cwd
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_workspace: Option<PathBuf>,

    #[serde(default = "default_max_upload_file_bytes")]
    pub max_upload_file_bytes: usize,

    #[serde(default = "default_max_upload_total_bytes")]
    pub max_upload_total_bytes: usize,
}

fn default_port() -> u16 {
    8765
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_max_upload_file_bytes() -> usize {
    25 * 1024 * 1024
}
fn default_max_upload_total_bytes() -> usize {
    100 * 1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            base_workspace: None,
            max_upload_file_bytes: default_max_upload_file_bytes(),
            max_upload_total_bytes: default_max_upload_total_bytes(),
        }
    }
}

impl GatewayConfig {
    /// The base workspace, falling back to the current directory.
    pub fn resolved_base_workspace(&self) -> PathBuf {
        self.base_workspace
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

// ── Loading ──────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from the default path (~/.taskpilot/config.toml),
    /// then apply environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("TASKPILOT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_dir().join("config.toml"));
        let mut config = Self::load_from(&config_path)?;

        // Environment variable overrides (highest priority)
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("TASKPILOT_BASE_URL") {
            self.model.base_url = v;
        }
        if let Some(v) = get("TASKPILOT_API_KEY") {
            self.model.api_key = Some(v);
        }
        if let Some(v) = get("TASKPILOT_CODER_MODEL") {
            self.model.coder_model = v;
        }
        if let Some(v) = get("TASKPILOT_OCR_MODEL") {
            self.model.ocr_model = v;
        }
        if let Some(v) = get("TASKPILOT_LAZY_LOAD") {
            self.agent.lazy_load = v != "0";
        }
        if let Some(v) = get("TASKPILOT_SPARSE_LOAD") {
            self.agent.sparse_load = v != "0";
        }
        if let Some(v) = get("TASKPILOT_MAX_GPU_MEMORY_GIB") {
            self.agent.max_gpu_memory_gib = Some(parse_env("TASKPILOT_MAX_GPU_MEMORY_GIB", &v)?);
        }
        if let Some(v) = get("AGENT_MAX_STEPS") {
            self.agent.max_steps = parse_env("AGENT_MAX_STEPS", &v)?;
        }
        if let Some(v) = get("AGENT_MIN_NEW_TOKENS") {
            self.agent.min_new_tokens = parse_env("AGENT_MIN_NEW_TOKENS", &v)?;
        }
        if let Some(v) = get("AGENT_MAX_NEW_TOKENS") {
            self.agent.max_new_tokens = parse_env("AGENT_MAX_NEW_TOKENS", &v)?;
        }
        if let Some(v) = get("AGENT_TEMPERATURE") {
            self.agent.temperature = parse_env("AGENT_TEMPERATURE", &v)?;
        }
        if let Some(v) = get("AGENT_TOP_P") {
            self.agent.top_p = parse_env("AGENT_TOP_P", &v)?;
        }
        if let Some(v) = get("AGENT_ALLOW_SHELL") {
            self.tools.allow_shell = v != "0";
        }
        if let Some(v) = get("AGENT_SHELL_TIMEOUT_SEC") {
            self.tools.shell_timeout_secs = parse_env("AGENT_SHELL_TIMEOUT_SEC", &v)?;
        }
        if let Some(v) = get("AGENT_TOOL_OUTPUT_CHARS") {
            self.tools.output_char_limit = parse_env("AGENT_TOOL_OUTPUT_CHARS", &v)?;
        }
        if let Some(v) = get("TASKPILOT_MEMORY_PATH") {
            self.memory.path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("TASKPILOT_GUI_WORKSPACE") {
            self.gateway.base_workspace = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".taskpilot")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let agent = &self.agent;
        if !(1..=200).contains(&agent.max_steps) {
            return Err(ConfigError::ValidationError(
                "agent.max_steps must be between 1 and 200".into(),
            ));
        }
        if agent.min_new_tokens == 0 || agent.max_new_tokens == 0 || agent.max_new_tokens > 16_384 {
            return Err(ConfigError::ValidationError(
                "agent token bounds must be between 1 and 16384".into(),
            ));
        }
        if agent.min_new_tokens > agent.max_new_tokens {
            return Err(ConfigError::ValidationError(
                "agent.min_new_tokens must not exceed agent.max_new_tokens".into(),
            ));
        }
        if !(0.0..=2.0).contains(&agent.temperature) {
            return Err(ConfigError::ValidationError(
                "agent.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if agent.top_p <= 0.0 || agent.top_p > 1.0 {
            return Err(ConfigError::ValidationError(
                "agent.top_p must be in (0.0, 1.0]".into(),
            ));
        }
        if self.tools.shell_timeout_secs == 0 || self.tools.output_char_limit == 0 {
            return Err(ConfigError::ValidationError(
                "tools.shell_timeout_secs and tools.output_char_limit must be > 0".into(),
            ));
        }
        if self.memory.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "memory.capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Per-run generation defaults derived from this configuration.
    pub fn generation_defaults(&self) -> GenerationConfig {
        GenerationConfig {
            step_limit: self.agent.max_steps,
            min_new_tokens: self.agent.min_new_tokens,
            max_new_tokens: self.agent.max_new_tokens,
            temperature: self.agent.temperature,
            top_p: self.agent.top_p,
            coder_model: self.model.coder_model.clone(),
            lazy_load: self.agent.lazy_load,
            sparse_load: self.agent.sparse_load,
            max_gpu_memory_gib: self.agent.max_gpu_memory_gib,
            allow_shell: self.tools.allow_shell,
            enable_ocr: true,
        }
    }

    /// Serialize this configuration as TOML.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        Self::default().to_toml()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.into(),
        value: value.into(),
    })
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Invalid value for environment variable {key}: {value:?}")]
    InvalidEnv { key: String, value: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

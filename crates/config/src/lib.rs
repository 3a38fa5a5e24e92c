//! Configuration loading, validation, and management for weft.
//!
//! Loads configuration from `~/.weft/config.toml` with environment variable
//! overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use weft_core::ToolDefinition;

/// The root configuration structure.
///
/// Maps directly to `~/.weft/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per model turn
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Agentic loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Chat store settings
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Streaming transport settings
    #[serde(default)]
    pub stream: StreamConfig,

    /// Tool dispatch settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Provider retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_true() -> bool {
    true
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("agent", &self.agent)
            .field("persistence", &self.persistence)
            .field("stream", &self.stream)
            .field("tools", &self.tools)
            .field("retry", &self.retry)
            .field("gateway", &self.gateway)
            .field("providers", &self.providers)
            .finish()
    }
}

/// Per-provider overrides.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard ceiling on model turns per generation
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,

    /// Whether plan-approval suspension is enabled at all
    #[serde(default = "default_true")]
    pub plan_approval: bool,

    /// Marker the model emits when a plan awaits approval
    #[serde(default = "default_plan_marker")]
    pub plan_marker: String,
}

fn default_max_turns() -> u32 {
    15
}
fn default_plan_marker() -> String {
    "[PLAN_READY]".into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            system_instruction: None,
            plan_approval: true,
            plan_marker: default_plan_marker(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// "sqlite", "file", or "memory"
    #[serde(default = "default_persistence_backend")]
    pub backend: String,

    /// Database file or directory; defaults under the config dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Debounce interval for streamed-text writes
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_persistence_backend() -> String {
    "sqlite".into()
}
fn default_debounce_ms() -> u64 {
    1500
}

impl PersistenceConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Resolved storage location for the configured backend.
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(p) => p.clone(),
            None if self.backend == "file" => AppConfig::config_dir().join("conversations"),
            None => AppConfig::config_dir().join("weft.db"),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: default_persistence_backend(),
            path: None,
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Interval between `ping` events on attached sinks
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Capacity of the loop-to-broadcaster event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// How long a new generation waits for a preempted job's final flush
    #[serde(default = "default_preempt_wait_ms")]
    pub preempt_wait_ms: u64,
}

fn default_heartbeat_secs() -> u64 {
    10
}
fn default_event_buffer() -> usize {
    256
}
fn default_preempt_wait_ms() -> u64 {
    5000
}

impl StreamConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn preempt_wait(&self) -> Duration {
        Duration::from_millis(self.preempt_wait_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            event_buffer: default_event_buffer(),
            preempt_wait_ms: default_preempt_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Round-trip timeout for delegated tools
    #[serde(default = "default_delegated_timeout_secs")]
    pub delegated_timeout_secs: u64,

    /// Built-in local tools to register
    #[serde(default = "default_builtins")]
    pub enabled_builtins: Vec<String>,

    /// Tools executed by the client
    #[serde(default)]
    pub delegated: Vec<DelegatedToolConfig>,
}

fn default_delegated_timeout_secs() -> u64 {
    60
}
fn default_builtins() -> Vec<String> {
    vec!["current_time".into(), "http_fetch".into()]
}

impl ToolsConfig {
    pub fn delegated_timeout(&self) -> Duration {
        Duration::from_secs(self.delegated_timeout_secs)
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            delegated_timeout_secs: default_delegated_timeout_secs(),
            enabled_builtins: default_builtins(),
            delegated: Vec::new(),
        }
    }
}

/// A tool whose execution lives in the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegatedToolConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON Schema of the arguments
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl DelegatedToolConfig {
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt for transient provider errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}
fn default_base_delay_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    42617
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.weft/config.toml).
    ///
    /// Also checks environment variables for API keys:
    /// - `WEFT_API_KEY` (highest priority)
    /// - `OPENROUTER_API_KEY`
    /// - `OPENAI_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
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

    fn apply_env_overrides(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("WEFT_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("WEFT_PROVIDER") {
            self.default_provider = provider;
        }

        if let Ok(model) = std::env::var("WEFT_MODEL") {
            self.default_model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".weft")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_turns == 0 {
            return Err(ConfigError::ValidationError("agent.max_turns must be >= 1".into()));
        }

        if self.agent.plan_approval && self.agent.plan_marker.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "agent.plan_marker must not be empty when plan_approval is enabled".into(),
            ));
        }

        if !matches!(self.persistence.backend.as_str(), "sqlite" | "file" | "memory") {
            return Err(ConfigError::ValidationError(format!(
                "unknown persistence.backend '{}'",
                self.persistence.backend
            )));
        }

        if self.persistence.debounce_ms == 0 {
            return Err(ConfigError::ValidationError("persistence.debounce_ms must be > 0".into()));
        }

        if self.stream.heartbeat_secs == 0 || self.stream.event_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "stream.heartbeat_secs and stream.event_buffer must be > 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for tool in &self.tools.delegated {
            if tool.name.trim().is_empty() {
                return Err(ConfigError::ValidationError("delegated tool name must not be empty".into()));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "delegated tool '{}' is declared twice",
                    tool.name
                )));
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
            || self
                .providers
                .get(&self.default_provider)
                .is_some_and(|p| p.api_key.is_some())
    }

    /// A copy safe to print: every API key replaced by a placeholder.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.api_key.is_some() {
            config.api_key = Some("***".into());
        }
        for provider in config.providers.values_mut() {
            if provider.api_key.is_some() {
                provider.api_key = Some("***".into());
            }
        }
        config
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            agent: AgentConfig::default(),
            persistence: PersistenceConfig::default(),
            stream: StreamConfig::default(),
            tools: ToolsConfig::default(),
            retry: RetryConfig::default(),
            gateway: GatewayConfig::default(),
            providers: HashMap::new(),
        }
    }
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

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

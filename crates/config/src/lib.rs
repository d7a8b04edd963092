//! Configuration loading and validation for taskloom.
//!
//! Loads `taskloom.toml` with environment variable overrides and
//! validates every section at startup. All limits the engine consults
//! at runtime live here so deployments can retune them without a
//! rebuild.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `taskloom.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default temperature for chat requests
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per model response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Iteration loop limits
    #[serde(default)]
    pub engine: EngineConfig,

    /// Context window budgets
    #[serde(default)]
    pub context: ContextConfig,

    /// Escalation thresholds
    #[serde(default)]
    pub escalation: EscalationConfig,

    /// Tool dispatch settings
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Parallel decomposition settings
    #[serde(default)]
    pub decompose: DecomposeConfig,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

/// Iteration budget and model-call retry settings for the main loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base iteration budget for a run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Extra iterations granted once when the budget runs out mid-task.
    /// 0 disables the extension.
    #[serde(default = "default_iteration_extension")]
    pub iteration_extension: u32,

    /// Timeout for a single chat request, in seconds
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    /// Total attempts per chat request (1 = no retry)
    #[serde(default = "default_llm_attempts")]
    pub llm_attempts: u32,

    /// Emit a warning step when this many iterations remain
    #[serde(default = "default_low_iteration_warning")]
    pub low_iteration_warning: u32,
}

fn default_max_iterations() -> u32 {
    50
}
fn default_iteration_extension() -> u32 {
    20
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_llm_attempts() -> u32 {
    2
}
fn default_low_iteration_warning() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            iteration_extension: default_iteration_extension(),
            llm_timeout_secs: default_llm_timeout_secs(),
            llm_attempts: default_llm_attempts(),
            low_iteration_warning: default_low_iteration_warning(),
        }
    }
}

/// Context window budgets. Token figures use the engine's deterministic
/// chars-based estimate, not a model tokenizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Below this many non-system messages the conversation passes
    /// through unchanged (validity pass only)
    #[serde(default = "default_summary_threshold")]
    pub summary_threshold: usize,

    /// How many recent messages the split search tries to keep in full
    #[serde(default = "default_recent_full")]
    pub recent_full: usize,

    /// Token ceiling for the retained recent suffix; beyond it tool
    /// results in the suffix are compressed per-message
    #[serde(default = "default_recent_token_ceiling")]
    pub recent_token_ceiling: usize,

    /// Hard token ceiling for the whole outgoing view; beyond it the
    /// oldest retained messages are evicted chain-atomically
    #[serde(default = "default_hard_token_ceiling")]
    pub hard_token_ceiling: usize,

    /// Per-message character cap applied during suffix compression
    #[serde(default = "default_per_message_char_cap")]
    pub per_message_char_cap: usize,
}

fn default_summary_threshold() -> usize {
    20
}
fn default_recent_full() -> usize {
    14
}
fn default_recent_token_ceiling() -> usize {
    12_000
}
fn default_hard_token_ceiling() -> usize {
    48_000
}
fn default_per_message_char_cap() -> usize {
    1500
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            summary_threshold: default_summary_threshold(),
            recent_full: default_recent_full(),
            recent_token_ceiling: default_recent_token_ceiling(),
            hard_token_ceiling: default_hard_token_ceiling(),
            per_message_char_cap: default_per_message_char_cap(),
        }
    }
}

/// Thresholds for tier escalation and stuck detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Consecutive failed tool calls that trigger escalation
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Identical trailing call signatures that trigger escalation
    #[serde(default = "default_repeated_call_window")]
    pub repeated_call_window: usize,

    /// Total iterations after which any prior failure triggers escalation
    #[serde(default = "default_stall_iteration_threshold")]
    pub stall_iteration_threshold: u32,

    /// Maximum escalations per run (tier chain hops)
    #[serde(default = "default_max_escalations")]
    pub max_escalations: u32,

    /// Minimum iterations between escalations
    #[serde(default = "default_cooldown_iterations")]
    pub cooldown_iterations: u32,

    /// Capacity of the recent-signature ring buffer
    #[serde(default = "default_signature_history")]
    pub signature_history: usize,
}

fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_repeated_call_window() -> usize {
    3
}
fn default_stall_iteration_threshold() -> u32 {
    15
}
fn default_max_escalations() -> u32 {
    2
}
fn default_cooldown_iterations() -> u32 {
    5
}
fn default_signature_history() -> usize {
    12
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            repeated_call_window: default_repeated_call_window(),
            stall_iteration_threshold: default_stall_iteration_threshold(),
            max_escalations: default_max_escalations(),
            cooldown_iterations: default_cooldown_iterations(),
            signature_history: default_signature_history(),
        }
    }
}

/// Tool dispatch settings: per-call timeout and result size caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Timeout for a single tool execution, in seconds
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Result character cap applied when a tool has no specific limit
    #[serde(default = "default_result_char_limit")]
    pub default_result_char_limit: usize,

    /// Per-tool result character caps, keyed by tool name
    #[serde(default = "default_result_char_limits")]
    pub result_char_limits: HashMap<String, usize>,
}

fn default_tool_timeout_secs() -> u64 {
    120
}
fn default_result_char_limit() -> usize {
    2000
}
fn default_result_char_limits() -> HashMap<String, usize> {
    HashMap::from([
        ("shell".to_string(), 2000),
        ("file_read".to_string(), 3000),
        ("file_list".to_string(), 1500),
        ("file_write".to_string(), 200),
        ("http_request".to_string(), 3000),
    ])
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            default_result_char_limit: default_result_char_limit(),
            result_char_limits: default_result_char_limits(),
        }
    }
}

/// Parallel decomposition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposeConfig {
    /// Iteration budget for each subtask loop
    #[serde(default = "default_subtask_max_iterations")]
    pub subtask_max_iterations: u32,

    /// Upper bound on subtasks accepted from one plan
    #[serde(default = "default_max_subtasks")]
    pub max_subtasks: usize,

    /// Whether the final merge goes through the model. When false (or
    /// when the merge call fails) outputs are concatenated.
    #[serde(default = "default_true")]
    pub merge_with_model: bool,
}

fn default_subtask_max_iterations() -> u32 {
    25
}
fn default_max_subtasks() -> usize {
    6
}
fn default_true() -> bool {
    true
}

impl Default for DecomposeConfig {
    fn default() -> Self {
        Self {
            subtask_max_iterations: default_subtask_max_iterations(),
            max_subtasks: default_max_subtasks(),
            merge_with_model: default_true(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (`taskloom.toml` in the
    /// working directory), then apply environment variable overrides:
    /// - `TASKLOOM_MAX_ITERATIONS`
    /// - `TASKLOOM_LLM_TIMEOUT_SECS`
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(Path::new("taskloom.toml"))?;

        if let Ok(raw) = std::env::var("TASKLOOM_MAX_ITERATIONS") {
            config.engine.max_iterations =
                raw.parse()
                    .map_err(|_| ConfigError::ValidationError(format!(
                        "TASKLOOM_MAX_ITERATIONS must be an integer, got {raw:?}"
                    )))?;
        }

        if let Ok(raw) = std::env::var("TASKLOOM_LLM_TIMEOUT_SECS") {
            config.engine.llm_timeout_secs =
                raw.parse()
                    .map_err(|_| ConfigError::ValidationError(format!(
                        "TASKLOOM_LLM_TIMEOUT_SECS must be an integer, got {raw:?}"
                    )))?;
        }

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

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.engine.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_iterations must be at least 1".into(),
            ));
        }

        if self.engine.llm_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "engine.llm_attempts must be at least 1".into(),
            ));
        }

        if self.context.summary_threshold < self.context.recent_full {
            return Err(ConfigError::ValidationError(
                "context.summary_threshold must be >= context.recent_full".into(),
            ));
        }

        if self.context.hard_token_ceiling < self.context.recent_token_ceiling {
            return Err(ConfigError::ValidationError(
                "context.hard_token_ceiling must be >= context.recent_token_ceiling".into(),
            ));
        }

        if self.escalation.repeated_call_window > self.escalation.signature_history {
            return Err(ConfigError::ValidationError(
                "escalation.repeated_call_window must fit in signature_history".into(),
            ));
        }

        if self.decompose.max_subtasks == 0 {
            return Err(ConfigError::ValidationError(
                "decompose.max_subtasks must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            engine: EngineConfig::default(),
            context: ContextConfig::default(),
            escalation: EscalationConfig::default(),
            dispatch: DispatchConfig::default(),
            decompose: DecomposeConfig::default(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    /// Optional separate model for the final-reply summarizer pass.
    /// Falls back to `llm` if not configured.
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    /// Base URL for OpenAI-compatible endpoints (Gemini, Groq, local
    /// gateways). Empty means the provider's default endpoint.
    #[serde(default)]
    pub base_url: String,
}

fn default_llm_provider() -> String {
    "anthropic".to_string()
}

fn default_llm_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_key: String::new(),
            base_url: String::new(),
        }
    }
}

/// Empty provider/model means "fall back to [llm]".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SummarizerConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "yotei.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum multi-step execution rounds per chat request. Clamped 1..=10.
    #[serde(default = "default_rounds_cap")]
    pub max_action_rounds: u32,
    /// Maximum repeated identical read/calc action streak. Clamped 1..=10.
    #[serde(default = "default_rounds_cap")]
    pub max_same_read_action_streak: u32,
}

fn default_rounds_cap() -> u32 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_action_rounds: default_rounds_cap(),
            max_same_read_action_streak: default_rounds_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum conversation messages fed into a single run.
    #[serde(default = "default_history_window")]
    pub window: usize,
}

fn default_history_window() -> usize {
    10
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            window: default_history_window(),
        }
    }
}

fn clamp_cap(raw: &str, fallback: u32) -> u32 {
    let parsed = raw.trim().parse::<i64>().unwrap_or(fallback as i64);
    parsed.clamp(1, 10) as u32
}

impl Config {
    /// Load config: defaults → yotei.toml → env vars (env wins).
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| AgentError::Config(format!("failed to read config: {e}")))?;
            toml::from_str(&content)
                .map_err(|e| AgentError::Config(format!("failed to parse config: {e}")))?
        } else {
            Self::default()
        };

        if let Ok(v) = std::env::var("YOTEI_LLM_PROVIDER") {
            config.llm.provider = v;
        }
        if let Ok(v) = std::env::var("YOTEI_LLM_MODEL") {
            config.llm.model = v;
        }
        if let Ok(v) = std::env::var("YOTEI_LLM_API_KEY") {
            config.llm.api_key = v;
        }
        if let Ok(v) = std::env::var("YOTEI_LLM_BASE_URL") {
            config.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("YOTEI_SUMMARIZER_API_KEY") {
            config.summarizer.api_key = v;
        }
        if let Ok(v) = std::env::var("YOTEI_DB_PATH") {
            config.database.path = v;
        }
        if let Ok(v) = std::env::var("SCHEDULER_MAX_ACTION_ROUNDS") {
            config.scheduler.max_action_rounds = clamp_cap(&v, default_rounds_cap());
        }
        if let Ok(v) = std::env::var("SCHEDULER_MAX_SAME_READ_ACTION_STREAK") {
            config.scheduler.max_same_read_action_streak = clamp_cap(&v, default_rounds_cap());
        }

        config.scheduler.max_action_rounds = config.scheduler.max_action_rounds.clamp(1, 10);
        config.scheduler.max_same_read_action_streak =
            config.scheduler.max_same_read_action_streak.clamp(1, 10);

        // Fallback: summarizer uses the main LLM config if not set
        if config.summarizer.provider.is_empty() {
            config.summarizer.provider = config.llm.provider.clone();
            config.summarizer.model = config.llm.model.clone();
            config.summarizer.base_url = config.llm.base_url.clone();
        }
        if config.summarizer.api_key.is_empty() {
            config.summarizer.api_key = config.llm.api_key.clone();
        }

        Ok(config)
    }
}

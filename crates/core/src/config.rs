use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefaults {
    #[serde(default = "default_model")]
    pub model: String,
    /// Explicit provider name. Inferred from the model prefix when unset.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tool_depth")]
    pub max_tool_depth: u32,
    #[serde(default = "default_llm_max_retries")]
    pub llm_max_retries: u32,
    #[serde(default = "default_llm_retry_delay_ms")]
    pub llm_retry_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tool_depth() -> u32 {
    10
}

fn default_llm_max_retries() -> u32 {
    1
}

fn default_llm_retry_delay_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_system_prompt() -> String {
    "You are a helpful agent working alongside other agents. \
     Use call_agent to hand part of the work to a better-suited agent, \
     and answer directly when you can."
        .to_string()
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            provider: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_tool_depth: default_max_tool_depth(),
            llm_max_retries: default_llm_max_retries(),
            llm_retry_delay_ms: default_llm_retry_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            system_prompt: default_system_prompt(),
        }
    }
}

/// One AI agent that gets its own Runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

impl AgentProfile {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            system_prompt: None,
            model: None,
            provider: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(default)]
    pub defaults: AgentDefaults,
    #[serde(default)]
    pub roster: Vec<AgentProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Number of newest turns returned verbatim by history reads.
    #[serde(default = "default_recent_raw")]
    pub recent_raw: usize,
    /// Older turns longer than this many characters are masked.
    #[serde(default = "default_mask_threshold")]
    pub mask_threshold: usize,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_history_limit() -> usize {
    20
}

fn default_recent_raw() -> usize {
    2
}

fn default_mask_threshold() -> usize {
    500
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            history_limit: default_history_limit(),
            recent_raw: default_recent_raw(),
            mask_threshold: default_mask_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Database location. Defaults to `<base>/relaycell.db`.
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default)]
    pub audit_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        debug!(path = %path.display(), agents = config.agents.roster.len(), "Config loaded");
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            debug!(path = %config_path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.runner.poll_interval_ms == 0 {
            return Err(Error::Config("runner.pollIntervalMs must be > 0".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for profile in &self.agents.roster {
            if profile.name.trim().is_empty() {
                return Err(Error::Config("agent roster entry with empty name".to_string()));
            }
            if !seen.insert(profile.name.as_str()) {
                return Err(Error::Config(format!(
                    "agent '{}' appears twice in the roster",
                    profile.name
                )));
            }
        }
        Ok(())
    }

    pub fn get_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn profile(&self, name: &str) -> Option<&AgentProfile> {
        self.agents.roster.iter().find(|p| p.name == name)
    }

    /// System prompt for an agent, falling back to the shared default.
    pub fn system_prompt_for(&self, name: &str) -> String {
        self.profile(name)
            .and_then(|p| p.system_prompt.clone())
            .unwrap_or_else(|| self.agents.defaults.system_prompt.clone())
    }

    pub fn db_path(&self, paths: &Paths) -> PathBuf {
        match self.storage.db_path.as_deref() {
            Some(p) if !p.trim().is_empty() => expand_home(p),
            _ => paths.db_file(),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

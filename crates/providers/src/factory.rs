use relaycell_core::config::{AgentProfile, ProviderConfig};
use relaycell_core::{Config, Error, Result};
use std::time::Duration;
use tracing::debug;

use crate::{AnthropicProvider, OllamaProvider, OpenAIProvider, Provider};

/// The closed set of wire protocols a provider can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Ollama,
    Anthropic,
}

impl ProviderKind {
    /// Map a config provider name onto a protocol. OpenAI-compatible hosts
    /// (deepseek, groq, openrouter, ...) all speak `OpenAi`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "anthropic" => ProviderKind::Anthropic,
            "ollama" => ProviderKind::Ollama,
            _ => ProviderKind::OpenAi,
        }
    }
}

/// Default api_base for OpenAI-compatible providers.
fn default_api_base(provider_name: &str) -> &'static str {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "groq" => "https://api.groq.com/openai/v1",
        _ => "https://api.openai.com/v1",
    }
}

/// Infer the provider name from a model prefix. None when the prefix is unknown.
pub fn infer_provider_from_model(model: &str) -> Option<&'static str> {
    if model.starts_with("anthropic/") || model.starts_with("claude-") {
        Some("anthropic")
    } else if model.starts_with("ollama/") {
        Some("ollama")
    } else if model.starts_with("openai/")
        || model.starts_with("gpt-")
        || model.starts_with("o1")
        || model.starts_with("o3")
    {
        Some("openai")
    } else if model.starts_with("deepseek") {
        Some("deepseek")
    } else if model.starts_with("groq/") {
        Some("groq")
    } else {
        None
    }
}

/// First provider in config with a usable key, used when neither an explicit
/// provider nor the model prefix decides.
fn fallback_provider_name(config: &Config) -> Option<&'static str> {
    let priority = ["anthropic", "openai", "openrouter", "deepseek", "groq"];
    for name in priority {
        if config
            .providers
            .get(name)
            .map(|p| !p.api_key.trim().is_empty())
            .unwrap_or(false)
        {
            return Some(name);
        }
    }
    if config.providers.contains_key("ollama") {
        return Some("ollama");
    }
    None
}

/// Build a provider.
///
/// Resolution order: `explicit_provider`, then the model prefix, then the
/// first configured provider with a key. Every kind except Ollama needs a
/// non-empty API key; a missing one is a configuration error.
pub fn create_provider(
    config: &Config,
    model: &str,
    explicit_provider: Option<&str>,
) -> Result<Box<dyn Provider>> {
    let defaults = &config.agents.defaults;
    let name: &str = match explicit_provider {
        Some(p) => p,
        None => infer_provider_from_model(model)
            .or_else(|| fallback_provider_name(config))
            .ok_or_else(|| {
                Error::Config(format!(
                    "No LLM provider for model '{}'. Set 'provider' in config, use a recognized \
                     model prefix (e.g. 'anthropic/claude-...', 'gpt-4o', 'ollama/llama3'), or add \
                     an API key to the providers section.",
                    model
                ))
            })?,
    };

    let kind = ProviderKind::from_name(name);
    let empty = ProviderConfig::default();
    let cfg = config.get_provider(name).unwrap_or(&empty);

    if kind != ProviderKind::Ollama && cfg.api_key.trim().is_empty() {
        return Err(Error::Config(format!(
            "Provider '{}' has no API key configured",
            name
        )));
    }

    let timeout = Duration::from_secs(defaults.request_timeout_secs);
    debug!(provider = %name, ?kind, model = %model, "Creating provider");

    let provider: Box<dyn Provider> = match kind {
        ProviderKind::Anthropic => Box::new(AnthropicProvider::new(
            &cfg.api_key,
            cfg.api_base.as_deref(),
            model,
            defaults.max_tokens,
            defaults.temperature,
            timeout,
        )),
        ProviderKind::Ollama => Box::new(OllamaProvider::new(
            cfg.api_base.as_deref(),
            model,
            defaults.max_tokens,
            defaults.temperature,
            timeout,
        )),
        ProviderKind::OpenAi => Box::new(OpenAIProvider::new(
            &cfg.api_key,
            Some(cfg.api_base.as_deref().unwrap_or_else(|| default_api_base(name))),
            model,
            defaults.max_tokens,
            defaults.temperature,
            timeout,
        )),
    };
    Ok(provider)
}

/// Provider for one roster agent: its own model/provider override the defaults.
pub fn create_provider_for(config: &Config, profile: &AgentProfile) -> Result<Box<dyn Provider>> {
    let model = profile
        .model
        .as_deref()
        .unwrap_or(&config.agents.defaults.model);
    let explicit = profile
        .provider
        .as_deref()
        .or(config.agents.defaults.provider.as_deref());
    create_provider(config, model, explicit)
}

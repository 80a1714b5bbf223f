pub mod anthropic;
pub mod client;
pub mod factory;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use relaycell_core::types::{ChatMessage, ImageAttachment, ProviderResponse};
use relaycell_core::Result;
use serde_json::Value;

/// One backend capable of answering a conversation turn.
///
/// `tools` are OpenAI-style function schemas; each adapter converts them into
/// its own wire shape. `images` are attached to the newest user turn.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn respond(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        tools: &[Value],
        images: &[ImageAttachment],
    ) -> Result<ProviderResponse>;

    fn name(&self) -> &str;
}

pub use anthropic::AnthropicProvider;
pub use factory::{create_provider, create_provider_for, infer_provider_from_model, ProviderKind};
pub use ollama::OllamaProvider;
pub use openai::OpenAIProvider;

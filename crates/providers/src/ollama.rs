use async_trait::async_trait;
use relaycell_core::types::{ChatMessage, ImageAttachment, ProviderResponse, Role, ToolCallRequest};
use relaycell_core::{Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{
    base64_image, build_http_client, classify_reqwest_error, classify_status, image_target,
    parse_text_tool_calls, preview,
};
use crate::Provider;

pub const DEFAULT_OLLAMA_BASE: &str = "http://localhost:11434";

pub struct OllamaProvider {
    client: Client,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OllamaProvider {
    pub fn new(
        api_base: Option<&str>,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> Self {
        let api_base = api_base
            .unwrap_or(DEFAULT_OLLAMA_BASE)
            .trim_end_matches('/')
            .to_string();
        Self {
            client: build_http_client(timeout),
            api_base,
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }

    /// "ollama/llama3" in config, "llama3" on the wire.
    fn normalize_model(model: &str) -> &str {
        model.strip_prefix("ollama/").unwrap_or(model)
    }

    fn convert_messages(
        system_prompt: &str,
        messages: &[ChatMessage],
        images: &[ImageAttachment],
    ) -> Vec<OllamaMessage> {
        let target = if images.is_empty() {
            None
        } else {
            image_target(messages)
        };

        let mut out = Vec::with_capacity(messages.len() + 1);
        if !system_prompt.is_empty() {
            out.push(OllamaMessage::text("system", system_prompt));
        }

        for (i, msg) in messages.iter().enumerate() {
            let mut converted = OllamaMessage::text(msg.role.as_str(), &msg.content);
            if Some(i) == target {
                converted.images = Some(images.iter().map(base64_image).collect());
            }
            if msg.role == Role::Assistant && msg.has_tool_calls() {
                converted.tool_calls = Some(
                    msg.tool_calls
                        .iter()
                        .map(|tc| OllamaToolCall {
                            function: Some(OllamaFunction {
                                name: tc.name.clone(),
                                arguments: tc.input.clone(),
                            }),
                        })
                        .collect(),
                );
            }
            out.push(converted);
        }
        out
    }

    fn parse_response(resp: OllamaChatResponse, tools_requested: bool) -> ProviderResponse {
        // Ollama does not return call ids, so they are synthesized per response
        let calls: Vec<ToolCallRequest> = resp
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .filter_map(|tc| tc.function)
            .enumerate()
            .map(|(i, f)| ToolCallRequest {
                id: format!("ollama_call_{}", i),
                name: f.name,
                input: f.arguments,
            })
            .collect();
        let content = resp.message.content;

        if calls.is_empty() && tools_requested {
            let (remaining, parsed) = parse_text_tool_calls(&content, "ollama_call");
            if !parsed.is_empty() {
                return ProviderResponse::from_parts(Some(remaining), parsed);
            }
        }
        ProviderResponse::from_parts(Some(content), calls)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
}

impl OllamaMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            tool_calls: None,
            images: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaToolCall {
    #[serde(default)]
    function: Option<OllamaFunction>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

#[async_trait]
impl Provider for OllamaProvider {
    async fn respond(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        tools: &[Value],
        images: &[ImageAttachment],
    ) -> Result<ProviderResponse> {
        let url = format!("{}/api/chat", self.api_base);
        let model = Self::normalize_model(&self.model);

        let mut request = json!({
            "model": model,
            "messages": Self::convert_messages(system_prompt, messages, images),
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            }
        });
        if !tools.is_empty() {
            // Same function schema shape as OpenAI
            request["tools"] = Value::Array(tools.to_vec());
        }

        info!(
            url = %url,
            model = %model,
            tools_count = tools.len(),
            messages_count = messages.len(),
            "Calling Ollama API"
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_reqwest_error("ollama", e))?;

        let status = response.status();
        let raw_body = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error("ollama", e))?;

        if !status.is_success() {
            error!(status = %status, body = %preview(&raw_body), "Ollama API error");
            return Err(classify_status("ollama", status, &raw_body));
        }
        debug!(body_len = raw_body.len(), "Ollama raw response");

        let resp: OllamaChatResponse = serde_json::from_str(&raw_body).map_err(|e| {
            Error::Provider(format!(
                "Failed to parse Ollama response: {}. Body: {}",
                e,
                preview(&raw_body)
            ))
        })?;
        Ok(Self::parse_response(resp, !tools.is_empty()))
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

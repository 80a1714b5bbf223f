use async_trait::async_trait;
use relaycell_core::types::{ChatMessage, ImageAttachment, ProviderResponse, Role, ToolCallRequest};
use relaycell_core::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{
    base64_image, build_http_client, classify_reqwest_error, classify_status, image_target,
    preview,
};
use crate::Provider;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl AnthropicProvider {
    pub fn new(
        api_key: &str,
        api_base: Option<&str>,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> Self {
        Self {
            client: build_http_client(timeout),
            api_key: api_key.to_string(),
            api_base: api_base
                .unwrap_or(ANTHROPIC_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }

    /// Convert OpenAI-style tool schemas to Anthropic tool format.
    /// OpenAI: { type: "function", function: { name, description, parameters } }
    /// Anthropic: { name, description, input_schema }
    fn convert_tools(tools: &[Value]) -> Vec<Value> {
        tools
            .iter()
            .filter_map(|tool| {
                let func = tool.get("function")?;
                let name = func.get("name")?.as_str()?;
                let description = func
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let parameters = func
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
                Some(json!({
                    "name": name,
                    "description": description,
                    "input_schema": parameters,
                }))
            })
            .collect()
    }

    /// Returns the top-level system text and the user/assistant turns.
    /// Tool results travel as `tool_result` blocks inside user turns.
    fn convert_messages(
        system_prompt: &str,
        messages: &[ChatMessage],
        images: &[ImageAttachment],
    ) -> (Option<String>, Vec<Value>) {
        let mut system_parts: Vec<&str> = Vec::new();
        if !system_prompt.is_empty() {
            system_parts.push(system_prompt);
        }
        let target = if images.is_empty() {
            None
        } else {
            image_target(messages)
        };

        let mut turns: Vec<Value> = Vec::new();
        for (i, msg) in messages.iter().enumerate() {
            match msg.role {
                Role::System => system_parts.push(&msg.content),
                Role::User if Some(i) == target => {
                    let mut blocks: Vec<Value> = images
                        .iter()
                        .map(|image| {
                            json!({
                                "type": "image",
                                "source": {
                                    "type": "base64",
                                    "media_type": image.mime_type,
                                    "data": base64_image(image),
                                }
                            })
                        })
                        .collect();
                    blocks.push(json!({"type": "text", "text": msg.content}));
                    turns.push(json!({"role": "user", "content": blocks}));
                }
                Role::User => turns.push(json!({"role": "user", "content": msg.content})),
                Role::Assistant => {
                    let mut blocks: Vec<Value> = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": msg.content}));
                    }
                    for tc in &msg.tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.input,
                        }));
                    }
                    if blocks.is_empty() {
                        blocks.push(json!({"type": "text", "text": ""}));
                    }
                    turns.push(json!({"role": "assistant", "content": blocks}));
                }
                Role::Tool => turns.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.as_deref().unwrap_or(""),
                        "content": msg.content,
                    }]
                })),
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, Self::merge_consecutive_roles(turns))
    }

    /// Anthropic requires alternating roles, so consecutive same-role turns
    /// are folded into one.
    fn merge_consecutive_roles(messages: Vec<Value>) -> Vec<Value> {
        let mut result: Vec<Value> = Vec::new();

        for msg in messages {
            let role = msg.get("role").and_then(|v| v.as_str()).unwrap_or("");
            let same_role = result
                .last()
                .and_then(|v| v.get("role"))
                .and_then(|v| v.as_str())
                == Some(role);

            let Some(last) = result.last_mut().filter(|_| same_role) else {
                result.push(msg);
                continue;
            };

            let last_content = last.get("content").cloned().unwrap_or(Value::Null);
            let new_content = msg.get("content").cloned().unwrap_or(Value::Null);
            last["content"] = match (last_content, new_content) {
                (Value::Array(mut a), Value::Array(b)) => {
                    a.extend(b);
                    Value::Array(a)
                }
                (Value::Array(mut a), Value::String(s)) => {
                    a.push(json!({"type": "text", "text": s}));
                    Value::Array(a)
                }
                (Value::String(s1), Value::String(s2)) => Value::String(format!("{}\n\n{}", s1, s2)),
                (Value::String(s), Value::Array(a)) => {
                    let mut merged = vec![json!({"type": "text", "text": s})];
                    merged.extend(a);
                    Value::Array(merged)
                }
                (existing, _) => existing,
            };
        }

        result
    }

    /// "anthropic/claude-sonnet-4-20250514" in config, "claude-sonnet-4-20250514" on the wire.
    fn normalize_model(model: &str) -> &str {
        model.strip_prefix("anthropic/").unwrap_or(model)
    }

    fn parse_response(resp: AnthropicResponse) -> ProviderResponse {
        let mut text_parts: Vec<String> = Vec::new();
        let mut calls: Vec<ToolCallRequest> = Vec::new();

        for block in resp.content {
            match block.block_type.as_str() {
                "text" => {
                    if let Some(text) = block.text.filter(|t| !t.is_empty()) {
                        text_parts.push(text);
                    }
                }
                "tool_use" => {
                    if let (Some(id), Some(name)) = (block.id, block.name) {
                        let input = block
                            .input
                            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                        calls.push(ToolCallRequest { id, name, input });
                    }
                }
                _ => {}
            }
        }

        let text = if text_parts.is_empty() {
            None
        } else {
            Some(text_parts.join("\n"))
        };
        ProviderResponse::from_parts(text, calls)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn respond(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        tools: &[Value],
        images: &[ImageAttachment],
    ) -> Result<ProviderResponse> {
        let url = format!("{}/messages", self.api_base);
        let model = Self::normalize_model(&self.model);
        let (system, turns) = Self::convert_messages(system_prompt, messages, images);
        let anthropic_tools = Self::convert_tools(tools);

        let mut request = json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": turns,
        });
        if let Some(sys) = system {
            request["system"] = Value::String(sys);
        }
        if !anthropic_tools.is_empty() {
            request["tools"] = Value::Array(anthropic_tools);
        }

        info!(
            url = %url,
            model = %model,
            tools_count = tools.len(),
            messages_count = messages.len(),
            "Calling Anthropic API"
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_reqwest_error("anthropic", e))?;

        let status = response.status();
        let raw_body = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error("anthropic", e))?;

        if !status.is_success() {
            error!(status = %status, body = %preview(&raw_body), "Anthropic API error");
            return Err(classify_status("anthropic", status, &raw_body));
        }
        debug!(body_len = raw_body.len(), "Anthropic raw response");

        let resp: AnthropicResponse = serde_json::from_str(&raw_body).map_err(|e| {
            Error::Provider(format!(
                "Failed to parse Anthropic response: {}. Body: {}",
                e,
                preview(&raw_body)
            ))
        })?;

        let parsed = Self::parse_response(resp);
        info!(
            tool_calls_count = parsed.tool_calls().len(),
            "Anthropic response parsed"
        );
        Ok(parsed)
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

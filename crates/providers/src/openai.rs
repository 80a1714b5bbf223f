use async_trait::async_trait;
use relaycell_core::types::{ChatMessage, ImageAttachment, ProviderResponse, Role, ToolCallRequest};
use relaycell_core::{Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{
    build_http_client, classify_reqwest_error, classify_status, data_uri, image_target,
    parse_text_tool_calls, preview,
};
use crate::Provider;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Adapter for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAIProvider {
    pub fn new(
        api_key: &str,
        api_base: Option<&str>,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> Self {
        let api_base = api_base
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/')
            .to_string();
        Self {
            client: build_http_client(timeout),
            api_key: api_key.to_string(),
            api_base,
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }

    /// "openai/gpt-4o" in config, "gpt-4o" on the wire.
    fn normalize_model(model: &str) -> &str {
        model.strip_prefix("openai/").unwrap_or(model)
    }

    fn convert_messages(
        system_prompt: &str,
        messages: &[ChatMessage],
        images: &[ImageAttachment],
    ) -> Vec<Value> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if !system_prompt.is_empty() {
            out.push(json!({"role": "system", "content": system_prompt}));
        }

        let target = if images.is_empty() {
            None
        } else {
            image_target(messages)
        };

        for (i, msg) in messages.iter().enumerate() {
            match msg.role {
                Role::System => out.push(json!({"role": "system", "content": msg.content})),
                Role::User if Some(i) == target => {
                    let mut parts = vec![json!({"type": "text", "text": msg.content})];
                    for image in images {
                        parts.push(json!({
                            "type": "image_url",
                            "image_url": {"url": data_uri(image)}
                        }));
                    }
                    out.push(json!({"role": "user", "content": parts}));
                }
                Role::User => out.push(json!({"role": "user", "content": msg.content})),
                Role::Assistant => {
                    let content = if msg.content.is_empty() {
                        Value::Null
                    } else {
                        Value::String(msg.content.clone())
                    };
                    let mut turn = json!({"role": "assistant", "content": content});
                    if msg.has_tool_calls() {
                        turn["tool_calls"] = msg
                            .tool_calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {"name": tc.name, "arguments": tc.input.to_string()}
                                })
                            })
                            .collect();
                    }
                    out.push(turn);
                }
                Role::Tool => out.push(json!({
                    "role": "tool",
                    "tool_call_id": msg.tool_call_id.as_deref().unwrap_or(""),
                    "content": msg.content,
                })),
            }
        }
        out
    }

    fn parse_response(body: ChatResponse, tools_requested: bool) -> Result<ProviderResponse> {
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider("No choices in response".to_string()))?;

        let calls: Vec<ToolCallRequest> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let input = serde_json::from_str(&tc.function.arguments)
                    .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
                ToolCallRequest {
                    id: tc.id,
                    name: tc.function.name,
                    input,
                }
            })
            .collect();
        let content = choice.message.content.unwrap_or_default();

        // Some relays answer tool requests in prose instead of native tool_calls
        if calls.is_empty() && tools_requested {
            let (remaining, parsed) = parse_text_tool_calls(&content, "text_call");
            if !parsed.is_empty() {
                info!(count = parsed.len(), "Parsed text-based tool calls");
                return Ok(ProviderResponse::from_parts(Some(remaining), parsed));
            }
        }

        Ok(ProviderResponse::from_parts(Some(content), calls))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    id: String,
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[async_trait]
impl Provider for OpenAIProvider {
    async fn respond(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        tools: &[Value],
        images: &[ImageAttachment],
    ) -> Result<ProviderResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        let model = Self::normalize_model(&self.model);
        let request = ChatRequest {
            model,
            messages: Self::convert_messages(system_prompt, messages, images),
            tools: Some(tools).filter(|t| !t.is_empty()),
            tool_choice: if tools.is_empty() { None } else { Some("auto") },
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        info!(
            url = %url,
            model = %model,
            tools_count = tools.len(),
            messages_count = messages.len(),
            images = images.len(),
            "Calling LLM"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_reqwest_error("openai", e))?;

        let status = response.status();
        let raw_body = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error("openai", e))?;

        if !status.is_success() {
            error!(status = %status, body = %preview(&raw_body), "LLM API error");
            return Err(classify_status("openai", status, &raw_body));
        }
        debug!(body_len = raw_body.len(), preview = %preview(&raw_body), "LLM raw response");

        let body: ChatResponse = serde_json::from_str(&raw_body).map_err(|e| {
            Error::Provider(format!(
                "Failed to parse response: {}. Body: {}",
                e,
                preview(&raw_body)
            ))
        })?;
        Self::parse_response(body, !tools.is_empty())
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_messages_with_tools_and_images() {
        let call = ToolCallRequest::new("call_1", "list_agents", json!({"verbose": true}));
        let messages = vec![
            ChatMessage::user("who is around?"),
            ChatMessage::assistant_with_tools("", vec![call]),
            ChatMessage::tool_result("call_1", "list_agents", "[\"planner\"]"),
        ];
        let images = vec![ImageAttachment::new("image/png", vec![0, 1])];
        let out = OpenAIProvider::convert_messages("be brief", &messages, &images);

        assert_eq!(out.len(), 4);
        assert_eq!(out[0]["role"], "system");
        assert_eq!(out[1]["content"][1]["type"], "image_url");
        assert!(out[1]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
        assert!(out[2]["content"].is_null());
        assert_eq!(out[2]["tool_calls"][0]["function"]["name"], "list_agents");
        assert_eq!(
            out[2]["tool_calls"][0]["function"]["arguments"],
            "{\"verbose\":true}"
        );
        assert_eq!(out[3]["role"], "tool");
        assert_eq!(out[3]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_convert_messages_without_system_prompt() {
        let out = OpenAIProvider::convert_messages("", &[ChatMessage::user("hi")], &[]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["content"], "hi");
    }

    #[test]
    fn test_parse_native_tool_calls() {
        let body: ChatResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "call_agent", "arguments": "{\"agent\":\"b\",\"message\":\"go\"}"}
                    }]
                }
            }]
        }))
        .unwrap();
        let resp = OpenAIProvider::parse_response(body, true).unwrap();
        let calls = resp.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_9");
        assert_eq!(calls[0].input["agent"], "b");
        assert_eq!(resp.text(), None);
    }

    #[test]
    fn test_parse_text_answer() {
        let body: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": "All done."}}]
        }))
        .unwrap();
        let resp = OpenAIProvider::parse_response(body, true).unwrap();
        assert_eq!(
            resp,
            ProviderResponse::Text {
                text: "All done.".to_string()
            }
        );
    }

    #[test]
    fn test_parse_text_fallback_tool_call() {
        let body: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": "<tool_call>{\"name\": \"list_agents\", \"arguments\": {}}</tool_call>"}}]
        }))
        .unwrap();
        let resp = OpenAIProvider::parse_response(body, true).unwrap();
        assert_eq!(resp.tool_calls()[0].name, "list_agents");
    }

    #[test]
    fn test_empty_choices_is_provider_error() {
        let body: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(
            OpenAIProvider::parse_response(body, false),
            Err(Error::Provider(_))
        ));
    }

    #[test]
    fn test_normalize_model() {
        assert_eq!(OpenAIProvider::normalize_model("openai/gpt-4o"), "gpt-4o");
        assert_eq!(OpenAIProvider::normalize_model("gpt-4o"), "gpt-4o");
    }
}

use base64::Engine;
use relaycell_core::types::{ChatMessage, ImageAttachment, Role, ToolCallRequest};
use relaycell_core::Error;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// Build the shared HTTP client. The timeout covers the whole request, so a
/// stalled backend surfaces as a transient failure instead of hanging a Runner.
pub fn build_http_client(timeout: Duration) -> Client {
    Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client, using default");
        Client::new()
    })
}

/// Largest byte index <= `max_bytes` on a char boundary.
pub(crate) fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

pub(crate) fn preview(body: &str) -> &str {
    &body[..truncate_at_char_boundary(body, 500)]
}

/// Map a non-success HTTP status onto the error taxonomy.
pub fn classify_status(provider: &str, status: StatusCode, body: &str) -> Error {
    let msg = format!("{} API error {}: {}", provider, status, preview(body));
    match status.as_u16() {
        401 | 403 => Error::Config(msg),
        408 | 429 => Error::Transient(msg),
        s if s >= 500 => Error::Transient(msg),
        _ => Error::Provider(msg),
    }
}

pub fn classify_reqwest_error(provider: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() {
        Error::Transient(format!("{} request failed: {}", provider, e))
    } else if let Some(status) = e.status() {
        classify_status(provider, status, "")
    } else {
        Error::Provider(format!("{} request failed: {}", provider, e))
    }
}

/// Pull `<tool_call>{"name": ..., "arguments": {...}}</tool_call>` blocks out of
/// plain text, for models that answer tool requests in prose.
/// Returns the remaining text and the parsed calls.
pub(crate) fn parse_text_tool_calls(content: &str, id_prefix: &str) -> (String, Vec<ToolCallRequest>) {
    const OPEN: &str = "<tool_call>";
    const CLOSE: &str = "</tool_call>";

    let mut calls = Vec::new();
    let mut remaining = String::new();
    let mut rest = content;

    while let Some(start) = rest.find(OPEN) {
        remaining.push_str(&rest[..start]);
        let after_tag = &rest[start + OPEN.len()..];
        let Some(end) = after_tag.find(CLOSE) else {
            remaining.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let json_str = after_tag[..end].trim();
        match serde_json::from_str::<Value>(json_str) {
            Ok(val) => {
                let name = val
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let input = val
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                let id = format!("{}_{}", id_prefix, calls.len());
                calls.push(ToolCallRequest { id, name, input });
            }
            Err(_) => {
                warn!(json = %json_str, "Failed to parse tool_call JSON");
                remaining.push_str(&rest[start..start + OPEN.len() + end + CLOSE.len()]);
            }
        }
        rest = &after_tag[end + CLOSE.len()..];
    }
    remaining.push_str(rest);

    (remaining.trim().to_string(), calls)
}

/// Index of the turn images are attached to: the newest user turn.
pub(crate) fn image_target(messages: &[ChatMessage]) -> Option<usize> {
    messages.iter().rposition(|m| m.role == Role::User)
}

pub(crate) fn base64_image(image: &ImageAttachment) -> String {
    base64::engine::general_purpose::STANDARD.encode(&image.bytes)
}

pub(crate) fn data_uri(image: &ImageAttachment) -> String {
    format!("data:{};base64,{}", image.mime_type, base64_image(image))
}

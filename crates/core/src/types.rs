use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single tool invocation requested by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default = "empty_object")]
    pub input: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl ToolCallRequest {
    pub fn new(id: &str, name: &str, input: Value) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            input,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Provider-agnostic conversation turn. Each adapter converts these into its
/// own wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn with_role(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: &str) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: &str) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Assistant turn that carries the raw tool-call blocks so providers can
    /// replay it faithfully on the next request.
    pub fn assistant_with_tools(content: &str, tool_calls: Vec<ToolCallRequest>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.tool_calls = tool_calls;
        msg
    }

    pub fn tool_result(tool_call_id: &str, tool_name: &str, content: &str) -> Self {
        let mut msg = Self::with_role(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.to_string());
        msg.name = Some(tool_name.to_string());
        msg
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Opaque image attachment. Adapters embed it in their own wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImageAttachment {
    pub fn new(mime_type: &str, bytes: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            bytes,
        }
    }

    /// Guess the mime type from a file extension, defaulting to PNG.
    pub fn mime_for_path(path: &std::path::Path) -> &'static str {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            _ => "image/png",
        }
    }
}

/// What a provider answered: either plain text, or a set of tool invocations
/// optionally accompanied by some text.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResponse {
    Text {
        text: String,
    },
    ToolCalls {
        text: Option<String>,
        calls: Vec<ToolCallRequest>,
    },
}

impl ProviderResponse {
    /// Build a response from the parts every adapter extracts from its wire reply.
    pub fn from_parts(text: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        let text = text.filter(|t| !t.trim().is_empty());
        if calls.is_empty() {
            ProviderResponse::Text {
                text: text.unwrap_or_default(),
            }
        } else {
            ProviderResponse::ToolCalls { text, calls }
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            ProviderResponse::Text { text } => Some(text.as_str()).filter(|t| !t.is_empty()),
            ProviderResponse::ToolCalls { text, .. } => text.as_deref(),
        }
    }

    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        match self {
            ProviderResponse::Text { .. } => &[],
            ProviderResponse::ToolCalls { calls, .. } => calls,
        }
    }
}

/// A tool asked for human approval instead of returning a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub tool_name: String,
    pub call_id: String,
    pub payload: String,
}

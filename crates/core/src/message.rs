use serde::{Deserialize, Serialize};

use crate::types::ApprovalRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    Answer,
    Cancelled,
    Failure,
    ApprovalRequired,
    Notification,
}

/// Something routed back to a requester through its channel handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub kind: OutboundKind,
    pub handle: String,
    pub task_id: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalRequest>,
    pub timestamp_ms: i64,
}

impl OutboundMessage {
    pub fn new(kind: OutboundKind, handle: &str, content: &str) -> Self {
        Self {
            kind,
            handle: handle.to_string(),
            task_id: None,
            content: content.to_string(),
            approval: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            OutboundKind::Answer | OutboundKind::Cancelled | OutboundKind::Failure
        )
    }
}

use async_trait::async_trait;
use relaycell_core::{Error, Result};
use serde_json::{json, Value};
use tracing::info;

use crate::{str_param, Tool, ToolContext, ToolSchema};

const LEVELS: [&str; 3] = ["info", "warning", "success"];

/// Sends an interim message to whoever is waiting on the current task,
/// without finishing it.
pub struct NotificationTool;

#[async_trait]
impl Tool for NotificationTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "send_notification",
            description: "Send a short progress update to the person waiting on this task. \
                The task keeps running; use this for long jobs, not for the final answer.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "Notification text"
                    },
                    "level": {
                        "type": "string",
                        "enum": LEVELS,
                        "description": "Severity, defaults to info"
                    }
                },
                "required": ["message"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        if str_param(params, "message").is_none() {
            return Err(Error::Validation("Missing required parameter: message".to_string()));
        }
        if let Some(level) = params.get("level").and_then(|v| v.as_str()) {
            if !LEVELS.contains(&level) {
                return Err(Error::Validation(format!("Unknown level: {}", level)));
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<Value> {
        let message = str_param(&params, "message").unwrap_or_default();
        let level = str_param(&params, "level").unwrap_or("info");

        let notifier = ctx.notifier.as_ref().ok_or_else(|| {
            Error::Tool("Notifications are not available in this context".to_string())
        })?;
        if ctx.requester_channel.is_empty() {
            return Err(Error::Tool("Task has no requester channel to notify".to_string()));
        }

        let text = if level == "info" {
            message.to_string()
        } else {
            format!("[{}] {}", level, message)
        };
        notifier
            .notify(&ctx.requester_channel, &ctx.task_id, &ctx.agent_name, &text)
            .await?;

        info!(
            agent = %ctx.agent_name,
            task_id = %ctx.task_id,
            channel = %ctx.requester_channel,
            level,
            "Notification sent"
        );
        Ok(json!({"status": "sent", "channel": ctx.requester_channel}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ctx, FakeNotifier};
    use std::sync::Arc;

    #[test]
    fn test_validate() {
        let tool = NotificationTool;
        assert!(tool.validate(&json!({"message": "halfway"})).is_ok());
        assert!(tool.validate(&json!({"message": "x", "level": "warning"})).is_ok());
        assert!(tool.validate(&json!({"message": "x", "level": "panic"})).is_err());
        assert!(tool.validate(&json!({})).is_err());
    }

    #[tokio::test]
    async fn test_sends_to_requester_channel() {
        let notifier = Arc::new(FakeNotifier::default());
        let ctx = ctx().with_notifier(notifier.clone());
        NotificationTool
            .execute(&ctx, json!({"message": "halfway", "level": "warning"}))
            .await
            .unwrap();
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent[0], ("gui:s1".to_string(), "[warning] halfway".to_string()));
    }

    #[tokio::test]
    async fn test_requires_channel() {
        let ctx = ToolContext::new(1, "a", "t").with_notifier(Arc::new(FakeNotifier::default()));
        let err = NotificationTool
            .execute(&ctx, json!({"message": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool(_)));
    }
}

use async_trait::async_trait;
use relaycell_core::{Error, Result};
use serde_json::{json, Value};
use tracing::info;

use crate::{str_param, Tool, ToolContext, ToolSchema};

/// Hands a piece of work to another agent. The answer arrives later as a
/// report on the current task, not as this tool's result.
pub struct CallAgentTool;

#[async_trait]
impl Tool for CallAgentTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "call_agent",
            description: "Delegate a task to another agent. The other agent works on it \
                asynchronously and its result is reported back to you before you continue. \
                Use list_agents to see who is available. Do not wait for or poll the result.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "agent": {
                        "type": "string",
                        "description": "Name of the agent to delegate to"
                    },
                    "message": {
                        "type": "string",
                        "description": "Self-contained instructions for the other agent"
                    }
                },
                "required": ["agent", "message"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        if str_param(params, "agent").is_none() {
            return Err(Error::Validation("Missing required parameter: agent".to_string()));
        }
        if str_param(params, "message").is_none() {
            return Err(Error::Validation("Missing required parameter: message".to_string()));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<Value> {
        let target = str_param(&params, "agent").unwrap_or_default();
        let message = str_param(&params, "message").unwrap_or_default();

        if target == ctx.agent_name {
            return Err(Error::Validation(
                "An agent cannot delegate to itself".to_string(),
            ));
        }

        let handle = ctx.delegation.as_ref().ok_or_else(|| {
            Error::Tool("Delegation is not available in this context".to_string())
        })?;

        let child_task_id = handle
            .delegate(&ctx.task_id, &ctx.agent_name, target, &ctx.context_id, message)
            .await?;
        ctx.delegations.record(&child_task_id);

        info!(
            from = %ctx.agent_name,
            to = %target,
            parent_task_id = %ctx.task_id,
            child_task_id = %child_task_id,
            "Delegated task"
        );

        Ok(json!({
            "status": "delegated",
            "childTaskId": child_task_id,
            "agent": target,
            "note": format!("{} will report back when done. Finish your turn now.", target)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ctx, FakeDelegation};
    use std::sync::Arc;

    #[test]
    fn test_validate() {
        let tool = CallAgentTool;
        assert!(tool.validate(&json!({"agent": "b", "message": "go"})).is_ok());
        assert!(tool.validate(&json!({"agent": "b"})).is_err());
        assert!(tool.validate(&json!({"agent": " ", "message": "go"})).is_err());
        assert!(tool.validate(&json!({})).is_err());
    }

    #[tokio::test]
    async fn test_delegates_and_records_child() {
        let fake = Arc::new(FakeDelegation::default());
        let ctx = ctx().with_delegation(fake.clone());
        let out = CallAgentTool
            .execute(&ctx, json!({"agent": "researcher", "message": "find sources"}))
            .await
            .unwrap();

        assert_eq!(out["status"], "delegated");
        assert_eq!(out["childTaskId"], "child-1");
        assert_eq!(ctx.delegations.delegated(), vec!["child-1".to_string()]);

        let calls = fake.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            (
                "task-1".to_string(),
                "planner".to_string(),
                "researcher".to_string(),
                "find sources".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_self_delegation_rejected() {
        let fake = Arc::new(FakeDelegation::default());
        let ctx = ctx().with_delegation(fake.clone());
        let err = CallAgentTool
            .execute(&ctx, json!({"agent": "planner", "message": "loop"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(fake.calls.lock().unwrap().is_empty());
        assert!(ctx.delegations.is_empty());
    }

    #[tokio::test]
    async fn test_missing_handle() {
        let err = CallAgentTool
            .execute(&ctx(), json!({"agent": "researcher", "message": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool(_)));
    }

    #[tokio::test]
    async fn test_unknown_target_not_recorded() {
        let ctx = ctx().with_delegation(Arc::new(FakeDelegation::default()));
        let err = CallAgentTool
            .execute(&ctx, json!({"agent": "ghost", "message": "boo"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(ctx.delegations.is_empty());
    }
}

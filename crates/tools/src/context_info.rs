use async_trait::async_trait;
use relaycell_core::Result;
use serde_json::{json, Value};

use crate::{Tool, ToolContext, ToolSchema};

pub struct ContextInfoTool;

#[async_trait]
impl Tool for ContextInfoTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_context_info",
            description: "Return who you are, which task you are working on and which \
                delegations you have issued in this turn.",
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &ToolContext, _params: Value) -> Result<Value> {
        Ok(json!({
            "agentId": ctx.agent_id,
            "agentName": ctx.agent_name,
            "taskId": ctx.task_id,
            "contextId": ctx.context_id,
            "requesterChannel": ctx.requester_channel,
            "workingDir": ctx.working_dir.display().to_string(),
            "delegationsThisRun": ctx.delegations.delegated(),
        }))
    }
}

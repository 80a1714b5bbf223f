use async_trait::async_trait;
use relaycell_core::{Error, Result};
use serde_json::{json, Value};

use crate::{Tool, ToolContext, ToolSchema};

pub struct ListAgentsTool;

#[async_trait]
impl Tool for ListAgentsTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "list_agents",
            description: "List the other agents you can delegate to with call_agent.",
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
        let directory = ctx.directory.as_ref().ok_or_else(|| {
            Error::Tool("Agent directory is not available in this context".to_string())
        })?;

        let agents: Vec<Value> = directory
            .list_agents()?
            .into_iter()
            .filter(|a| a.name != ctx.agent_name)
            .map(|a| json!({"name": a.name, "kind": a.kind, "description": a.description}))
            .collect();

        Ok(json!({ "count": agents.len(), "agents": agents }))
    }
}

use async_trait::async_trait;
use relaycell_core::{Error, Result};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::call_agent::CallAgentTool;
use crate::context_info::ContextInfoTool;
use crate::list_agents::ListAgentsTool;
use crate::notification::NotificationTool;
use crate::{Tool, ToolContext, ToolExecutor};

/// Name-keyed tool table. Names it does not know are forwarded to an
/// optional external executor.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    aliases: HashMap<String, String>,
    external: Option<Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The delegation-adjacent tools every agent gets.
    pub fn with_system_tools() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CallAgentTool));
        registry.alias("delegate", "call_agent");
        registry.register(Arc::new(ListAgentsTool));
        registry.register(Arc::new(NotificationTool));
        registry.register(Arc::new(ContextInfoTool));
        registry
    }

    pub fn with_external(mut self, external: Arc<dyn ToolExecutor>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let schema = tool.schema();
        debug!(name = schema.name, "Registering tool");
        self.tools.insert(schema.name.to_string(), tool);
    }

    /// Make `alias` run `target`. Aliases are accepted on execute but not
    /// advertised in schemas.
    pub fn alias(&mut self, alias: &str, target: &str) {
        self.aliases.insert(alias.to_string(), target.to_string());
    }

    fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(self.resolve(name))
    }

    /// Registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    fn schema_json(tool: &Arc<dyn Tool>) -> Value {
        let schema = tool.schema();
        json!({
            "type": "function",
            "function": {
                "name": schema.name,
                "description": schema.description,
                "parameters": schema.parameters
            }
        })
    }

    /// Schemas of the local tools only, sorted by name.
    pub fn get_tool_schemas(&self) -> Vec<Value> {
        self.tool_names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(Self::schema_json)
            .collect()
    }

    /// Local schemas restricted to `names`.
    pub fn get_filtered_schemas(&self, names: &[&str]) -> Vec<Value> {
        self.get_tool_schemas()
            .into_iter()
            .filter(|s| {
                s["function"]["name"]
                    .as_str()
                    .map(|n| names.contains(&n))
                    .unwrap_or(false)
            })
            .collect()
    }
}

/// Strings go back to the model as-is; anything else as compact JSON.
fn value_to_result(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, name: &str, input: Value, ctx: &ToolContext) -> Result<String> {
        let Some(tool) = self.get(name) else {
            return match &self.external {
                Some(external) => {
                    debug!(tool = name, "Forwarding to external tool registry");
                    external.execute(name, input, ctx).await
                }
                None => Err(Error::Tool(format!("Unknown tool: {}", name))),
            };
        };

        if let Err(e) = tool.validate(&input) {
            warn!(tool = name, error = %e, "Tool validation failed");
            return Err(e);
        }

        debug!(tool = name, agent = %ctx.agent_name, task_id = %ctx.task_id, "Executing tool");
        tool.execute(ctx, input).await.map(value_to_result)
    }

    fn schemas(&self) -> Vec<Value> {
        let mut schemas = self.get_tool_schemas();
        if let Some(external) = &self.external {
            let local: HashSet<String> = self.tools.keys().cloned().collect();
            schemas.extend(external.schemas().into_iter().filter(|s| {
                s["function"]["name"]
                    .as_str()
                    .map(|n| !local.contains(n))
                    .unwrap_or(false)
            }));
        }
        schemas
    }
}

pub mod call_agent;
pub mod context_info;
pub mod list_agents;
pub mod notification;
pub mod registry;

use async_trait::async_trait;
use relaycell_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub use registry::ToolRegistry;

/// Prefix a tool result carries when it needs a human decision instead of
/// being fed back to the model.
pub const APPROVAL_SENTINEL: &str = "__REQUIRES_APPROVAL__:";

/// Truncate a string to at most `max_bytes` bytes, respecting UTF-8 char boundaries.
pub fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Issues delegations on behalf of a tool. Implemented by the agent crate,
/// which keeps this crate free of a dependency on it.
#[async_trait]
pub trait DelegationOps: Send + Sync {
    /// Hand `message` to `target_agent` as a child of `parent_task_id`.
    /// Returns the child task id.
    async fn delegate(
        &self,
        parent_task_id: &str,
        from_agent: &str,
        target_agent: &str,
        context_id: &str,
        message: &str,
    ) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub name: String,
    pub kind: String,
    pub description: String,
}

pub trait AgentDirectoryOps: Send + Sync {
    fn list_agents(&self) -> Result<Vec<AgentSummary>>;
}

/// Pushes an interim message to whoever is waiting on a requester channel.
#[async_trait]
pub trait NotificationOps: Send + Sync {
    async fn notify(&self, handle: &str, task_id: &str, from_agent: &str, message: &str)
        -> Result<()>;
}

/// Answers whether a task has been cancelled since its run started.
pub trait CancelOps: Send + Sync {
    fn is_cancelled(&self, task_id: &str) -> bool;
}

pub type DelegationHandle = Arc<dyn DelegationOps>;
pub type DirectoryHandle = Arc<dyn AgentDirectoryOps>;
pub type NotificationHandle = Arc<dyn NotificationOps>;
pub type CancelHandle = Arc<dyn CancelOps>;

/// Child task ids created during one ToolLoop run.
#[derive(Debug, Clone, Default)]
pub struct DelegationLog {
    inner: Arc<Mutex<Vec<String>>>,
}

impl DelegationLog {
    pub fn record(&self, child_task_id: &str) {
        if let Ok(mut ids) = self.inner.lock() {
            ids.push(child_task_id.to_string());
        }
    }

    pub fn delegated(&self) -> Vec<String> {
        self.inner.lock().map(|ids| ids.clone()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map(|ids| ids.is_empty()).unwrap_or(true)
    }
}

/// Everything a tool may know about the run that invoked it. Built fresh by
/// the Runner for every ToolLoop run.
#[derive(Clone)]
pub struct ToolContext {
    pub agent_id: i64,
    pub agent_name: String,
    pub task_id: String,
    pub context_id: String,
    pub requester_channel: String,
    pub working_dir: PathBuf,
    pub delegation: Option<DelegationHandle>,
    pub directory: Option<DirectoryHandle>,
    pub notifier: Option<NotificationHandle>,
    pub cancel: Option<CancelHandle>,
    pub delegations: DelegationLog,
}

impl ToolContext {
    pub fn new(agent_id: i64, agent_name: &str, task_id: &str) -> Self {
        Self {
            agent_id,
            agent_name: agent_name.to_string(),
            task_id: task_id.to_string(),
            context_id: "default".to_string(),
            requester_channel: String::new(),
            working_dir: PathBuf::from("."),
            delegation: None,
            directory: None,
            notifier: None,
            cancel: None,
            delegations: DelegationLog::default(),
        }
    }

    pub fn with_context_id(mut self, context_id: &str) -> Self {
        self.context_id = context_id.to_string();
        self
    }

    pub fn with_requester_channel(mut self, handle: &str) -> Self {
        self.requester_channel = handle.to_string();
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_delegation(mut self, handle: DelegationHandle) -> Self {
        self.delegation = Some(handle);
        self
    }

    pub fn with_directory(mut self, handle: DirectoryHandle) -> Self {
        self.directory = Some(handle);
        self
    }

    pub fn with_notifier(mut self, handle: NotificationHandle) -> Self {
        self.notifier = Some(handle);
        self
    }

    pub fn with_cancel(mut self, handle: CancelHandle) -> Self {
        self.cancel = Some(handle);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|c| c.is_cancelled(&self.task_id))
            .unwrap_or(false)
    }
}

pub struct ToolSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    fn validate(&self, params: &Value) -> Result<()>;
    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<Value>;
}

/// Runs tools by name. The ToolLoop only ever sees this interface.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, input: Value, ctx: &ToolContext) -> Result<String>;

    /// OpenAI-style function schemas for every tool this executor can run.
    fn schemas(&self) -> Vec<Value>;
}

pub(crate) fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use relaycell_core::Error;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    pub struct FakeDelegation {
        pub calls: StdMutex<Vec<(String, String, String, String)>>,
    }

    #[async_trait]
    impl DelegationOps for FakeDelegation {
        async fn delegate(
            &self,
            parent_task_id: &str,
            from_agent: &str,
            target_agent: &str,
            _context_id: &str,
            message: &str,
        ) -> Result<String> {
            if target_agent == "ghost" {
                return Err(Error::NotFound(format!("agent {}", target_agent)));
            }
            let mut calls = self.calls.lock().unwrap();
            calls.push((
                parent_task_id.to_string(),
                from_agent.to_string(),
                target_agent.to_string(),
                message.to_string(),
            ));
            Ok(format!("child-{}", calls.len()))
        }
    }

    pub struct FakeDirectory;

    impl AgentDirectoryOps for FakeDirectory {
        fn list_agents(&self) -> Result<Vec<AgentSummary>> {
            Ok(["planner", "researcher", "writer"]
                .iter()
                .map(|n| AgentSummary {
                    name: n.to_string(),
                    kind: "ai_agent".to_string(),
                    description: format!("the {}", n),
                })
                .collect())
        }
    }

    #[derive(Default)]
    pub struct FakeNotifier {
        pub sent: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl NotificationOps for FakeNotifier {
        async fn notify(
            &self,
            handle: &str,
            _task_id: &str,
            _from_agent: &str,
            message: &str,
        ) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((handle.to_string(), message.to_string()));
            Ok(())
        }
    }

    pub fn ctx() -> ToolContext {
        ToolContext::new(1, "planner", "task-1")
            .with_context_id("proj")
            .with_requester_channel("gui:s1")
    }
}

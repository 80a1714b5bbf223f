use async_trait::async_trait;
use relaycell_core::Result;
use relaycell_storage::AuditLogger;
use relaycell_tools::{ToolContext, ToolExecutor};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::warn;

pub type SharedAudit = Arc<Mutex<AuditLogger>>;

/// Run `f` against the audit log. Failures are logged and swallowed so that
/// auditing never fails a task.
pub fn with_audit<F>(audit: Option<&SharedAudit>, f: F)
where
    F: FnOnce(&mut AuditLogger) -> Result<()>,
{
    let Some(audit) = audit else {
        return;
    };
    match audit.lock() {
        Ok(mut logger) => {
            if let Err(e) = f(&mut logger) {
                warn!(error = %e, "Failed to write audit event");
            }
        }
        Err(e) => warn!(error = %e, "Audit logger lock poisoned"),
    }
}

/// Records every tool call that goes through the wrapped executor.
pub struct AuditingExecutor {
    inner: Arc<dyn ToolExecutor>,
    audit: SharedAudit,
}

impl AuditingExecutor {
    pub fn new(inner: Arc<dyn ToolExecutor>, audit: SharedAudit) -> Self {
        Self { inner, audit }
    }
}

#[async_trait]
impl ToolExecutor for AuditingExecutor {
    async fn execute(&self, name: &str, input: Value, ctx: &ToolContext) -> Result<String> {
        let params = input.clone();
        let start = Instant::now();
        let result = self.inner.execute(name, input, ctx).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let preview = match &result {
            Ok(text) => text.clone(),
            Err(e) => format!("Error: {}", e),
        };
        with_audit(Some(&self.audit), |log| {
            log.log_tool_call(
                &ctx.agent_name,
                &ctx.task_id,
                name,
                params,
                &preview,
                Some(duration_ms),
            )
        });
        result
    }

    fn schemas(&self) -> Vec<Value> {
        self.inner.schemas()
    }
}

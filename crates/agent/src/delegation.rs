use relaycell_core::{Error, Result};
use relaycell_storage::{
    AgentKind, DelegationContext, DelegationRecord, NewTask, PendingDelta, Store, Task,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::auditing::{with_audit, SharedAudit};
use crate::mailbox::{AgentKey, Envelope, Mailbox};

/// Result of folding one child report into its parent.
#[derive(Debug, Clone)]
pub struct AbsorbedReport {
    pub context: DelegationContext,
    pub remaining: i64,
    /// False when the report was a duplicate or named an unknown child; the
    /// counter did not move.
    pub counted: bool,
}

/// Owns the parent/child bookkeeping: child task rows, the parent's counter
/// and record list, and the envelopes that move between the two.
pub struct DelegationTracker {
    store: Store,
    mailbox: Arc<Mailbox>,
    audit: Option<SharedAudit>,
}

impl DelegationTracker {
    pub fn new(store: Store, mailbox: Arc<Mailbox>) -> Self {
        Self {
            store,
            mailbox,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: SharedAudit) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Create a child task for `target`, count it on the parent and queue it.
    /// Returns the child task id.
    pub async fn delegate(
        &self,
        parent_task_id: &str,
        target: &AgentKey,
        from_agent: &str,
        message: &str,
    ) -> Result<String> {
        self.store.create_agent(&target.agent, AgentKind::AiAgent)?;

        let parent = self
            .store
            .get_task(parent_task_id)?
            .ok_or_else(|| Error::NotFound(format!("parent task {}", parent_task_id)))?;
        let child = self.store.create_task(
            NewTask::child(&parent, &target.agent, message).with_context(&target.context_id),
        )?;

        let counted = self.store.modify_delegation_context(parent_task_id, |ctx| {
            ctx.push(DelegationRecord::new(&child.task_id, &target.agent, message));
            Ok(PendingDelta::Increment)
        });
        let pending = match counted {
            Ok((_, pending)) => pending,
            Err(e) => {
                // The parent never learned about this child, so it must not run
                if let Err(cleanup) = self.store.complete_task(&child.task_id) {
                    warn!(child_task_id = %child.task_id, error = %cleanup, "Failed to remove orphaned child task");
                }
                return Err(e);
            }
        };

        with_audit(self.audit.as_ref(), |log| {
            log.log_delegation(parent_task_id, &child.task_id, from_agent, &target.agent)
        });

        self.mailbox
            .enqueue(target, Envelope::delegation(&child.task_id, from_agent, message))
            .await;

        info!(
            parent_task_id = %parent_task_id,
            child_task_id = %child.task_id,
            from = %from_agent,
            to = %target,
            pending,
            "Delegation created"
        );
        Ok(child.task_id)
    }

    /// Queue a finished child's result for its parent agent.
    pub async fn report_back(&self, child: &Task, result: &str) -> Result<()> {
        let parent_task_id = child.parent_task_id.as_deref().ok_or_else(|| {
            Error::Validation(format!("task {} has no parent to report to", child.task_id))
        })?;

        let Some(parent) = self.store.get_task(parent_task_id)? else {
            warn!(
                parent_task_id = %parent_task_id,
                child_task_id = %child.task_id,
                "Parent task already finished, dropping report"
            );
            return Ok(());
        };

        let key = AgentKey::new(&parent.delegated_to, &parent.context_id);
        self.mailbox
            .enqueue(
                &key,
                Envelope::report(parent_task_id, &child.task_id, &child.delegated_to, result),
            )
            .await;
        info!(
            parent_task_id = %parent_task_id,
            child_task_id = %child.task_id,
            to = %key,
            "Report queued"
        );
        Ok(())
    }

    /// Mark the child's record completed and decrement the parent's counter,
    /// atomically. A child is only ever counted once.
    pub fn absorb_report(
        &self,
        parent_task_id: &str,
        child_task_id: &str,
        result: &str,
    ) -> Result<AbsorbedReport> {
        let mut counted = false;
        let (context, remaining) = self.store.modify_delegation_context(parent_task_id, |ctx| {
            if ctx.complete(child_task_id, result) {
                counted = true;
                Ok(PendingDelta::Decrement)
            } else {
                Ok(PendingDelta::Unchanged)
            }
        })?;

        if counted {
            info!(parent_task_id = %parent_task_id, child_task_id = %child_task_id, remaining, "Report absorbed");
        } else {
            warn!(
                parent_task_id = %parent_task_id,
                child_task_id = %child_task_id,
                "Ignoring duplicate or unknown report"
            );
        }
        Ok(AbsorbedReport {
            context,
            remaining,
            counted,
        })
    }
}

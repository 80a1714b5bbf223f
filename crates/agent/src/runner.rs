use relaycell_core::types::{ChatMessage, ToolCallRequest};
use relaycell_core::{Error, Result};
use relaycell_storage::{AgentKind, DelegationContext, Store, Task, TaskStatus};
use relaycell_tools::{
    DelegationHandle, DirectoryHandle, NotificationHandle, ToolContext, ToolExecutor,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, error, info, warn};

use crate::approval::PendingApprovals;
use crate::auditing::{with_audit, SharedAudit};
use crate::cancel::CancellationRegistry;
use crate::delegation::DelegationTracker;
use crate::mailbox::{AgentKey, Envelope, EnvelopeKind, Mailbox, DELEGATION_CHANNEL, INTERNAL_CHANNEL};
use crate::responder::Responder;
use crate::tool_loop::{LoopInput, LoopResult, StopReason, ToolLoop};

/// What a child reports when its tree was cancelled.
pub const CANCELLED_REPORT: &str = "Delegation cancelled";

const EMPTY_ANSWER: &str = "(no answer)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Polling,
    Processing,
    Delegating,
    Finalizing,
}

/// What one `tick` did with the envelope it took.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Skipped {
        task_id: Option<String>,
        reason: &'static str,
    },
    /// A report arrived but siblings are still outstanding.
    Waiting { task_id: String, remaining: i64 },
    Delegating {
        task_id: String,
        children: Vec<String>,
    },
    Answered { task_id: String },
    Reported { task_id: String },
    ApprovalRequested { task_id: String },
    Cancelled { task_id: String },
    Failed { task_id: String, error: String },
}

/// Everything a Runner shares with the rest of the agent system.
#[derive(Clone)]
pub struct RunnerEnv {
    pub store: Store,
    pub mailbox: Arc<Mailbox>,
    pub tracker: Arc<DelegationTracker>,
    pub responder: Arc<dyn Responder>,
    pub cancel: Arc<CancellationRegistry>,
    pub approvals: Arc<PendingApprovals>,
    pub delegation: Option<DelegationHandle>,
    pub directory: Option<DirectoryHandle>,
    pub notifier: Option<NotificationHandle>,
    pub audit: Option<SharedAudit>,
    pub working_dir: PathBuf,
    pub history_limit: usize,
    pub poll_interval: Duration,
}

/// Message channel name for a requester handle: `"gui:session-1"` -> `"gui"`.
pub(crate) fn channel_name(handle: &str) -> &str {
    handle.split(':').next().filter(|s| !s.is_empty()).unwrap_or(INTERNAL_CHANNEL)
}

/// Drains one agent's mailbox for one context and drives each envelope
/// through the ToolLoop to a terminal outcome.
pub struct Runner {
    key: AgentKey,
    agent_id: i64,
    env: RunnerEnv,
    tool_loop: ToolLoop,
    executor: Arc<dyn ToolExecutor>,
    system_prompt: String,
    state: RunnerState,
}

impl Runner {
    pub fn new(
        key: AgentKey,
        env: RunnerEnv,
        tool_loop: ToolLoop,
        executor: Arc<dyn ToolExecutor>,
        system_prompt: String,
    ) -> Result<Self> {
        let agent_id = env.store.create_agent(&key.agent, AgentKind::AiAgent)?;
        Ok(Self {
            key,
            agent_id,
            env,
            tool_loop,
            executor,
            system_prompt,
            state: RunnerState::Idle,
        })
    }

    pub fn key(&self) -> &AgentKey {
        &self.key
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Poll until shutdown. Wakes early when anything is enqueued.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            key = %self.key,
            provider = %self.tool_loop.provider_name(),
            poll_ms = self.env.poll_interval.as_millis() as u64,
            "Runner started"
        );
        loop {
            match shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => break,
            }

            if let Some(outcome) = self.tick().await {
                debug!(key = %self.key, ?outcome, "Cycle finished");
                continue;
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = self.env.mailbox.wait_for_work(self.env.poll_interval) => {}
            }
        }
        info!(key = %self.key, "Runner stopped");
    }

    /// Process at most one envelope.
    pub async fn tick(&mut self) -> Option<CycleOutcome> {
        self.state = RunnerState::Polling;
        let Some(envelope) = self.env.mailbox.drain_one(&self.key).await else {
            self.state = RunnerState::Idle;
            return None;
        };
        self.state = RunnerState::Processing;
        let outcome = self.process(envelope).await;
        self.state = RunnerState::Idle;
        Some(outcome)
    }

    async fn process(&mut self, envelope: Envelope) -> CycleOutcome {
        let Some(task_id) = envelope.resolve_task_id() else {
            warn!(key = %self.key, from = %envelope.from, "Envelope without task id, dropping");
            return CycleOutcome::Skipped {
                task_id: None,
                reason: "no task id",
            };
        };

        let task = match self.env.store.get_task(&task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(key = %self.key, task_id = %task_id, "Task already finished, skipping");
                return CycleOutcome::Skipped {
                    task_id: Some(task_id),
                    reason: "task finished",
                };
            }
            Err(e) => {
                error!(key = %self.key, task_id = %task_id, error = %e, "Failed to load task");
                return CycleOutcome::Failed {
                    task_id,
                    error: e.to_string(),
                };
            }
        };

        if task.status == TaskStatus::Cancelled {
            return CycleOutcome::Skipped {
                task_id: Some(task_id),
                reason: "task cancelled",
            };
        }

        info!(
            key = %self.key,
            task_id = %task.task_id,
            kind = ?envelope.kind,
            from = %envelope.from,
            "Processing envelope"
        );
        match self.handle(&task, envelope).await {
            Ok(outcome) => outcome,
            Err(e) => self.finish_failed(&task, e).await,
        }
    }

    async fn handle(&mut self, task: &Task, envelope: Envelope) -> Result<CycleOutcome> {
        let requester_kind = if task.is_root() {
            AgentKind::Human
        } else {
            AgentKind::AiAgent
        };
        let requester_id = self.env.store.create_agent(&task.requester, requester_kind)?;

        let (delegation_context, initial_message) = match envelope.kind {
            EnvelopeKind::Report => {
                let child_task_id = envelope.child_task_id.as_deref().ok_or_else(|| {
                    Error::Validation("report envelope without child task id".to_string())
                })?;
                let absorbed =
                    self.env
                        .tracker
                        .absorb_report(&task.task_id, child_task_id, &envelope.content)?;
                if !absorbed.counted {
                    return Ok(CycleOutcome::Skipped {
                        task_id: Some(task.task_id.clone()),
                        reason: "duplicate report",
                    });
                }
                if absorbed.remaining > 0 {
                    info!(
                        task_id = %task.task_id,
                        remaining = absorbed.remaining,
                        "Waiting for sibling delegations"
                    );
                    return Ok(CycleOutcome::Waiting {
                        task_id: task.task_id.clone(),
                        remaining: absorbed.remaining,
                    });
                }
                (absorbed.context, resume_prompt(task))
            }
            EnvelopeKind::Request | EnvelopeKind::Delegation => {
                (task.delegation_context.clone(), envelope.content.clone())
            }
        };

        let history = self.build_history(requester_id, &delegation_context)?;

        match envelope.kind {
            EnvelopeKind::Report => {
                let reporter_id = self
                    .env
                    .store
                    .create_agent(&envelope.from, AgentKind::AiAgent)?;
                self.env.store.save_message(
                    reporter_id,
                    self.agent_id,
                    &envelope.content,
                    INTERNAL_CHANNEL,
                )?;
            }
            EnvelopeKind::Request | EnvelopeKind::Delegation => {
                self.env.store.save_message(
                    requester_id,
                    self.agent_id,
                    &envelope.content,
                    &envelope.channel,
                )?;
            }
        }

        let ctx = self.tool_context(task);
        let input = LoopInput {
            system_prompt: self.system_prompt.clone(),
            initial_message,
            history,
            images: envelope.images,
            tools: self.executor.schemas(),
        };
        let result = self.tool_loop.run(input, self.executor.as_ref(), &ctx).await?;

        match &result.stop {
            StopReason::Cancelled => return Ok(self.finish_cancelled(task).await),
            StopReason::ApprovalRequired(request) => {
                if !result.text.is_empty() {
                    self.save_reply(task, requester_id, &result.text, &result.tool_calls)?;
                }
                self.env.approvals.park(&task.task_id, request.clone());
                self.env
                    .responder
                    .request_approval(&task.requester_channel, &task.task_id, request)
                    .await?;
                return Ok(CycleOutcome::ApprovalRequested {
                    task_id: task.task_id.clone(),
                });
            }
            StopReason::Answered | StopReason::DepthLimit => {}
        }

        let children = ctx.delegations.delegated();
        if !children.is_empty() {
            // A child now owns progress; the report will bring us back here
            self.state = RunnerState::Delegating;
            if !result.text.is_empty() {
                self.save_reply(task, requester_id, &result.text, &result.tool_calls)?;
            }
            info!(
                task_id = %task.task_id,
                children = children.len(),
                "Task waiting on delegations"
            );
            return Ok(CycleOutcome::Delegating {
                task_id: task.task_id.clone(),
                children,
            });
        }

        self.state = RunnerState::Finalizing;
        self.finalize(task, requester_id, &result).await
    }

    /// Own turns become assistant messages, everything else user messages,
    /// followed by one synthesized exchange per completed delegation.
    fn build_history(
        &self,
        requester_id: i64,
        delegation_context: &DelegationContext,
    ) -> Result<Vec<ChatMessage>> {
        let mut history: Vec<ChatMessage> = self
            .env
            .store
            .history_for(self.agent_id, requester_id, self.env.history_limit)?
            .into_iter()
            .map(|m| {
                if m.from_agent_id == self.agent_id {
                    ChatMessage::assistant(&m.content)
                } else {
                    ChatMessage::user(&m.content)
                }
            })
            .collect();

        for record in delegation_context.completed() {
            history.push(ChatMessage::assistant(&format!(
                "I delegated to {}: {}",
                record.agent, record.message
            )));
            history.push(ChatMessage::user(&format!(
                "{} reported back: {}",
                record.agent,
                record.result.as_deref().unwrap_or("")
            )));
        }
        Ok(history)
    }

    fn tool_context(&self, task: &Task) -> ToolContext {
        let mut ctx = ToolContext::new(self.agent_id, &self.key.agent, &task.task_id)
            .with_context_id(&task.context_id)
            .with_requester_channel(&task.requester_channel)
            .with_working_dir(self.env.working_dir.clone())
            .with_cancel(self.env.cancel.clone());
        if let Some(handle) = &self.env.delegation {
            ctx = ctx.with_delegation(handle.clone());
        }
        if let Some(handle) = &self.env.directory {
            ctx = ctx.with_directory(handle.clone());
        }
        if let Some(handle) = &self.env.notifier {
            ctx = ctx.with_notifier(handle.clone());
        }
        ctx
    }

    fn save_reply(
        &self,
        task: &Task,
        requester_id: i64,
        text: &str,
        tool_calls: &[ToolCallRequest],
    ) -> Result<()> {
        let channel = if task.is_root() {
            channel_name(&task.requester_channel)
        } else {
            DELEGATION_CHANNEL
        };
        let tool_calls = if tool_calls.is_empty() {
            None
        } else {
            Some(serde_json::to_value(tool_calls)?)
        };
        self.env.store.save_message_with_tool_calls(
            self.agent_id,
            requester_id,
            text,
            channel,
            tool_calls.as_ref(),
        )?;
        Ok(())
    }

    /// Save, delete the row, then deliver or report. The delete doubles as
    /// the exactly-once guard for delivery.
    async fn finalize(
        &mut self,
        task: &Task,
        requester_id: i64,
        result: &LoopResult,
    ) -> Result<CycleOutcome> {
        let text = if result.text.trim().is_empty() {
            EMPTY_ANSWER
        } else {
            result.text.as_str()
        };
        self.save_reply(task, requester_id, text, &result.tool_calls)?;

        if !self.env.store.complete_task(&task.task_id)? {
            warn!(task_id = %task.task_id, "Task finalized elsewhere, not delivering again");
            return Ok(CycleOutcome::Skipped {
                task_id: Some(task.task_id.clone()),
                reason: "task finished",
            });
        }

        let outcome = if task.is_root() {
            self.env
                .responder
                .deliver(&task.requester_channel, &task.task_id, text)
                .await?;
            CycleOutcome::Answered {
                task_id: task.task_id.clone(),
            }
        } else {
            self.env.tracker.report_back(task, text).await?;
            CycleOutcome::Reported {
                task_id: task.task_id.clone(),
            }
        };

        let label = if task.is_root() { "answered" } else { "reported" };
        self.audit_finalized(task, label);
        info!(
            key = %self.key,
            task_id = %task.task_id,
            outcome = label,
            provider_calls = result.provider_calls,
            stop = ?result.stop,
            "Task finalized"
        );
        Ok(outcome)
    }

    /// A run stopped by cancellation. Whoever moved the task to cancelled
    /// announces it, so the Runner only announces a transition it made.
    async fn finish_cancelled(&mut self, task: &Task) -> CycleOutcome {
        self.state = RunnerState::Finalizing;
        let announce = match self.env.store.mark_task_cancelled(&task.task_id) {
            Ok(marked) => marked,
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Failed to mark task cancelled");
                false
            }
        };

        if announce {
            let sent = if task.is_root() {
                self.env
                    .responder
                    .deliver_cancelled(&task.requester_channel, &task.task_id)
                    .await
            } else {
                self.env.tracker.report_back(task, CANCELLED_REPORT).await
            };
            if let Err(e) = sent {
                warn!(task_id = %task.task_id, error = %e, "Failed to announce cancellation");
            }
            self.audit_finalized(task, "cancelled");
        }

        info!(key = %self.key, task_id = %task.task_id, "Run stopped by cancellation");
        CycleOutcome::Cancelled {
            task_id: task.task_id.clone(),
        }
    }

    /// Every failure still produces a message, so the requester never waits
    /// on silence.
    async fn finish_failed(&mut self, task: &Task, err: Error) -> CycleOutcome {
        self.state = RunnerState::Finalizing;
        error!(key = %self.key, task_id = %task.task_id, error = %err, "Task failed");

        let announce = match self.env.store.complete_task(&task.task_id) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Failed to remove failed task");
                true
            }
        };

        if announce {
            let sent = if task.is_root() {
                self.env
                    .responder
                    .deliver_failure(
                        &task.requester_channel,
                        &task.task_id,
                        &format!("Sorry, the request failed: {}", err),
                    )
                    .await
            } else {
                self.env
                    .tracker
                    .report_back(task, &format!("Delegation failed: {}", err))
                    .await
            };
            if let Err(e) = sent {
                warn!(task_id = %task.task_id, error = %e, "Failed to announce failure");
            }
            self.audit_finalized(task, "failed");
        }

        CycleOutcome::Failed {
            task_id: task.task_id.clone(),
            error: err.to_string(),
        }
    }

    fn audit_finalized(&self, task: &Task, outcome: &str) {
        with_audit(self.env.audit.as_ref(), |log| {
            log.log_task_finalized(&task.task_id, &self.key.agent, outcome)
        });
    }
}

fn resume_prompt(task: &Task) -> String {
    format!(
        "All delegated work for this task has been reported back (see above). \
         Use those results to finish the original request: {}",
        task.original_request
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{text, tool_call, RecordingResponder, ScriptedProvider};
    use relaycell_core::OutboundKind;
    use relaycell_storage::NewTask;
    use relaycell_tools::ToolRegistry;

    fn runner(store: &Store, provider: Arc<ScriptedProvider>) -> (Runner, Arc<RecordingResponder>, Arc<Mailbox>) {
        runner_with(store, provider, Arc::new(ToolRegistry::with_system_tools()))
    }

    fn runner_with(
        store: &Store,
        provider: Arc<ScriptedProvider>,
        executor: Arc<dyn ToolExecutor>,
    ) -> (Runner, Arc<RecordingResponder>, Arc<Mailbox>) {
        let mailbox = Arc::new(Mailbox::new());
        let responder = Arc::new(RecordingResponder::default());
        let env = RunnerEnv {
            store: store.clone(),
            mailbox: mailbox.clone(),
            tracker: Arc::new(DelegationTracker::new(store.clone(), mailbox.clone())),
            responder: responder.clone(),
            cancel: Arc::new(CancellationRegistry::new(store.clone())),
            approvals: Arc::new(PendingApprovals::new()),
            delegation: None,
            directory: None,
            notifier: None,
            audit: None,
            working_dir: PathBuf::from("."),
            history_limit: 20,
            poll_interval: Duration::from_millis(10),
        };
        let runner = Runner::new(
            AgentKey::default_context("planner"),
            env,
            ToolLoop::new(provider),
            executor,
            "You plan.".to_string(),
        )
        .unwrap();
        (runner, responder, mailbox)
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(channel_name("gui:session-1"), "gui");
        assert_eq!(channel_name("cli"), "cli");
        assert_eq!(channel_name(""), INTERNAL_CHANNEL);
    }

    #[tokio::test]
    async fn test_tick_on_empty_mailbox() {
        let store = Store::open_in_memory().unwrap();
        let (mut runner, _, _) = runner(&store, Arc::new(ScriptedProvider::new(vec![])));
        assert!(runner.tick().await.is_none());
        assert_eq!(runner.state(), RunnerState::Idle);
    }

    #[tokio::test]
    async fn test_answers_root_request_and_persists() {
        let store = Store::open_in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![text("Trip planned.")]));
        let (mut runner, responder, mailbox) = runner(&store, provider.clone());

        let task = store
            .create_task(NewTask::root("user", "gui:s1", "planner", "plan a trip"))
            .unwrap();
        mailbox
            .enqueue(
                runner.key(),
                Envelope::request(&task.task_id, "user", "plan a trip", "gui"),
            )
            .await;

        let outcome = runner.tick().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Answered {
                task_id: task.task_id.clone()
            }
        );
        assert!(store.get_task(&task.task_id).unwrap().is_none());

        let sent = responder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, OutboundKind::Answer);
        assert_eq!(sent[0].handle, "gui:s1");
        assert_eq!(sent[0].content, "Trip planned.");

        let user = store.get_agent("user").unwrap().unwrap();
        let planner = store.get_agent("planner").unwrap().unwrap();
        let history = store.history_for(planner.id, user.id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "plan a trip");
        assert_eq!(history[1].content, "Trip planned.");
        assert_eq!(history[1].channel, "gui");
    }

    #[tokio::test]
    async fn test_history_is_fed_back() {
        let store = Store::open_in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![text("first"), text("second")]));
        let (mut runner, _, mailbox) = runner(&store, provider.clone());

        for msg in ["one", "two"] {
            let task = store
                .create_task(NewTask::root("user", "gui:s1", "planner", msg))
                .unwrap();
            mailbox
                .enqueue(runner.key(), Envelope::request(&task.task_id, "user", msg, "gui"))
                .await;
            runner.tick().await.unwrap();
        }

        let requests = provider.requests();
        let second = &requests[1];
        let contents: Vec<&str> = second.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "first", "two"]);
    }

    #[tokio::test]
    async fn test_missing_and_cancelled_tasks_are_skipped() {
        let store = Store::open_in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let (mut runner, responder, mailbox) = runner(&store, provider.clone());

        mailbox
            .enqueue(runner.key(), Envelope::request("ghost", "user", "hi", "gui"))
            .await;
        assert!(matches!(
            runner.tick().await.unwrap(),
            CycleOutcome::Skipped { reason: "task finished", .. }
        ));

        let task = store
            .create_task(NewTask::root("user", "gui:s1", "planner", "hi"))
            .unwrap();
        store.mark_task_cancelled(&task.task_id).unwrap();
        mailbox
            .enqueue(runner.key(), Envelope::request(&task.task_id, "user", "hi", "gui"))
            .await;
        assert!(matches!(
            runner.tick().await.unwrap(),
            CycleOutcome::Skipped { reason: "task cancelled", .. }
        ));

        assert!(provider.requests().is_empty());
        assert!(responder.sent().is_empty());
    }

    /// Cancels the requester's tasks the first time it runs, as a user
    /// pressing stop mid-run would.
    struct StopButton {
        store: Store,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ToolExecutor for StopButton {
        async fn execute(
            &self,
            _name: &str,
            _input: serde_json::Value,
            ctx: &ToolContext,
        ) -> Result<String> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.store.cancel_tasks_for_channel(&ctx.requester_channel)?;
            Ok("stopped".to_string())
        }

        fn schemas(&self) -> Vec<serde_json::Value> {
            vec![]
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_run_stops_before_next_tool() {
        let store = Store::open_in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call("c1", "stop", serde_json::json!({})),
            tool_call("c2", "stop", serde_json::json!({})),
            text("should not be reached"),
        ]));
        let tools = Arc::new(StopButton {
            store: store.clone(),
            calls: Default::default(),
        });
        let (mut runner, responder, mailbox) = runner_with(&store, provider.clone(), tools.clone());
        let task = store
            .create_task(NewTask::root("user", "gui:s1", "planner", "go"))
            .unwrap();
        mailbox
            .enqueue(runner.key(), Envelope::request(&task.task_id, "user", "go", "gui"))
            .await;

        assert_eq!(
            runner.tick().await.unwrap(),
            CycleOutcome::Cancelled {
                task_id: task.task_id.clone()
            }
        );
        assert_eq!(tools.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(provider.requests().len(), 2);
        // The canceller announces; the Runner adds nothing
        assert!(responder.sent().is_empty());
        let kept = store.get_task(&task.task_id).unwrap().unwrap();
        assert_eq!(kept.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_embedded_task_marker() {
        let store = Store::open_in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![text("ok")]));
        let (mut runner, responder, mailbox) = runner(&store, provider);
        let task = store
            .create_task(NewTask::root("user", "gui:s1", "planner", "hi"))
            .unwrap();

        let mut envelope = Envelope::request("", "user", "", "gui");
        envelope.task_id = None;
        envelope.content = format!("follow up on [task:{}]", task.task_id);
        mailbox.enqueue(runner.key(), envelope).await;

        assert!(matches!(
            runner.tick().await.unwrap(),
            CycleOutcome::Answered { .. }
        ));
        assert_eq!(responder.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_provider_failure_is_delivered_and_task_removed() {
        let store = Store::open_in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![Err(Error::Config(
            "no api key".to_string(),
        ))]));
        let (mut runner, responder, mailbox) = runner(&store, provider);
        let task = store
            .create_task(NewTask::root("user", "gui:s1", "planner", "hi"))
            .unwrap();
        mailbox
            .enqueue(runner.key(), Envelope::request(&task.task_id, "user", "hi", "gui"))
            .await;

        assert!(matches!(
            runner.tick().await.unwrap(),
            CycleOutcome::Failed { .. }
        ));
        let sent = responder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, OutboundKind::Failure);
        assert!(sent[0].content.contains("no api key"));
        assert!(store.get_task(&task.task_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Store::open_in_memory().unwrap();
        let (runner, _, _) = runner(&store, Arc::new(ScriptedProvider::new(vec![])));
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(runner.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

use async_trait::async_trait;
use relaycell_core::config::AgentProfile;
use relaycell_core::types::ImageAttachment;
use relaycell_core::{Config, Error, Result};
use relaycell_providers::{create_provider_for, Provider};
use relaycell_storage::{AgentKind, NewTask, Store, TaskStatus};
use relaycell_tools::{
    AgentDirectoryOps, AgentSummary, DelegationHandle, DelegationOps, DirectoryHandle,
    NotificationHandle, NotificationOps, ToolExecutor, ToolRegistry,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::approval::{ApprovalDecision, PendingApprovals};
use crate::auditing::{with_audit, AuditingExecutor, SharedAudit};
use crate::cancel::CancellationRegistry;
use crate::delegation::DelegationTracker;
use crate::mailbox::{AgentKey, Envelope, Mailbox};
use crate::responder::Responder;
use crate::runner::{channel_name, Runner, RunnerEnv};
use crate::tool_loop::ToolLoop;

/// Builds the provider an agent's ToolLoop talks to.
pub type ProviderFactory =
    Arc<dyn Fn(&AgentProfile) -> Result<Arc<dyn Provider>> + Send + Sync>;

/// A request arriving from outside the agent system.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub agent: String,
    pub context_id: String,
    pub from: String,
    /// Opaque handle the answer is routed back to, e.g. `"cli:42"`.
    pub handle: String,
    pub content: String,
    pub images: Vec<ImageAttachment>,
}

impl InboundRequest {
    pub fn new(agent: &str, from: &str, handle: &str, content: &str) -> Self {
        Self {
            agent: agent.to_string(),
            context_id: relaycell_storage::tasks::DEFAULT_CONTEXT_ID.to_string(),
            from: from.to_string(),
            handle: handle.to_string(),
            content: content.to_string(),
            images: Vec::new(),
        }
    }

    pub fn with_context(mut self, context_id: &str) -> Self {
        self.context_id = context_id.to_string();
        self
    }

    pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
        self.images = images;
        self
    }
}

struct Shared {
    me: Weak<Shared>,
    config: Config,
    store: Store,
    mailbox: Arc<Mailbox>,
    tracker: Arc<DelegationTracker>,
    responder: Arc<dyn Responder>,
    cancel: Arc<CancellationRegistry>,
    approvals: Arc<PendingApprovals>,
    providers: ProviderFactory,
    external_tools: Option<Arc<dyn ToolExecutor>>,
    audit: Option<SharedAudit>,
    working_dir: PathBuf,
    autospawn: bool,
    runners: Mutex<HashMap<AgentKey, JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    stopping: AtomicBool,
}

impl Shared {
    fn build_runner(&self, key: &AgentKey) -> Result<Runner> {
        let profile = self
            .config
            .profile(&key.agent)
            .ok_or_else(|| Error::NotFound(format!("agent '{}' is not in the roster", key.agent)))?;
        let provider = (self.providers)(profile)?;

        let defaults = &self.config.agents.defaults;
        let tool_loop = ToolLoop::new(provider)
            .with_max_depth(defaults.max_tool_depth)
            .with_retry(
                defaults.llm_max_retries,
                Duration::from_millis(defaults.llm_retry_delay_ms),
            );

        let mut registry = ToolRegistry::with_system_tools();
        if let Some(external) = &self.external_tools {
            registry = registry.with_external(external.clone());
        }
        let executor: Arc<dyn ToolExecutor> = match &self.audit {
            Some(audit) => Arc::new(AuditingExecutor::new(Arc::new(registry), audit.clone())),
            None => Arc::new(registry),
        };

        let me = self
            .me
            .upgrade()
            .ok_or_else(|| Error::Other("agent system is shutting down".to_string()))?;
        let env = RunnerEnv {
            store: self.store.clone(),
            mailbox: self.mailbox.clone(),
            tracker: self.tracker.clone(),
            responder: self.responder.clone(),
            cancel: self.cancel.clone(),
            approvals: self.approvals.clone(),
            delegation: Some(me.clone() as DelegationHandle),
            directory: Some(me.clone() as DirectoryHandle),
            notifier: Some(me as NotificationHandle),
            audit: self.audit.clone(),
            working_dir: self.working_dir.clone(),
            history_limit: self.config.runner.history_limit,
            poll_interval: Duration::from_millis(self.config.runner.poll_interval_ms),
        };

        Runner::new(
            key.clone(),
            env,
            tool_loop,
            executor,
            self.config.system_prompt_for(&key.agent),
        )
    }

    /// Start a runner for `key` unless a live one exists. Returns whether one
    /// was started.
    fn spawn_runner(&self, key: &AgentKey) -> Result<bool> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(Error::Other("agent system is shutting down".to_string()));
        }
        let mut runners = self
            .runners
            .lock()
            .map_err(|e| Error::Other(format!("Runner table lock error: {}", e)))?;
        if runners.get(key).is_some_and(|h| !h.is_finished()) {
            return Ok(false);
        }

        let runner = self.build_runner(key)?;
        let shutdown = self.shutdown_tx.subscribe();
        runners.insert(key.clone(), tokio::spawn(runner.run(shutdown)));
        info!(key = %key, "Runner spawned");
        Ok(true)
    }
}

#[async_trait]
impl DelegationOps for Shared {
    async fn delegate(
        &self,
        parent_task_id: &str,
        from_agent: &str,
        target_agent: &str,
        context_id: &str,
        message: &str,
    ) -> Result<String> {
        if self.config.profile(target_agent).is_none() {
            return Err(Error::NotFound(format!(
                "no agent named '{}'; use list_agents to see who is available",
                target_agent
            )));
        }
        let key = AgentKey::new(target_agent, context_id);
        if self.autospawn {
            self.spawn_runner(&key)?;
        }
        self.tracker
            .delegate(parent_task_id, &key, from_agent, message)
            .await
    }
}

impl AgentDirectoryOps for Shared {
    fn list_agents(&self) -> Result<Vec<AgentSummary>> {
        Ok(self
            .config
            .agents
            .roster
            .iter()
            .map(|p| AgentSummary {
                name: p.name.clone(),
                kind: AgentKind::AiAgent.as_str().to_string(),
                description: p.description.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl NotificationOps for Shared {
    async fn notify(
        &self,
        handle: &str,
        task_id: &str,
        from_agent: &str,
        message: &str,
    ) -> Result<()> {
        self.responder
            .notify(handle, task_id, &format!("{}: {}", from_agent, message))
            .await
    }
}

pub struct SystemBuilder {
    config: Config,
    store: Store,
    responder: Arc<dyn Responder>,
    providers: Option<ProviderFactory>,
    external_tools: Option<Arc<dyn ToolExecutor>>,
    audit: Option<SharedAudit>,
    working_dir: PathBuf,
    autospawn: bool,
}

impl SystemBuilder {
    pub fn provider_factory(mut self, factory: ProviderFactory) -> Self {
        self.providers = Some(factory);
        self
    }

    /// Tools the local registry does not know about are forwarded here.
    pub fn external_tools(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.external_tools = Some(executor);
        self
    }

    pub fn audit(mut self, audit: SharedAudit) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = dir;
        self
    }

    /// Never spawn runners; callers build them with [`AgentSystem::runner`]
    /// and drive them by hand.
    pub fn manual_runners(mut self) -> Self {
        self.autospawn = false;
        self
    }

    pub fn build(self) -> AgentSystem {
        let providers = match self.providers {
            Some(factory) => factory,
            None => {
                let config = self.config.clone();
                let factory: ProviderFactory = Arc::new(move |profile: &AgentProfile| {
                    let provider: Arc<dyn Provider> = create_provider_for(&config, profile)?.into();
                    Ok(provider)
                });
                factory
            }
        };

        let mailbox = Arc::new(Mailbox::new());
        let mut tracker = DelegationTracker::new(self.store.clone(), mailbox.clone());
        if let Some(audit) = &self.audit {
            tracker = tracker.with_audit(audit.clone());
        }
        let (shutdown_tx, _) = broadcast::channel(1);

        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            config: self.config,
            store: self.store.clone(),
            mailbox,
            tracker: Arc::new(tracker),
            responder: self.responder,
            cancel: Arc::new(CancellationRegistry::new(self.store.clone())),
            approvals: Arc::new(PendingApprovals::new()),
            providers,
            external_tools: self.external_tools,
            audit: self.audit,
            working_dir: self.working_dir,
            autospawn: self.autospawn,
            runners: Mutex::new(HashMap::new()),
            shutdown_tx,
            stopping: AtomicBool::new(false),
        });
        AgentSystem { shared }
    }
}

/// The running set of agents: one Runner per (agent, context) pair, all
/// sharing a store, a mailbox and a responder.
#[derive(Clone)]
pub struct AgentSystem {
    shared: Arc<Shared>,
}

impl AgentSystem {
    pub fn builder(config: Config, store: Store, responder: Arc<dyn Responder>) -> SystemBuilder {
        SystemBuilder {
            config,
            store,
            responder,
            providers: None,
            external_tools: None,
            audit: None,
            working_dir: PathBuf::from("."),
            autospawn: true,
        }
    }

    pub fn store(&self) -> &Store {
        &self.shared.store
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.shared.mailbox
    }

    /// Build a runner without spawning it.
    pub fn runner(&self, key: &AgentKey) -> Result<Runner> {
        self.shared.build_runner(key)
    }

    pub fn spawn_runner(&self, key: &AgentKey) -> Result<bool> {
        self.shared.spawn_runner(key)
    }

    /// Spawn a default-context runner for every roster agent.
    pub fn start(&self) -> Result<usize> {
        let mut started = 0;
        for profile in &self.shared.config.agents.roster {
            if self.shared.spawn_runner(&AgentKey::default_context(&profile.name))? {
                started += 1;
            }
        }
        info!(runners = started, "Agent system started");
        Ok(started)
    }

    pub fn running(&self) -> Vec<AgentKey> {
        let mut keys: Vec<AgentKey> = match self.shared.runners.lock() {
            Ok(runners) => runners
                .iter()
                .filter(|(_, h)| !h.is_finished())
                .map(|(k, _)| k.clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        keys.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        keys
    }

    /// Create a root task and queue it for `request.agent`. Returns the task id.
    pub async fn submit_request(&self, request: InboundRequest) -> Result<String> {
        let shared = &self.shared;
        if shared.config.profile(&request.agent).is_none() {
            return Err(Error::NotFound(format!(
                "agent '{}' is not in the roster",
                request.agent
            )));
        }

        // Fail before any task row exists
        let key = AgentKey::new(&request.agent, &request.context_id);
        if shared.autospawn {
            shared.spawn_runner(&key)?;
        }

        shared.store.create_agent(&request.from, AgentKind::Human)?;
        shared.store.create_agent(&request.agent, AgentKind::AiAgent)?;
        let task = shared.store.create_task(
            NewTask::root(&request.from, &request.handle, &request.agent, &request.content)
                .with_context(&request.context_id),
        )?;

        let envelope = Envelope::request(
            &task.task_id,
            &request.from,
            &request.content,
            channel_name(&request.handle),
        )
        .with_images(request.images);
        shared.mailbox.enqueue(&key, envelope).await;

        info!(task_id = %task.task_id, to = %key, handle = %request.handle, "Request submitted");
        Ok(task.task_id)
    }

    /// Cancel every pending task routed to `handle` and tell the requester,
    /// once per cancelled root. Runners skip the cancelled tasks, and a run
    /// already in progress stops before its next tool call. Returns how many
    /// tasks were cancelled.
    pub async fn cancel(&self, handle: &str) -> Result<usize> {
        let shared = &self.shared;
        let cancelled = shared.cancel.cancel(handle)?;
        for task in &cancelled {
            shared.approvals.take(&task.task_id);
            with_audit(shared.audit.as_ref(), |log| {
                log.log_task_finalized(&task.task_id, &task.delegated_to, "cancelled")
            });
            if !task.is_root() {
                continue;
            }
            if let Err(e) = shared.responder.deliver_cancelled(handle, &task.task_id).await {
                warn!(task_id = %task.task_id, error = %e, "Failed to announce cancellation");
            }
        }
        Ok(cancelled.len())
    }

    /// Resume a task parked on an approval request. The decision is sent to
    /// the parked agent as a new message on the same task, and the task then
    /// finishes the usual way: a root answers its requester, a child reports
    /// to its parent.
    pub async fn resolve_approval(&self, task_id: &str, decision: ApprovalDecision) -> Result<()> {
        let shared = &self.shared;
        let task = shared
            .store
            .get_task(task_id)?
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
        if task.status == TaskStatus::Cancelled {
            shared.approvals.take(task_id);
            return Err(Error::Cancelled(format!("task {} was cancelled", task_id)));
        }
        let request = shared.approvals.take(task_id).ok_or_else(|| {
            Error::Validation(format!("task {} is not waiting for approval", task_id))
        })?;

        let key = AgentKey::new(&task.delegated_to, &task.context_id);
        if shared.autospawn {
            shared.spawn_runner(&key)?;
        }
        let content = decision.resume_message(&request);
        let envelope = if task.is_root() {
            Envelope::request(
                &task.task_id,
                &task.requester,
                &content,
                channel_name(&task.requester_channel),
            )
        } else {
            Envelope::delegation(&task.task_id, &task.requester, &content)
        };
        shared.mailbox.enqueue(&key, envelope).await;

        info!(
            task_id = %task_id,
            to = %key,
            tool = %request.tool_name,
            approved = matches!(decision, ApprovalDecision::Approved { .. }),
            "Approval resolved"
        );
        Ok(())
    }

    /// Signal every runner and wait for them to finish their current cycle.
    pub async fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        let _ = self.shared.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = match self.shared.runners.lock() {
            Ok(mut runners) => runners.drain().map(|(_, h)| h).collect(),
            Err(_) => Vec::new(),
        };
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Runner task ended abnormally");
            }
        }
        info!(runners = count, "Agent system stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::DELEGATION_CHANNEL;
    use crate::responder::ChannelResponder;
    use crate::runner::CycleOutcome;
    use crate::test_support::{text, tool_call, RecordingResponder, ScriptedProvider};
    use crate::tool_loop::DEPTH_LIMIT_MESSAGE;
    use relaycell_core::types::{ProviderResponse, Role};
    use relaycell_core::OutboundKind;
    use relaycell_tools::{ToolContext, APPROVAL_SENTINEL};
    use serde_json::{json, Value};

    struct Harness {
        system: AgentSystem,
        responder: Arc<RecordingResponder>,
        providers: HashMap<String, Arc<ScriptedProvider>>,
    }

    impl Harness {
        fn runner(&self, agent: &str) -> Runner {
            self.system.runner(&AgentKey::default_context(agent)).unwrap()
        }

        fn last_request(&self, agent: &str) -> Vec<String> {
            self.providers[agent]
                .requests()
                .last()
                .unwrap()
                .iter()
                .map(|m| m.content.clone())
                .collect()
        }
    }

    fn config_for(agents: &[&str]) -> Config {
        let mut config = Config::default();
        config.agents.defaults.llm_max_retries = 0;
        for name in agents {
            config.agents.roster.push(AgentProfile::new(name));
        }
        config
    }

    fn factory(providers: &HashMap<String, Arc<ScriptedProvider>>) -> ProviderFactory {
        let providers = providers.clone();
        Arc::new(move |profile: &AgentProfile| {
            providers
                .get(&profile.name)
                .map(|p| p.clone() as Arc<dyn Provider>)
                .ok_or_else(|| Error::Config(format!("no script for {}", profile.name)))
        })
    }

    fn harness_with(
        scripts: Vec<(&str, Vec<Result<ProviderResponse>>)>,
        tweak: impl FnOnce(SystemBuilder) -> SystemBuilder,
        configure: impl FnOnce(&mut Config),
    ) -> Harness {
        let names: Vec<&str> = scripts.iter().map(|(n, _)| *n).collect();
        let mut config = config_for(&names);
        configure(&mut config);
        let providers: HashMap<String, Arc<ScriptedProvider>> = scripts
            .into_iter()
            .map(|(name, script)| (name.to_string(), Arc::new(ScriptedProvider::new(script))))
            .collect();
        let responder = Arc::new(RecordingResponder::default());
        let builder = AgentSystem::builder(config, Store::open_in_memory().unwrap(), responder.clone())
            .provider_factory(factory(&providers))
            .manual_runners();
        Harness {
            system: tweak(builder).build(),
            responder,
            providers,
        }
    }

    fn harness(scripts: Vec<(&str, Vec<Result<ProviderResponse>>)>) -> Harness {
        harness_with(scripts, |b| b, |_| {})
    }

    fn delegate_to(id: &str, agent: &str, message: &str) -> Result<ProviderResponse> {
        tool_call(id, "call_agent", json!({"agent": agent, "message": message}))
    }

    #[tokio::test]
    async fn test_single_delegation_delivers_once() {
        let h = harness(vec![
            (
                "planner",
                vec![
                    delegate_to("c1", "researcher", "find X"),
                    text("Asked the researcher."),
                    text("X is 42, per the researcher."),
                ],
            ),
            ("researcher", vec![text("X is 42")]),
        ]);
        let mut planner = h.runner("planner");
        let mut researcher = h.runner("researcher");

        let task_id = h
            .system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "What is X?"))
            .await
            .unwrap();

        match planner.tick().await.unwrap() {
            CycleOutcome::Delegating { task_id: t, children } => {
                assert_eq!(t, task_id);
                assert_eq!(children.len(), 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(h.responder.sent().is_empty());
        let root = h.system.store().get_task(&task_id).unwrap().unwrap();
        assert_eq!(root.pending_delegations, 1);

        assert!(matches!(
            researcher.tick().await.unwrap(),
            CycleOutcome::Reported { .. }
        ));
        assert_eq!(
            planner.tick().await.unwrap(),
            CycleOutcome::Answered {
                task_id: task_id.clone()
            }
        );
        assert!(planner.tick().await.is_none());
        assert!(researcher.tick().await.is_none());

        let sent = h.responder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, OutboundKind::Answer);
        assert_eq!(sent[0].handle, "cli:1");
        assert_eq!(sent[0].content, "X is 42, per the researcher.");
        assert!(h.system.store().list_tasks().unwrap().is_empty());

        let resumed = h.last_request("planner");
        assert!(resumed.contains(&"What is X?".to_string()));
        assert!(resumed.contains(&"I delegated to researcher: find X".to_string()));
        assert!(resumed.contains(&"researcher reported back: X is 42".to_string()));
        assert!(resumed.last().unwrap().contains("What is X?"));

        // The child's answer is stored on the delegation channel
        let store = h.system.store();
        let planner_id = store.get_agent("planner").unwrap().unwrap().id;
        let researcher_id = store.get_agent("researcher").unwrap().unwrap().id;
        let between = store.history_for(researcher_id, planner_id, 10).unwrap();
        assert_eq!(between.len(), 2);
        assert_eq!(between[1].content, "X is 42");
        assert_eq!(between[1].channel, DELEGATION_CHANNEL);
    }

    #[tokio::test]
    async fn test_siblings_reporting_in_reverse_order() {
        let h = harness(vec![
            (
                "planner",
                vec![
                    Ok(ProviderResponse::ToolCalls {
                        text: None,
                        calls: vec![
                            relaycell_core::types::ToolCallRequest::new(
                                "c1",
                                "call_agent",
                                json!({"agent": "researcher", "message": "facts"}),
                            ),
                            relaycell_core::types::ToolCallRequest::new(
                                "c2",
                                "delegate",
                                json!({"agent": "writer", "message": "prose"}),
                            ),
                        ],
                    }),
                    text("Waiting on both."),
                    text("Combined R and W."),
                ],
            ),
            ("researcher", vec![text("R")]),
            ("writer", vec![text("W")]),
        ]);
        let mut planner = h.runner("planner");
        let mut researcher = h.runner("researcher");
        let mut writer = h.runner("writer");

        let task_id = h
            .system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "Write it up"))
            .await
            .unwrap();
        assert!(matches!(
            planner.tick().await.unwrap(),
            CycleOutcome::Delegating { ref children, .. } if children.len() == 2
        ));

        writer.tick().await.unwrap();
        assert_eq!(
            planner.tick().await.unwrap(),
            CycleOutcome::Waiting {
                task_id: task_id.clone(),
                remaining: 1
            }
        );
        let root = h.system.store().get_task(&task_id).unwrap().unwrap();
        assert_eq!(root.pending_delegations, 1);
        assert_eq!(root.delegation_context.completed().count(), 1);
        assert!(h.responder.sent().is_empty());

        researcher.tick().await.unwrap();
        assert!(matches!(
            planner.tick().await.unwrap(),
            CycleOutcome::Answered { .. }
        ));

        let sent = h.responder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "Combined R and W.");
        let resumed = h.last_request("planner");
        assert!(resumed.contains(&"writer reported back: W".to_string()));
        assert!(resumed.contains(&"researcher reported back: R".to_string()));
        assert_eq!(h.providers["planner"].requests().len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_report_is_ignored() {
        let h = harness(vec![
            (
                "planner",
                vec![
                    delegate_to("c1", "researcher", "dig"),
                    text("Waiting."),
                    text("Done."),
                ],
            ),
            ("researcher", vec![text("found")]),
        ]);
        let mut planner = h.runner("planner");
        let mut researcher = h.runner("researcher");
        let task_id = h
            .system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "dig"))
            .await
            .unwrap();
        let children = match planner.tick().await.unwrap() {
            CycleOutcome::Delegating { children, .. } => children,
            other => panic!("unexpected outcome {:?}", other),
        };
        researcher.tick().await.unwrap();

        // Replay the same report before the planner sees the first one
        h.system
            .mailbox()
            .enqueue(
                planner.key(),
                Envelope::report(&task_id, &children[0], "researcher", "found"),
            )
            .await;

        assert!(matches!(
            planner.tick().await.unwrap(),
            CycleOutcome::Answered { .. }
        ));
        assert!(matches!(
            planner.tick().await.unwrap(),
            CycleOutcome::Skipped { .. }
        ));
        assert_eq!(h.responder.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_tree() {
        let h = harness(vec![
            (
                "planner",
                vec![
                    delegate_to("c1", "researcher", "dig"),
                    text("Waiting."),
                    text("Fresh answer."),
                ],
            ),
            ("researcher", vec![text("never used")]),
        ]);
        let mut planner = h.runner("planner");
        let mut researcher = h.runner("researcher");
        let task_id = h
            .system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "dig"))
            .await
            .unwrap();
        planner.tick().await.unwrap();

        assert_eq!(h.system.cancel("cli:1").await.unwrap(), 2);
        let sent = h.responder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, OutboundKind::Cancelled);
        assert_eq!(sent[0].task_id.as_deref(), Some(task_id.as_str()));

        assert!(matches!(
            researcher.tick().await.unwrap(),
            CycleOutcome::Skipped { reason: "task cancelled", .. }
        ));
        assert!(h.providers["researcher"].requests().is_empty());
        assert!(planner.tick().await.is_none());
        let root = h.system.store().get_task(&task_id).unwrap().unwrap();
        assert_eq!(root.status, TaskStatus::Cancelled);

        // Nothing left to cancel
        assert_eq!(h.system.cancel("cli:1").await.unwrap(), 0);
        assert_eq!(h.responder.sent().len(), 1);

        h.system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "again"))
            .await
            .unwrap();
        assert!(matches!(
            planner.tick().await.unwrap(),
            CycleOutcome::Answered { .. }
        ));
        assert_eq!(h.responder.sent()[1].content, "Fresh answer.");
    }

    #[tokio::test]
    async fn test_cancel_survives_new_request_on_same_handle() {
        let h = harness(vec![
            (
                "planner",
                vec![
                    delegate_to("c1", "researcher", "dig"),
                    text("Waiting."),
                    text("Second answer."),
                    text("OLD ANSWER"),
                ],
            ),
            ("researcher", vec![text("stale findings")]),
        ]);
        let mut planner = h.runner("planner");
        let mut researcher = h.runner("researcher");
        let first = h
            .system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "dig"))
            .await
            .unwrap();
        planner.tick().await.unwrap();
        h.system.cancel("cli:1").await.unwrap();

        let second = h
            .system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "again"))
            .await
            .unwrap();

        // The old child stays cancelled and never reaches its provider
        assert!(matches!(
            researcher.tick().await.unwrap(),
            CycleOutcome::Skipped { reason: "task cancelled", .. }
        ));
        assert!(h.providers["researcher"].requests().is_empty());

        assert_eq!(
            planner.tick().await.unwrap(),
            CycleOutcome::Answered {
                task_id: second.clone()
            }
        );
        assert!(planner.tick().await.is_none());

        let sent = h.responder.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, OutboundKind::Cancelled);
        assert_eq!(sent[0].task_id.as_deref(), Some(first.as_str()));
        assert_eq!(sent[1].kind, OutboundKind::Answer);
        assert_eq!(sent[1].task_id.as_deref(), Some(second.as_str()));
        assert_eq!(sent[1].content, "Second answer.");
        assert_eq!(
            h.system.store().get_task(&first).unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_report_to_cancelled_parent_is_dropped() {
        let h = harness(vec![
            (
                "planner",
                vec![
                    delegate_to("c1", "researcher", "dig"),
                    text("Waiting."),
                    text("never used"),
                ],
            ),
            ("researcher", vec![text("findings")]),
        ]);
        let mut planner = h.runner("planner");
        let mut researcher = h.runner("researcher");
        let task_id = h
            .system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "dig"))
            .await
            .unwrap();
        planner.tick().await.unwrap();
        assert!(matches!(
            researcher.tick().await.unwrap(),
            CycleOutcome::Reported { .. }
        ));

        // Only the root is left; the report is already queued
        assert_eq!(h.system.cancel("cli:1").await.unwrap(), 1);
        assert_eq!(
            planner.tick().await.unwrap(),
            CycleOutcome::Skipped {
                task_id: Some(task_id.clone()),
                reason: "task cancelled"
            }
        );
        assert_eq!(h.providers["planner"].requests().len(), 2);
        let sent = h.responder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, OutboundKind::Cancelled);
    }

    #[tokio::test]
    async fn test_root_failure_is_delivered() {
        let h = harness(vec![("planner", vec![])]);
        let mut planner = h.runner("planner");
        let task_id = h
            .system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "hi"))
            .await
            .unwrap();

        assert!(matches!(
            planner.tick().await.unwrap(),
            CycleOutcome::Failed { .. }
        ));
        let sent = h.responder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, OutboundKind::Failure);
        assert_eq!(sent[0].task_id.as_deref(), Some(task_id.as_str()));
        assert!(sent[0].content.contains("script exhausted"));
        assert!(h.system.store().get_task(&task_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_child_failure_is_reported_to_parent() {
        let h = harness(vec![
            (
                "planner",
                vec![
                    delegate_to("c1", "researcher", "dig"),
                    text("Waiting."),
                    text("The researcher failed, sorry."),
                ],
            ),
            ("researcher", vec![]),
        ]);
        let mut planner = h.runner("planner");
        let mut researcher = h.runner("researcher");
        h.system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "dig"))
            .await
            .unwrap();
        planner.tick().await.unwrap();

        assert!(matches!(
            researcher.tick().await.unwrap(),
            CycleOutcome::Failed { .. }
        ));
        assert!(matches!(
            planner.tick().await.unwrap(),
            CycleOutcome::Answered { .. }
        ));
        let resumed = h.last_request("planner");
        assert!(resumed
            .iter()
            .any(|m| m.starts_with("researcher reported back: Delegation failed:")));
        assert_eq!(h.responder.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_depth_limit_still_answers() {
        let script: Vec<Result<ProviderResponse>> = (0..6)
            .map(|i| tool_call(&format!("c{}", i), "get_context_info", json!({})))
            .collect();
        let h = harness_with(vec![("planner", script)], |b| b, |config| {
            config.agents.defaults.max_tool_depth = 2;
        });
        let mut planner = h.runner("planner");
        h.system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "loop"))
            .await
            .unwrap();

        assert!(matches!(
            planner.tick().await.unwrap(),
            CycleOutcome::Answered { .. }
        ));
        assert_eq!(h.providers["planner"].requests().len(), 3);
        let sent = h.responder.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].content.ends_with(DEPTH_LIMIT_MESSAGE));
    }

    struct PaymentTools;

    #[async_trait]
    impl ToolExecutor for PaymentTools {
        async fn execute(&self, name: &str, input: Value, _ctx: &ToolContext) -> Result<String> {
            match name {
                "wire_money" => Ok(format!("{} send {}", APPROVAL_SENTINEL, input["amount"])),
                other => Err(Error::Tool(format!("Unknown tool: {}", other))),
            }
        }

        fn schemas(&self) -> Vec<Value> {
            vec![json!({
                "type": "function",
                "function": {"name": "wire_money", "description": "Send money", "parameters": {"type": "object"}}
            })]
        }
    }

    #[tokio::test]
    async fn test_external_tool_requests_approval() {
        let h = harness_with(
            vec![(
                "planner",
                vec![tool_call("c1", "wire_money", json!({"amount": "100 EUR"}))],
            )],
            |b| b.external_tools(Arc::new(PaymentTools)),
            |_| {},
        );
        let mut planner = h.runner("planner");
        let task_id = h
            .system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "pay Bob"))
            .await
            .unwrap();

        assert_eq!(
            planner.tick().await.unwrap(),
            CycleOutcome::ApprovalRequested {
                task_id: task_id.clone()
            }
        );
        let sent = h.responder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, OutboundKind::ApprovalRequired);
        let approval = sent[0].approval.clone().unwrap();
        assert_eq!(approval.tool_name, "wire_money");
        assert_eq!(approval.payload, "send \"100 EUR\"");
        assert!(h.system.store().get_task(&task_id).unwrap().is_some());

        let offered = h.providers["planner"].tool_names();
        let tools = &offered[0];
        assert!(tools.contains(&"wire_money".to_string()));
        assert!(tools.contains(&"call_agent".to_string()));
    }

    #[tokio::test]
    async fn test_rejected_approval_lets_child_report() {
        let h = harness_with(
            vec![
                (
                    "planner",
                    vec![
                        delegate_to("c1", "researcher", "pay the venue"),
                        text("Waiting."),
                        text("Venue is unpaid, as you asked."),
                    ],
                ),
                (
                    "researcher",
                    vec![
                        tool_call("c2", "wire_money", json!({"amount": "900 EUR"})),
                        text("Payment skipped."),
                    ],
                ),
            ],
            |b| b.external_tools(Arc::new(PaymentTools)),
            |_| {},
        );
        let mut planner = h.runner("planner");
        let mut researcher = h.runner("researcher");
        let root_id = h
            .system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "book it"))
            .await
            .unwrap();
        planner.tick().await.unwrap();
        let child_id = h.system.store().children_of(&root_id).unwrap().remove(0).task_id;

        assert_eq!(
            researcher.tick().await.unwrap(),
            CycleOutcome::ApprovalRequested {
                task_id: child_id.clone()
            }
        );
        let root = h.system.store().get_task(&root_id).unwrap().unwrap();
        assert_eq!(root.pending_delegations, 1);

        assert!(matches!(
            h.system.resolve_approval(&root_id, ApprovalDecision::Rejected {
                reason: "no".to_string()
            }).await,
            Err(Error::Validation(_))
        ));
        h.system
            .resolve_approval(&child_id, ApprovalDecision::Rejected {
                reason: "too expensive".to_string(),
            })
            .await
            .unwrap();
        // Each approval resumes at most once
        assert!(h
            .system
            .resolve_approval(&child_id, ApprovalDecision::Approved {
                outcome: "sent".to_string(),
            })
            .await
            .is_err());

        assert_eq!(
            researcher.tick().await.unwrap(),
            CycleOutcome::Reported {
                task_id: child_id.clone()
            }
        );
        let resumed = h.last_request("researcher");
        assert!(resumed
            .last()
            .unwrap()
            .contains("rejected: too expensive"));

        assert_eq!(
            planner.tick().await.unwrap(),
            CycleOutcome::Answered {
                task_id: root_id.clone()
            }
        );
        let sent = h.responder.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, OutboundKind::ApprovalRequired);
        assert_eq!(sent[0].task_id.as_deref(), Some(child_id.as_str()));
        assert_eq!(sent[1].kind, OutboundKind::Answer);
        assert_eq!(sent[1].content, "Venue is unpaid, as you asked.");
    }

    #[tokio::test]
    async fn test_cancel_discards_parked_approval() {
        let h = harness_with(
            vec![(
                "planner",
                vec![tool_call("c1", "wire_money", json!({"amount": "5 EUR"}))],
            )],
            |b| b.external_tools(Arc::new(PaymentTools)),
            |_| {},
        );
        let mut planner = h.runner("planner");
        let task_id = h
            .system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "pay"))
            .await
            .unwrap();
        planner.tick().await.unwrap();

        assert_eq!(h.system.cancel("cli:1").await.unwrap(), 1);
        assert!(matches!(
            h.system
                .resolve_approval(&task_id, ApprovalDecision::Approved {
                    outcome: "sent".to_string(),
                })
                .await,
            Err(Error::Cancelled(_))
        ));
        assert!(h
            .system
            .resolve_approval("no-such-task", ApprovalDecision::Rejected {
                reason: "x".to_string(),
            })
            .await
            .is_err());
        assert!(planner.tick().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_target_becomes_tool_error() {
        let h = harness(vec![(
            "planner",
            vec![
                delegate_to("c1", "ghost", "boo"),
                text("There is no such agent."),
            ],
        )]);
        let mut planner = h.runner("planner");
        h.system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "ask ghost"))
            .await
            .unwrap();

        assert!(matches!(
            planner.tick().await.unwrap(),
            CycleOutcome::Answered { .. }
        ));
        let requests = h.providers["planner"].requests();
        let second = &requests[1];
        let tool_result = second.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_result.content.starts_with("Error: Not found"));
        assert!(h.system.store().get_agent("ghost").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_notifications_and_directory() {
        let h = harness(vec![
            (
                "planner",
                vec![
                    tool_call("c1", "list_agents", json!({})),
                    tool_call("c2", "send_notification", json!({"message": "halfway"})),
                    text("done"),
                ],
            ),
            ("researcher", vec![]),
        ]);
        let mut planner = h.runner("planner");
        h.system
            .submit_request(InboundRequest::new("planner", "user", "cli:1", "go"))
            .await
            .unwrap();
        planner.tick().await.unwrap();

        let listing = h.providers["planner"].requests()[1]
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap()
            .content
            .clone();
        let listing: Value = serde_json::from_str(&listing).unwrap();
        assert_eq!(listing["count"], 1);
        assert_eq!(listing["agents"][0]["name"], "researcher");

        let sent = h.responder.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, OutboundKind::Notification);
        assert_eq!(sent[0].content, "planner: halfway");
        assert_eq!(sent[1].kind, OutboundKind::Answer);
    }

    #[tokio::test]
    async fn test_submit_to_unknown_agent() {
        let h = harness(vec![("planner", vec![])]);
        let err = h
            .system
            .submit_request(InboundRequest::new("nobody", "user", "cli:1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(h.system.store().list_tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_runners_deliver() {
        let providers: HashMap<String, Arc<ScriptedProvider>> = [
            (
                "planner".to_string(),
                Arc::new(ScriptedProvider::new(vec![
                    delegate_to("c1", "researcher", "find X"),
                    text("Waiting."),
                    text("X is 42."),
                ])),
            ),
            (
                "researcher".to_string(),
                Arc::new(ScriptedProvider::new(vec![text("42")])),
            ),
        ]
        .into_iter()
        .collect();
        let mut config = config_for(&["planner", "researcher"]);
        config.runner.poll_interval_ms = 20;
        let (responder, mut rx) = ChannelResponder::channel(16);
        let system = AgentSystem::builder(config, Store::open_in_memory().unwrap(), Arc::new(responder))
            .provider_factory(factory(&providers))
            .build();

        assert_eq!(system.start().unwrap(), 2);
        assert!(!system
            .spawn_runner(&AgentKey::default_context("planner"))
            .unwrap());
        assert_eq!(system.running().len(), 2);

        let task_id = system
            .submit_request(InboundRequest::new("planner", "user", "cli:7", "What is X?"))
            .await
            .unwrap();
        let answer = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.kind, OutboundKind::Answer);
        assert_eq!(answer.task_id.as_deref(), Some(task_id.as_str()));
        assert_eq!(answer.content, "X is 42.");

        system.shutdown().await;
        assert!(system.running().is_empty());
        assert!(system
            .spawn_runner(&AgentKey::default_context("planner"))
            .is_err());
    }
}

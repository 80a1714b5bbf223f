use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use relaycell_core::types::ImageAttachment;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use relaycell_storage::tasks::DEFAULT_CONTEXT_ID;

/// Message channel recorded for delegation hand-offs.
pub const DELEGATION_CHANNEL: &str = "system_ai_delegation";
/// Message channel recorded for reports and other agent-internal traffic.
pub const INTERNAL_CHANNEL: &str = "internal";

static TASK_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[task:([A-Za-z0-9_\-]+)\]").expect("task marker regex"));

/// One Runner serves one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentKey {
    pub agent: String,
    pub context_id: String,
}

impl AgentKey {
    pub fn new(agent: &str, context_id: &str) -> Self {
        Self {
            agent: agent.to_string(),
            context_id: context_id.to_string(),
        }
    }

    pub fn default_context(agent: &str) -> Self {
        Self::new(agent, DEFAULT_CONTEXT_ID)
    }
}

impl fmt::Display for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.agent, self.context_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// A fresh request from outside the agent system.
    Request,
    /// Work handed over by another agent.
    Delegation,
    /// A child task's result coming back to its parent.
    Report,
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub task_id: Option<String>,
    /// Set on reports: the child task that produced `content`.
    pub child_task_id: Option<String>,
    pub from: String,
    pub content: String,
    pub channel: String,
    pub images: Vec<ImageAttachment>,
    pub enqueued_at: DateTime<Utc>,
}

impl Envelope {
    fn build(kind: EnvelopeKind, task_id: &str, from: &str, content: &str, channel: &str) -> Self {
        Self {
            kind,
            task_id: Some(task_id.to_string()),
            child_task_id: None,
            from: from.to_string(),
            content: content.to_string(),
            channel: channel.to_string(),
            images: Vec::new(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn request(task_id: &str, from: &str, content: &str, channel: &str) -> Self {
        Self::build(EnvelopeKind::Request, task_id, from, content, channel)
    }

    pub fn delegation(child_task_id: &str, from: &str, content: &str) -> Self {
        Self::build(
            EnvelopeKind::Delegation,
            child_task_id,
            from,
            content,
            DELEGATION_CHANNEL,
        )
    }

    pub fn report(parent_task_id: &str, child_task_id: &str, from: &str, result: &str) -> Self {
        let mut envelope =
            Self::build(EnvelopeKind::Report, parent_task_id, from, result, INTERNAL_CHANNEL);
        envelope.child_task_id = Some(child_task_id.to_string());
        envelope
    }

    pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
        self.images = images;
        self
    }

    /// The explicit task id, or one embedded in the text as `[task:<id>]`.
    pub fn resolve_task_id(&self) -> Option<String> {
        if let Some(id) = self.task_id.as_deref().filter(|id| !id.is_empty()) {
            return Some(id.to_string());
        }
        TASK_MARKER
            .captures(&self.content)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

/// Per-key FIFO queues shared by every Runner in the process.
#[derive(Default)]
pub struct Mailbox {
    queues: Mutex<HashMap<AgentKey, VecDeque<Envelope>>>,
    notify: Notify,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(&self, key: &AgentKey, envelope: Envelope) {
        {
            let mut queues = self.queues.lock().await;
            let queue = queues.entry(key.clone()).or_default();
            queue.push_back(envelope);
            debug!(key = %key, depth = queue.len(), "Envelope enqueued");
        }
        self.notify.notify_waiters();
    }

    pub async fn drain_one(&self, key: &AgentKey) -> Option<Envelope> {
        let mut queues = self.queues.lock().await;
        let queue = queues.get_mut(key)?;
        let envelope = queue.pop_front();
        if queue.is_empty() {
            queues.remove(key);
        }
        envelope
    }

    pub async fn len(&self, key: &AgentKey) -> usize {
        self.queues
            .lock()
            .await
            .get(key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, key: &AgentKey) -> bool {
        self.len(key).await == 0
    }

    /// Wait until something is enqueued anywhere or `timeout` passes.
    /// Returns true when woken by an enqueue.
    pub async fn wait_for_work(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }
}

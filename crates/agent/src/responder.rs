use async_trait::async_trait;
use relaycell_core::types::ApprovalRequest;
use relaycell_core::{Error, OutboundKind, OutboundMessage, Result};
use tokio::sync::mpsc;
use tracing::debug;

/// Routes finished work back to whoever asked, keyed by the opaque channel
/// handle stored on the root task.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<()>;

    async fn deliver(&self, handle: &str, task_id: &str, text: &str) -> Result<()> {
        self.send(OutboundMessage::new(OutboundKind::Answer, handle, text).with_task(task_id))
            .await
    }

    async fn deliver_cancelled(&self, handle: &str, task_id: &str) -> Result<()> {
        self.send(
            OutboundMessage::new(OutboundKind::Cancelled, handle, "Request cancelled.")
                .with_task(task_id),
        )
        .await
    }

    async fn deliver_failure(&self, handle: &str, task_id: &str, message: &str) -> Result<()> {
        self.send(OutboundMessage::new(OutboundKind::Failure, handle, message).with_task(task_id))
            .await
    }

    async fn request_approval(
        &self,
        handle: &str,
        task_id: &str,
        request: &ApprovalRequest,
    ) -> Result<()> {
        let text = format!(
            "Tool '{}' needs your approval: {}",
            request.tool_name, request.payload
        );
        let mut message =
            OutboundMessage::new(OutboundKind::ApprovalRequired, handle, &text).with_task(task_id);
        message.approval = Some(request.clone());
        self.send(message).await
    }

    /// Interim progress that does not finish the task.
    async fn notify(&self, handle: &str, task_id: &str, text: &str) -> Result<()> {
        self.send(
            OutboundMessage::new(OutboundKind::Notification, handle, text).with_task(task_id),
        )
        .await
    }
}

/// Forwards everything onto an mpsc channel drained by the front end.
pub struct ChannelResponder {
    tx: mpsc::Sender<OutboundMessage>,
}

impl ChannelResponder {
    pub fn new(tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self { tx }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Responder for ChannelResponder {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        debug!(handle = %message.handle, kind = ?message.kind, "Outbound message");
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::Other("Outbound channel closed".to_string()))
    }
}

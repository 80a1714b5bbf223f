use relaycell_core::types::{
    ApprovalRequest, ChatMessage, ImageAttachment, ProviderResponse, ToolCallRequest,
};
use relaycell_core::Result;
use relaycell_providers::Provider;
use relaycell_tools::{safe_truncate, ToolContext, ToolExecutor, APPROVAL_SENTINEL};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_DEPTH: u32 = 10;

/// Appended to the answer when the loop runs out of depth.
pub const DEPTH_LIMIT_MESSAGE: &str =
    "I stopped here because I reached the maximum number of tool-call rounds.";

pub struct LoopInput {
    pub system_prompt: String,
    pub initial_message: String,
    pub history: Vec<ChatMessage>,
    pub images: Vec<ImageAttachment>,
    pub tools: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Answered,
    DepthLimit,
    ApprovalRequired(ApprovalRequest),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct LoopResult {
    /// Every non-empty text fragment the model produced, blank-line joined.
    pub text: String,
    pub stop: StopReason,
    pub provider_calls: u32,
    /// Tool calls issued during the run, in order.
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Drives one agent turn: ask the model, run the tools it wants, feed the
/// results back, until it answers in plain text.
pub struct ToolLoop {
    provider: Arc<dyn Provider>,
    max_depth: u32,
    max_retries: u32,
    retry_delay: Duration,
}

impl ToolLoop {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            max_depth: DEFAULT_MAX_DEPTH,
            max_retries: 1,
            retry_delay: Duration::from_millis(2000),
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_retry(mut self, max_retries: u32, delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = delay;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub async fn run(
        &self,
        input: LoopInput,
        executor: &dyn ToolExecutor,
        ctx: &ToolContext,
    ) -> Result<LoopResult> {
        let LoopInput {
            system_prompt,
            initial_message,
            mut history,
            images,
            tools,
        } = input;
        history.push(ChatMessage::user(&initial_message));
        let mut messages = history;

        let mut fragments: Vec<String> = Vec::new();
        let mut issued: Vec<ToolCallRequest> = Vec::new();
        let mut provider_calls = 0u32;
        let mut depth = 0u32;

        let finish = |fragments: Vec<String>,
                      issued: Vec<ToolCallRequest>,
                      stop: StopReason,
                      provider_calls: u32| LoopResult {
            text: fragments.join("\n\n"),
            stop,
            provider_calls,
            tool_calls: issued,
        };

        loop {
            if depth > self.max_depth {
                warn!(
                    agent = %ctx.agent_name,
                    task_id = %ctx.task_id,
                    max_depth = self.max_depth,
                    "Reached max tool depth"
                );
                fragments.push(DEPTH_LIMIT_MESSAGE.to_string());
                return Ok(finish(fragments, issued, StopReason::DepthLimit, provider_calls));
            }

            debug!(depth, messages = messages.len(), "LLM call iteration");
            let response = self
                .respond_with_retry(&system_prompt, &messages, &tools, &images, depth)
                .await?;
            provider_calls += 1;

            let text = response.text().unwrap_or("").trim().to_string();
            info!(
                agent = %ctx.agent_name,
                content_len = text.len(),
                tool_calls_count = response.tool_calls().len(),
                depth,
                "LLM response received"
            );
            if !text.is_empty() {
                fragments.push(text.clone());
            }

            let calls = match response {
                ProviderResponse::Text { .. } => {
                    return Ok(finish(fragments, issued, StopReason::Answered, provider_calls));
                }
                ProviderResponse::ToolCalls { calls, .. } => calls,
            };

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                if ctx.is_cancelled() {
                    info!(task_id = %ctx.task_id, tool = %call.name, "Cancelled before tool call");
                    return Ok(finish(fragments, issued, StopReason::Cancelled, provider_calls));
                }
                issued.push(call.clone());

                let result = match executor.execute(&call.name, call.input.clone(), ctx).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "Tool execution failed");
                        format!("Error: {}", e)
                    }
                };
                debug!(tool = %call.name, result = %safe_truncate(&result, 200), "Tool result");

                if let Some(payload) = result.strip_prefix(APPROVAL_SENTINEL) {
                    info!(tool = %call.name, task_id = %ctx.task_id, "Tool requires approval");
                    let request = ApprovalRequest {
                        tool_name: call.name.clone(),
                        call_id: call.id.clone(),
                        payload: payload.trim().to_string(),
                    };
                    return Ok(finish(
                        fragments,
                        issued,
                        StopReason::ApprovalRequired(request),
                        provider_calls,
                    ));
                }
                results.push(ChatMessage::tool_result(&call.id, &call.name, &result));
            }

            messages.push(ChatMessage::assistant_with_tools(&text, calls));
            messages.extend(results);
            depth += 1;
        }
    }

    async fn respond_with_retry(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        tools: &[Value],
        images: &[ImageAttachment],
        depth: u32,
    ) -> Result<ProviderResponse> {
        let mut attempt = 0u32;
        loop {
            match self
                .provider
                .respond(system_prompt, messages, tools, images)
                .await
            {
                Ok(response) => {
                    if attempt > 0 {
                        info!(attempt, depth, "LLM call succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.retry_delay * (1u32 << (attempt - 1).min(4));
                    warn!(
                        error = %e,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        depth,
                        "Retrying LLM call after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(error = %e, attempt, depth, "LLM call failed");
                    return Err(e);
                }
            }
        }
    }
}

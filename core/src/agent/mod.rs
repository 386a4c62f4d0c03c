//! Agent orchestrator: streams assistant turns, interleaves tool calls, and
//! publishes lifecycle events.
//!
//! A request takes the session's history, opens a streaming provider turn,
//! appends content parts to the assistant message as they arrive (observable
//! on the `messages` topic), routes every tool call through the permission
//! mediator under the per-call timeout, and loops until the provider ends
//! the turn. Cancellation, whether from `cancel_all` or the request
//! timeout, unwinds cooperatively into the `RequestCancelled` sentinel.

pub mod client;
pub mod tools;

use std::sync::Arc;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use client::ModelClient;
pub use client::ResponseEvent;
pub use client::ResponseStream;
pub use tools::ToolCall;
pub use tools::ToolCtx;
pub use tools::ToolError;
pub use tools::ToolInfo;
pub use tools::ToolKind;

use crate::auth::TokenBroker;
use crate::config::Config;
use crate::config::ModelDescriptor;
use crate::csync;
use crate::error::Result;
use crate::error::TetherErr;
use crate::message::MessageService;
use crate::permission::PermissionService;
use crate::pubsub::Broker;
use crate::pubsub::Event;
use crate::pubsub::EventKind;
use crate::session::SessionService;
use tether_protocol::AgentEvent;
use tether_protocol::AgentEventKind;
use tether_protocol::ContentPart;
use tether_protocol::Message;
use tether_protocol::Role;
use tether_protocol::config_types::SelectedModelType;

/// Fraction of the model's context window at which the session history is
/// compacted into a summary turn.
pub const AUTO_SUMMARIZE_CONTEXT_FRACTION: f64 = 0.95;

/// Final user turn of a summarize request.
const SUMMARIZE_PROMPT: &str = "Provide a detailed but concise summary of our conversation above. \
    Focus on information that would be helpful for continuing the conversation, including what we \
    did, what we're doing, which files we're working on, and what we're going to do next.";

pub type AgentResult = Result<Message>;

pub(crate) fn should_auto_summarize(total_tokens: u64, context_window: u64) -> bool {
    context_window > 0
        && total_tokens as f64 >= context_window as f64 * AUTO_SUMMARIZE_CONTEXT_FRACTION
}

pub struct Agent {
    config: Arc<Config>,
    sessions: Arc<SessionService>,
    messages: Arc<MessageService>,
    auth: Arc<TokenBroker>,
    tools: csync::Map<String, Arc<ToolKind>>,
    client: std::sync::RwLock<ModelClient>,
    broker: Broker<AgentEvent>,
    active: csync::Map<String, CancellationToken>,
}

impl Agent {
    /// Build the agent against the currently selected large model; fails
    /// when no model is selected. `mcp_tools` come from the MCP supervisor's
    /// startup discovery; built-in tools are registered here.
    pub fn new(
        config: Arc<Config>,
        permissions: Arc<PermissionService>,
        sessions: Arc<SessionService>,
        messages: Arc<MessageService>,
        history: Arc<crate::history::HistoryService>,
        auth: Arc<TokenBroker>,
        mcp_tools: Vec<ToolKind>,
    ) -> Result<Arc<Self>> {
        let client = ModelClient::from_config(&config, SelectedModelType::Large, auth.clone())?;

        let tools: csync::Map<String, Arc<ToolKind>> = csync::Map::new();
        let builtin = [
            ToolKind::Shell(tools::ShellTool::new(permissions.clone())),
            ToolKind::View(tools::ViewTool::new()),
            ToolKind::Write(tools::WriteTool::new(permissions.clone(), history)),
        ];
        for tool in builtin.into_iter().chain(mcp_tools) {
            tools.set(tool.name(), Arc::new(tool));
        }

        Ok(Arc::new(Self {
            config,
            sessions,
            messages,
            auth,
            tools,
            client: std::sync::RwLock::new(client),
            broker: Broker::new("coder-agent"),
            active: csync::Map::new(),
        }))
    }

    pub fn subscribe(&self, cancel: &CancellationToken) -> mpsc::Receiver<Event<AgentEvent>> {
        self.broker.subscribe(cancel)
    }

    /// True while at least one request is in flight.
    pub fn is_busy(&self) -> bool {
        !self.active.is_empty()
    }

    /// Cooperatively cancel every in-flight request.
    pub fn cancel_all(&self) {
        for (_, token) in self.active.snapshot() {
            token.cancel();
        }
    }

    /// Re-read the selected model from config.
    pub fn update_model(&self) -> Result<()> {
        let client =
            ModelClient::from_config(&self.config, SelectedModelType::Large, self.auth.clone())?;
        *self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner) = client;
        Ok(())
    }

    /// The currently bound model with its context-window size.
    pub fn model(&self) -> ModelDescriptor {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .model()
            .clone()
    }

    pub fn shutdown(&self) {
        self.broker.shutdown();
    }

    /// Start a request; the returned stream delivers exactly one value, the
    /// completed assistant message or an error.
    pub async fn run(
        self: &Arc<Self>,
        session_id: &str,
        prompt: &str,
    ) -> Result<mpsc::Receiver<AgentResult>> {
        self.sessions.get(session_id).await?;
        if self.active.contains_key(&session_id.to_string()) {
            return Err(TetherErr::Other(anyhow::anyhow!(
                "session {session_id} is already processing a request"
            )));
        }

        self.messages
            .create(
                session_id,
                Role::User,
                vec![ContentPart::Text {
                    text: prompt.to_string(),
                }],
            )
            .await;

        let cancel = CancellationToken::new();
        self.active.set(session_id.to_string(), cancel.clone());

        let (tx, rx) = mpsc::channel::<AgentResult>(1);
        let agent = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let result = agent.process_request(&session_id, cancel).await;
            agent.active.delete(&session_id);

            let event = AgentEvent {
                kind: AgentEventKind::Response,
                session_id: session_id.clone(),
                message: result.as_ref().ok().cloned(),
                error: result.as_ref().err().map(ToString::to_string),
                done: true,
            };
            agent.broker.publish(EventKind::Updated, event).await;
            let _ = tx.send(result).await;
        });

        Ok(rx)
    }

    async fn process_request(&self, session_id: &str, cancel: CancellationToken) -> AgentResult {
        let request_timeout = self.config.options.request_timeout_seconds;
        let deadline = (request_timeout > 0)
            .then(|| tokio::time::Instant::now() + Duration::from_secs(request_timeout));

        let tool_infos: Vec<ToolInfo> = self
            .tools
            .snapshot()
            .into_iter()
            .map(|(_, tool)| tool.info())
            .collect();
        let ctx = ToolCtx {
            session_id: session_id.to_string(),
            working_dir: self.config.working_dir().to_path_buf(),
        };

        let context = self.context_message(session_id).await;
        let mut needs_summarize = false;
        let mut assistant = self
            .messages
            .create(session_id, Role::Assistant, Vec::new())
            .await;

        loop {
            let mut history = self.messages.list(session_id).await;
            if let Some(context) = &context {
                history.insert(0, context.clone());
            }
            let client = self
                .client
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();

            let mut stream = tokio::select! {
                _ = cancel.cancelled() => return Err(TetherErr::RequestCancelled),
                _ = wait_for(deadline) => return Err(TetherErr::RequestCancelled),
                stream = client.stream(&history, &tool_infos) => stream?,
            };

            let mut pending_calls: Vec<ToolCall> = Vec::new();
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return Err(TetherErr::RequestCancelled),
                    _ = wait_for(deadline) => return Err(TetherErr::RequestCancelled),
                    event = stream.recv() => event,
                };
                let Some(event) = event else { break };

                match event? {
                    ResponseEvent::TextDelta(delta) => {
                        assistant.append_text(&delta);
                        assistant = self.messages.update(assistant).await?;
                    }
                    ResponseEvent::ToolCall { id, name, input } => {
                        assistant.parts.push(ContentPart::ToolCall {
                            id: id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        });
                        assistant = self.messages.update(assistant).await?;
                        pending_calls.push(ToolCall { id, name, input });
                    }
                    ResponseEvent::Completed { usage } => {
                        let session = self.sessions.add_usage(session_id, usage).await?;
                        if !self.config.options.disable_auto_summarize
                            && should_auto_summarize(
                                session.prompt_tokens + session.completion_tokens,
                                client.context_window(),
                            )
                        {
                            needs_summarize = true;
                        }
                    }
                }
            }

            if pending_calls.is_empty() {
                break;
            }

            // Tool results live on a tool-role message appended after the
            // assistant parts that requested them.
            let mut results = self
                .messages
                .create(session_id, Role::Tool, Vec::new())
                .await;
            for call in pending_calls {
                let outcome = self.run_tool_call(&ctx, &call, &cancel).await?;
                results.parts.push(ContentPart::ToolResult {
                    tool_call_id: call.id,
                    name: call.name,
                    content: outcome.content,
                    is_error: outcome.is_error,
                });
                results = self.messages.update(results).await?;
            }
        }

        let final_message = self.messages.get(&assistant.id).await?;

        // Compact the history once usage crosses the context threshold so
        // the next request fits the window. The completed turn already
        // succeeded; a failed summarize only logs.
        if needs_summarize {
            info!(session_id, "context usage crossed the summarize threshold");
            match self.summarize_session(session_id, &cancel, deadline).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("auto-summarize failed: {e}"),
            }
        }

        Ok(final_message)
    }

    /// Condense the session's linear history into a single summary turn.
    /// The summary is produced by the provider from the full history plus a
    /// summarize instruction, then replaces every stored message.
    async fn summarize_session(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<()> {
        let client = self
            .client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut history = self.messages.list(session_id).await;
        history.push(Message {
            id: format!("summarize-{session_id}"),
            session_id: session_id.to_string(),
            role: Role::User,
            parts: vec![ContentPart::Text {
                text: SUMMARIZE_PROMPT.to_string(),
            }],
            created_at: 0,
            updated_at: 0,
        });

        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(TetherErr::RequestCancelled),
            _ = wait_for(deadline) => return Err(TetherErr::RequestCancelled),
            stream = client.stream(&history, &[]) => stream?,
        };

        let mut summary = String::new();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Err(TetherErr::RequestCancelled),
                _ = wait_for(deadline) => return Err(TetherErr::RequestCancelled),
                event = stream.recv() => event,
            };
            let Some(event) = event else { break };
            match event? {
                ResponseEvent::TextDelta(delta) => summary.push_str(&delta),
                ResponseEvent::Completed { usage } => {
                    self.sessions.add_usage(session_id, usage).await?;
                }
                // A summarize turn advertises no tools.
                ResponseEvent::ToolCall { .. } => {}
            }
        }
        if summary.trim().is_empty() {
            return Ok(());
        }

        for message in self.messages.list(session_id).await {
            self.messages.delete(&message.id).await?;
        }
        self.messages
            .create(
                session_id,
                Role::Assistant,
                vec![ContentPart::Text { text: summary }],
            )
            .await;
        Ok(())
    }

    /// Workspace context files (`options.context_paths`) folded into one
    /// system message, in configured order. Absent files are skipped.
    async fn context_message(&self, session_id: &str) -> Option<Message> {
        let mut combined = String::new();
        for name in &self.config.options.context_paths {
            let path = self.config.working_dir().join(name);
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            if content.trim().is_empty() {
                continue;
            }
            combined.push_str(&format!("# {name}\n\n{content}\n\n"));
        }
        if combined.is_empty() {
            return None;
        }
        Some(Message {
            id: format!("context-{session_id}"),
            session_id: session_id.to_string(),
            role: Role::System,
            parts: vec![ContentPart::Text { text: combined }],
            created_at: 0,
            updated_at: 0,
        })
    }

    /// Execute one tool call under `min(config timeout, tool-local
    /// timeout)`; whichever is shorter wins. Tool failures, including
    /// permission denial, come back as error outcomes rather than request
    /// errors.
    async fn run_tool_call(
        &self,
        ctx: &ToolCtx,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<crate::mcp::ToolOutcome> {
        use crate::mcp::ToolOutcome;

        let Some(tool) = self.tools.get(&call.name) else {
            return Ok(ToolOutcome::error(format!("unknown tool: {}", call.name)));
        };

        let config_timeout = self.config.options.tool_call_timeout_seconds;
        let timeout = match (
            (config_timeout > 0).then(|| Duration::from_secs(config_timeout)),
            tool.timeout(),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };

        let run = tool.run(ctx, call);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(TetherErr::RequestCancelled),
            outcome = async {
                match timeout {
                    Some(t) => tokio::time::timeout(t, run)
                        .await
                        .unwrap_or_else(|_| Ok(ToolOutcome::error(format!(
                            "tool call timed out after {}s",
                            t.as_secs()
                        )))),
                    None => run.await,
                }
            } => outcome,
        };

        Ok(match outcome {
            Ok(outcome) => outcome,
            Err(ToolError::PermissionDenied(e)) => {
                debug!(tool = %call.name, "tool call denied");
                ToolOutcome::error(e.to_string())
            }
            Err(e) => ToolOutcome::error(e.to_string()),
        })
    }
}

async fn wait_for(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_summarize_triggers_at_ninety_five_percent() {
        assert!(!should_auto_summarize(94_999, 100_000));
        assert!(should_auto_summarize(95_000, 100_000));
        assert!(should_auto_summarize(100_000, 100_000));
        assert!(!should_auto_summarize(1, 0));
    }
}

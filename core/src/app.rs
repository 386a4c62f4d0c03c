//! Application root: wires the services, supervisors, and brokers together,
//! owns the unified UI event channel, and drives graceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;

use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::agent::Agent;
use crate::agent::ToolKind;
use crate::agent::tools::McpTool;
use crate::auth::TokenBroker;
use crate::config::Config;
use crate::error::Result;
use crate::error::TetherErr;
use crate::history::FileRecord;
use crate::history::HistoryService;
use crate::lsp::LspPool;
use crate::mcp::McpManager;
use crate::message::MessageService;
use crate::permission::PermissionService;
use crate::pubsub::Event;
use crate::pubsub::EventKind;
use crate::pubsub::SUBSCRIBER_SEND_TIMEOUT;
use crate::session::SessionService;
use tether_protocol::AgentEvent;
use tether_protocol::LspEvent;
use tether_protocol::McpEvent;
use tether_protocol::Message;
use tether_protocol::PermissionNotification;
use tether_protocol::PermissionRequest;
use tether_protocol::Role;
use tether_protocol::Session;
use tether_protocol::config_types::AppMode;

/// Capacity of the unified UI channel.
const UI_CHANNEL_CAPACITY: usize = 100;

const INPUT_HISTORY_FILENAME: &str = "input_history.jsonl";

const NON_INTERACTIVE_TITLE_PREFIX: &str = "Non-interactive: ";
const MAX_PROMPT_LENGTH_FOR_TITLE: usize = 100;

/// Everything the UI can receive on the unified channel.
#[derive(Debug, Clone)]
pub enum AppEvent {
    Session(Event<Session>),
    Message(Event<Message>),
    HistoryFile(Event<FileRecord>),
    Permission(Event<PermissionRequest>),
    PermissionNotification(Event<PermissionNotification>),
    Mcp(Event<McpEvent>),
    Lsp(Event<LspEvent>),
    Agent(Event<AgentEvent>),
}

pub struct App {
    pub sessions: Arc<SessionService>,
    pub messages: Arc<MessageService>,
    pub history: Arc<HistoryService>,
    pub permissions: Arc<PermissionService>,
    pub coder_agent: Option<Arc<Agent>>,
    pub lsp: Arc<LspPool>,
    pub mcp: Arc<McpManager>,
    pub auth: Arc<TokenBroker>,

    config: Arc<Config>,
    mode: std::sync::Mutex<AppMode>,
    input_history: std::sync::Mutex<Vec<String>>,

    events_rx: std::sync::Mutex<Option<mpsc::Receiver<AppEvent>>>,
    events_cancel: CancellationToken,
    forwarders: Mutex<JoinSet<()>>,
}

impl App {
    /// Wire the application. Fatal only when the data directory cannot be
    /// created; everything else degrades with a logged warning.
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let config = Arc::new(config);

        std::fs::create_dir_all(config.data_directory()).map_err(|e| {
            TetherErr::Other(anyhow::anyhow!(
                "unable to open data directory {}: {e}",
                config.data_directory().display()
            ))
        })?;

        let skip_permission_requests = config.app.yolo;
        let permissions = Arc::new(PermissionService::new(
            config.working_dir(),
            skip_permission_requests,
            config.effective_allowed_tools(),
        ));

        let sessions = Arc::new(SessionService::new());
        let messages = Arc::new(MessageService::new());
        let history = Arc::new(HistoryService::new());
        let auth = Arc::new(TokenBroker::new());
        let mcp = Arc::new(McpManager::new());
        let lsp = Arc::new(LspPool::new());

        let (events_tx, events_rx) = mpsc::channel::<AppEvent>(UI_CHANNEL_CAPACITY);
        let events_cancel = CancellationToken::new();
        let mut forwarders = JoinSet::new();

        // Fan-in: one forwarder per topic into the unified UI channel.
        setup_subscriber(
            &mut forwarders,
            "sessions",
            sessions.subscribe(&events_cancel),
            AppEvent::Session,
            events_tx.clone(),
            events_cancel.clone(),
        );
        setup_subscriber(
            &mut forwarders,
            "messages",
            messages.subscribe(&events_cancel),
            AppEvent::Message,
            events_tx.clone(),
            events_cancel.clone(),
        );
        setup_subscriber(
            &mut forwarders,
            "history",
            history.subscribe(&events_cancel),
            AppEvent::HistoryFile,
            events_tx.clone(),
            events_cancel.clone(),
        );
        setup_subscriber(
            &mut forwarders,
            "permissions",
            permissions.subscribe(&events_cancel),
            AppEvent::Permission,
            events_tx.clone(),
            events_cancel.clone(),
        );
        setup_subscriber(
            &mut forwarders,
            "permissions-notifications",
            permissions.subscribe_notifications(&events_cancel),
            AppEvent::PermissionNotification,
            events_tx.clone(),
            events_cancel.clone(),
        );
        setup_subscriber(
            &mut forwarders,
            "mcp",
            mcp.subscribe(&events_cancel),
            AppEvent::Mcp,
            events_tx.clone(),
            events_cancel.clone(),
        );
        setup_subscriber(
            &mut forwarders,
            "lsp",
            lsp.subscribe(&events_cancel),
            AppEvent::Lsp,
            events_tx.clone(),
            events_cancel.clone(),
        );

        // Start LSP clients in the background; they are not needed to serve
        // the first prompt.
        {
            let lsp = Arc::clone(&lsp);
            let configs = config.lsp.clone();
            let root = config.working_dir().to_path_buf();
            tokio::spawn(async move {
                lsp.start_clients(&configs, &root).await;
            });
        }

        // MCP servers start concurrently under their own budget; their
        // discovered tools feed the agent below.
        let mcp_tools = mcp.initialize_clients(&config.mcp).await;

        let coder_agent = if config.is_configured() {
            let wrappers = build_mcp_tool_wrappers(mcp_tools, &mcp, &permissions);
            match Agent::new(
                Arc::clone(&config),
                Arc::clone(&permissions),
                Arc::clone(&sessions),
                Arc::clone(&messages),
                Arc::clone(&history),
                Arc::clone(&auth),
                wrappers,
            ) {
                Ok(agent) => {
                    setup_subscriber(
                        &mut forwarders,
                        "coder-agent",
                        agent.subscribe(&events_cancel),
                        AppEvent::Agent,
                        events_tx.clone(),
                        events_cancel.clone(),
                    );
                    Some(agent)
                }
                Err(e) => {
                    warn!("failed to initialize coder agent: {e}");
                    None
                }
            }
        } else {
            warn!("no provider configured; agent disabled");
            None
        };

        let app = Arc::new(Self {
            sessions,
            messages,
            history,
            permissions,
            coder_agent,
            lsp,
            mcp,
            auth,
            mode: std::sync::Mutex::new(config.active_mode()),
            config,
            input_history: std::sync::Mutex::new(Vec::new()),
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            events_cancel,
            forwarders: Mutex::new(forwarders),
        });

        // Best-effort; read errors are non-fatal.
        if let Err(e) = app.load_input_history() {
            warn!("failed to load input history: {e}");
        }

        Ok(app)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mode(&self) -> AppMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_mode(&self, mode: AppMode) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    /// The unified UI event channel; takeable once by the UI layer.
    pub fn take_events(&self) -> Option<mpsc::Receiver<AppEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Handle a prompt supplied on the command line: create an
    /// auto-approved session, run the agent, and stream the assistant text
    /// to stdout exactly once.
    pub async fn run_non_interactive(&self, prompt: &str, quiet: bool) -> Result<()> {
        info!("running in non-interactive mode");

        let session = self.sessions.create(&non_interactive_title(prompt)).await;
        info!(session_id = %session.id, "created session for non-interactive run");

        self.permissions.auto_approve_session(&session.id);

        let agent = self
            .coder_agent
            .as_ref()
            .ok_or_else(|| TetherErr::Other(anyhow::anyhow!("coder agent is not initialized")))?;

        let cancel = CancellationToken::new();
        let mut message_events = self.messages.subscribe(&cancel);
        let mut done = agent.run(&session.id, prompt).await?;

        let mut read_bytes = 0usize;
        // Stream only the run's own assistant message; later history
        // rewrites (summaries, deletions) must not reach stdout.
        let mut streaming_id: Option<String> = None;
        loop {
            tokio::select! {
                result = done.recv() => {
                    let result = result
                        .ok_or_else(|| TetherErr::Other(anyhow::anyhow!("agent stream closed without a result")))?;
                    match result {
                        Ok(message) => {
                            let content = message.content();
                            if content.len() < read_bytes {
                                // Impossible state; log and fail rather than panic.
                                tracing::error!(
                                    message_length = content.len(),
                                    read_bytes,
                                    "message content is shorter than streamed bytes"
                                );
                                return Err(TetherErr::Other(anyhow::anyhow!(
                                    "message content is shorter than streamed bytes: {} < {read_bytes}",
                                    content.len()
                                )));
                            }
                            println!("{}", &content[read_bytes..]);
                            info!(session_id = %session.id, "non-interactive run completed");
                            return Ok(());
                        }
                        Err(e) if e.is_cancelled() => {
                            info!(session_id = %session.id, "non-interactive run cancelled");
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    }
                }
                event = message_events.recv() => {
                    let Some(event) = event else { continue };
                    if quiet || event.kind == EventKind::Deleted {
                        continue;
                    }
                    let message = event.payload;
                    if message.session_id != session.id
                        || message.role != Role::Assistant
                    {
                        continue;
                    }
                    match &streaming_id {
                        None => streaming_id = Some(message.id.clone()),
                        Some(id) if *id != message.id => continue,
                        Some(_) => {}
                    }
                    let content = message.content();
                    if content.len() > read_bytes {
                        print!("{}", &content[read_bytes..]);
                        read_bytes = content.len();
                    }
                }
            }
        }
    }

    pub fn update_agent_model(&self) -> Result<()> {
        match &self.coder_agent {
            Some(agent) => agent.update_model(),
            None => Err(TetherErr::Other(anyhow::anyhow!(
                "coder agent is not initialized"
            ))),
        }
    }

    fn input_history_path(&self) -> std::path::PathBuf {
        self.config.data_directory().join(INPUT_HISTORY_FILENAME)
    }

    /// Load the persisted input history; malformed lines are skipped.
    fn load_input_history(&self) -> std::io::Result<()> {
        let data = match std::fs::read_to_string(self.input_history_path()) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut loaded = Vec::new();
        for line in data.lines() {
            match serde_json::from_str::<String>(line) {
                Ok(entry) if !entry.is_empty() => loaded.push(entry),
                Ok(_) => {}
                Err(_) => debug!("skipping malformed input history line"),
            }
        }
        if !loaded.is_empty() {
            self.input_history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(loaded);
        }
        Ok(())
    }

    /// Append one submitted prompt to the in-memory and on-disk history.
    /// Consecutive duplicates are dropped; entries persist as one JSON
    /// string per line.
    pub fn append_input_history(&self, entry: &str) -> std::io::Result<()> {
        use std::io::Write;

        let entry = entry.trim();
        if entry.is_empty() {
            return Ok(());
        }
        {
            let mut history = self
                .input_history
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if history.last().map(String::as_str) == Some(entry) {
                return Ok(());
            }
            history.push(entry.to_string());
        }

        std::fs::create_dir_all(self.config.data_directory())?;
        let mut line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::other(format!("failed to encode history entry: {e}")))?;
        line.push('\n');

        let mut options = std::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(self.input_history_path())?;
        file.write_all(line.as_bytes())
    }

    pub fn input_history(&self) -> Vec<String> {
        self.input_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Graceful shutdown: cancel agent requests, stop the LSP pool
    /// (watchers first, then clients under their budget), close MCP
    /// clients, stop every broker, and tear down the UI fan-in.
    pub async fn shutdown(&self) {
        if let Some(agent) = &self.coder_agent {
            agent.cancel_all();
        }

        self.lsp.shutdown().await;
        self.mcp.close_all().await;

        if let Some(agent) = &self.coder_agent {
            agent.shutdown();
        }
        self.sessions.shutdown();
        self.messages.shutdown();
        self.history.shutdown();
        self.permissions.shutdown();

        self.events_cancel.cancel();
        let mut forwarders = self.forwarders.lock().await;
        while forwarders.join_next().await.is_some() {}
        debug!("application shutdown complete");
    }
}

/// Session title for a command-line run. Truncation counts characters, not
/// bytes, so multi-byte prompts never split mid-character.
fn non_interactive_title(prompt: &str) -> String {
    let mut title = String::from(NON_INTERACTIVE_TITLE_PREFIX);
    if prompt.chars().count() > MAX_PROMPT_LENGTH_FOR_TITLE {
        title.extend(prompt.chars().take(MAX_PROMPT_LENGTH_FOR_TITLE));
        title.push_str("...");
    } else {
        title.push_str(prompt);
    }
    title
}

fn build_mcp_tool_wrappers(
    tools_by_server: HashMap<String, Vec<tether_mcp_types::Tool>>,
    mcp: &Arc<McpManager>,
    permissions: &Arc<PermissionService>,
) -> Vec<ToolKind> {
    let mut wrappers = Vec::new();
    for (server, tools) in tools_by_server {
        for tool in tools {
            wrappers.push(ToolKind::Mcp(McpTool::new(
                server.clone(),
                tool,
                Arc::clone(mcp),
                Arc::clone(permissions),
            )));
        }
    }
    wrappers
}

/// Forward one topic into the unified UI channel. A send that cannot
/// complete within the per-subscriber bound is dropped with a warning
/// naming the topic; producers are never blocked indefinitely by a slow UI.
fn setup_subscriber<T: Send + 'static>(
    forwarders: &mut JoinSet<()>,
    name: &'static str,
    mut source: mpsc::Receiver<Event<T>>,
    wrap: fn(Event<T>) -> AppEvent,
    events_tx: mpsc::Sender<AppEvent>,
    cancel: CancellationToken,
) {
    forwarders.spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(name, "subscription cancelled");
                    return;
                }
                event = source.recv() => event,
            };
            let Some(event) = event else {
                debug!(name, "subscription channel closed");
                return;
            };
            tokio::select! {
                result = events_tx.send_timeout(wrap(event), SUBSCRIBER_SEND_TIMEOUT) => {
                    if let Err(mpsc::error::SendTimeoutError::Timeout(_)) = result {
                        warn!(name, "message dropped due to slow consumer");
                    } else if result.is_err() {
                        debug!(name, "UI channel closed");
                        return;
                    }
                }
                _ = cancel.cancelled() => {
                    debug!(name, "subscription cancelled");
                    return;
                }
            }
        }
    });
}

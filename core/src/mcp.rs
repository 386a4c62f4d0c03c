//! Supervisor for configured MCP servers.
//!
//! Owns one [`McpClient`] per server and the per-server state machine
//! (Disabled → Starting → Connected/Error). State transitions are the only
//! way the published [`McpClientInfo`] changes, and every transition emits
//! an event on the `mcp` topic. Restarts are single-flight per server: a
//! lazily materialised per-name mutex serializes them without blocking
//! operations on other servers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use anyhow::anyhow;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::config::McpConfig;
use crate::csync;
use crate::pubsub::Broker;
use crate::pubsub::Event;
use crate::pubsub::EventKind;
use crate::util::now_ms;
use tether_mcp_client::McpClient;
use tether_mcp_types::ClientCapabilities;
use tether_mcp_types::ContentBlock;
use tether_mcp_types::Implementation;
use tether_mcp_types::InitializeRequestParams;
use tether_mcp_types::MCP_SCHEMA_VERSION;
use tether_mcp_types::Tool;
use tether_protocol::McpClientInfo;
use tether_protocol::McpEvent;
use tether_protocol::McpState;
use tether_protocol::config_types::McpTransportType;

/// Budget for spawning, initializing, and first-listing one server.
pub const MCP_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default budget for an individual tool call.
const MCP_TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Error shapes that indicate the transport died underneath us and a
/// restart may succeed. Matched as lower-cased substrings.
const TRANSIENT_TRANSPORT_PATTERNS: &[&str] = &[
    "broken pipe",
    "connection reset",
    "eof",
    "closed network connection",
    "transport error",
];

pub(crate) fn is_transient_transport_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    TRANSIENT_TRANSPORT_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

/// The rendered result of one tool invocation. Tool-level failures are
/// carried in-band so the agent can surface them as result parts instead of
/// aborting the turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

pub struct McpManager {
    clients: csync::Map<String, Arc<McpClient>>,
    configs: csync::Map<String, McpConfig>,
    states: csync::Map<String, McpClientInfo>,
    restart_locks: csync::LockMap<String>,
    broker: Broker<McpEvent>,
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new()
    }
}

impl McpManager {
    pub fn new() -> Self {
        Self {
            clients: csync::Map::new(),
            configs: csync::Map::new(),
            states: csync::Map::new(),
            restart_locks: csync::LockMap::new(),
            broker: Broker::new("mcp"),
        }
    }

    /// Start every non-disabled server concurrently, each under the startup
    /// budget. Failures drive the individual server to `Error` without
    /// affecting the others. Returns the discovered tools per server.
    pub async fn initialize_clients(
        self: &Arc<Self>,
        servers: &HashMap<String, McpConfig>,
    ) -> HashMap<String, Vec<Tool>> {
        let mut join_set = JoinSet::new();

        for (name, cfg) in servers {
            self.configs.set(name.clone(), cfg.clone());
            if cfg.disabled {
                self.update_state(name, McpState::Disabled, None, 0).await;
                continue;
            }
            self.update_state(name, McpState::Starting, None, 0).await;

            let manager = Arc::clone(self);
            let name = name.clone();
            let cfg = cfg.clone();
            join_set.spawn(async move {
                let result = tokio::time::timeout(MCP_STARTUP_TIMEOUT, start_client(&cfg))
                    .await
                    .map_err(|_| anyhow!("timed out initializing MCP server"))
                    .and_then(|r| r);
                match result {
                    Ok((client, tools)) => {
                        manager.clients.set(name.clone(), Arc::new(client));
                        manager
                            .update_state(&name, McpState::Connected, None, tools.len())
                            .await;
                        info!(name, tools = tools.len(), "initialized mcp client");
                        (name, Some(tools))
                    }
                    Err(e) => {
                        warn!(name, "error initializing mcp client: {e:#}");
                        manager
                            .update_state(&name, McpState::Error, Some(e.to_string()), 0)
                            .await;
                        (name, None)
                    }
                }
            });
        }

        let mut tools_by_server = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Some(tools))) => {
                    tools_by_server.insert(name, tools);
                }
                Ok((_, None)) => {}
                Err(e) => warn!("task panic while starting MCP server: {e:#}"),
            }
        }
        tools_by_server
    }

    /// Tear down and re-establish one server's client. Single-flight: a
    /// concurrent restart that already produced a connected client is
    /// reused instead of restarting again.
    pub async fn restart_client(&self, name: &str) -> Result<Arc<McpClient>> {
        let cfg = self
            .configs
            .get(&name.to_string())
            .ok_or_else(|| anyhow!("no mcp config found for {name}"))?;

        let lock = self.restart_locks.lock_for(&name.to_string());
        let _guard = lock.lock().await;

        // Another caller may have finished the restart while we waited.
        if let Some(existing) = self.clients.get(&name.to_string())
            && self
                .states
                .get(&name.to_string())
                .map(|info| info.state == McpState::Connected)
                .unwrap_or(false)
        {
            return Ok(existing);
        }

        if let Some(existing) = self.clients.take(&name.to_string()) {
            existing.close();
        }

        self.update_state(name, McpState::Starting, None, 0).await;
        let result = tokio::time::timeout(MCP_STARTUP_TIMEOUT, start_client(&cfg))
            .await
            .map_err(|_| anyhow!("timed out restarting MCP server"))
            .and_then(|r| r);

        match result {
            Ok((client, tools)) => {
                let client = Arc::new(client);
                self.clients.set(name.to_string(), Arc::clone(&client));
                self.update_state(name, McpState::Connected, None, tools.len())
                    .await;
                Ok(client)
            }
            Err(e) => {
                self.update_state(name, McpState::Error, Some(e.to_string()), 0)
                    .await;
                Err(e)
            }
        }
    }

    /// Invoke `tool_name` on server `name` with raw JSON `input`.
    ///
    /// A missing or previously errored client is lazily restarted once. A
    /// transient transport failure on the call itself drives the server to
    /// `Error`, then restart+retry exactly once; on persistent failure the
    /// composed error references both the original and the restart failure.
    pub async fn run_tool(&self, name: &str, tool_name: &str, input: &str) -> ToolOutcome {
        let trimmed = input.trim();
        let raw = if trimmed.is_empty() { "{}" } else { trimmed };
        let arguments: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => return ToolOutcome::error(format!("error parsing parameters: {e}")),
        };
        let arguments = if arguments.is_null() {
            None
        } else {
            Some(arguments)
        };

        let client = match self.clients.get(&name.to_string()) {
            Some(client)
                if self
                    .states
                    .get(&name.to_string())
                    .map(|info| info.state == McpState::Connected)
                    .unwrap_or(false) =>
            {
                client
            }
            _ => match self.restart_client(name).await {
                Ok(client) => client,
                Err(e) => {
                    return ToolOutcome::error(format!("mcp '{name}' not available: {e}"));
                }
            },
        };

        let call = |client: Arc<McpClient>, arguments: Option<serde_json::Value>| async move {
            client
                .call_tool(
                    tool_name.to_string(),
                    arguments,
                    Some(MCP_TOOL_CALL_TIMEOUT),
                )
                .await
        };

        let mut result = call(client, arguments.clone()).await;
        if let Err(e) = &result
            && is_transient_transport_error(&e.to_string())
        {
            let original = e.to_string();
            warn!(name, "MCP transport error, attempting restart: {original}");
            let tool_count = self
                .states
                .get(&name.to_string())
                .map(|info| info.tool_count)
                .unwrap_or(0);
            self.update_state(name, McpState::Error, Some(original.clone()), tool_count)
                .await;
            match self.restart_client(name).await {
                Ok(client) => {
                    result = call(client, arguments).await;
                }
                Err(restart_err) => {
                    result = Err(anyhow!("{original}; restart failed: {restart_err}"));
                }
            }
        }

        match result {
            Ok(call_result) => {
                let mut output = String::new();
                for block in &call_result.content {
                    match block {
                        ContentBlock::Text { text } => output.push_str(text),
                        ContentBlock::Other(value) => {
                            output.push_str(&value.to_string());
                        }
                    }
                }
                if call_result.is_error.unwrap_or(false) {
                    ToolOutcome::error(output)
                } else {
                    ToolOutcome::text(output)
                }
            }
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }

    pub fn states(&self) -> HashMap<String, McpClientInfo> {
        self.states.snapshot().into_iter().collect()
    }

    pub fn state(&self, name: &str) -> Option<McpClientInfo> {
        self.states.get(&name.to_string())
    }

    pub fn subscribe(&self, cancel: &CancellationToken) -> mpsc::Receiver<Event<McpEvent>> {
        self.broker.subscribe(cancel)
    }

    /// Close every live client and shut the topic down. Further state
    /// mutations are dropped by the broker.
    pub async fn close_all(&self) {
        for (_, client) in self.clients.drain() {
            client.close();
        }
        self.broker.shutdown();
    }

    async fn update_state(
        &self,
        name: &str,
        state: McpState,
        error: Option<String>,
        tool_count: usize,
    ) {
        let info = McpClientInfo {
            name: name.to_string(),
            state,
            error: error.clone(),
            connected_at: (state == McpState::Connected).then(now_ms),
            tool_count,
        };
        self.states.set(name.to_string(), info);
        self.broker
            .publish(
                EventKind::Updated,
                McpEvent {
                    name: name.to_string(),
                    state,
                    error,
                    tool_count,
                },
            )
            .await;
    }
}

/// Spawn + initialize + first tools listing for one server, transport
/// selected by config.
async fn start_client(cfg: &McpConfig) -> Result<(McpClient, Vec<Tool>)> {
    let client = match cfg.r#type {
        McpTransportType::Stdio => {
            let command = cfg
                .command
                .as_deref()
                .ok_or_else(|| anyhow!("stdio MCP server requires a command"))?;
            McpClient::new_stdio_client(
                command.into(),
                cfg.args.iter().map(Into::into).collect(),
                Some(cfg.resolved_env()),
            )
            .await?
        }
        McpTransportType::Http => {
            let url = cfg
                .url
                .as_deref()
                .ok_or_else(|| anyhow!("http MCP server requires a url"))?;
            McpClient::new_streamable_http_client(url.to_string(), cfg.resolved_headers())?
        }
        McpTransportType::Sse => {
            let url = cfg
                .url
                .as_deref()
                .ok_or_else(|| anyhow!("sse MCP server requires a url"))?;
            McpClient::new_sse_client(url.to_string(), cfg.resolved_headers()).await?
        }
    };

    let params = InitializeRequestParams {
        capabilities: ClientCapabilities {
            elicitation: Some(json!({})),
            ..Default::default()
        },
        client_info: Implementation {
            name: "tether-mcp-client".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Tether".to_string()),
        },
        protocol_version: MCP_SCHEMA_VERSION.to_string(),
    };
    client
        .initialize(params, None, Some(MCP_STARTUP_TIMEOUT))
        .await?;

    let tools = client
        .list_tools(None, Some(MCP_STARTUP_TIMEOUT))
        .await
        .map(|result| result.tools)
        .unwrap_or_else(|e| {
            warn!("failed to list tools for MCP server: {e:#}");
            Vec::new()
        });

    Ok((client, tools))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_patterns_match_case_insensitively() {
        assert!(is_transient_transport_error("write: Broken Pipe"));
        assert!(is_transient_transport_error("unexpected EOF"));
        assert!(is_transient_transport_error(
            "use of closed network connection"
        ));
        assert!(is_transient_transport_error(
            "transport error: connection reset by peer"
        ));
        assert!(!is_transient_transport_error("no such tool"));
        assert!(!is_transient_transport_error("server returned HTTP 500"));
    }
}

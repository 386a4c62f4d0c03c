use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::models::Message;

/// Lifecycle state of one supervised MCP server.
#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum McpState {
    #[default]
    Disabled,
    Starting,
    Connected,
    Error,
}

/// Published on the `mcp` topic for every state transition of a server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct McpEvent {
    pub name: String,
    pub state: McpState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tool_count: usize,
}

/// Snapshot of a supervised MCP server, mutated only through state
/// transitions in the supervisor.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct McpClientInfo {
    pub name: String,
    pub state: McpState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds since the Unix epoch; set on entering `Connected`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<i64>,
    pub tool_count: usize,
}

/// Lifecycle state of one LSP client in the pool.
#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LspState {
    #[default]
    Disabled,
    Starting,
    Ready,
    Error,
    Stopped,
}

/// Published on the `lsp` topic, mirroring client state changes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LspEvent {
    pub name: String,
    pub state: LspState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub diagnostic_count: usize,
}

/// Parameters a tool supplies when it asks for authorization.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatePermissionRequest {
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    /// Action key within the tool, e.g. `execute`.
    pub action: String,
    pub description: String,
    /// Opaque JSON payload forwarded for display.
    pub params: String,
    pub path: String,
}

/// A pending authorization request as published on the permissions topic.
/// Resolved exactly once by grant, persistent grant, deny, or the global
/// skip override.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub action: String,
    pub description: String,
    pub params: String,
    pub path: String,
}

/// Human-readable permission activity, distinct from the requests topic.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PermissionNotification {
    pub tool_call_id: String,
    pub granted: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AgentEventKind {
    Response,
}

/// Published on the `coder-agent` topic as a request progresses.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AgentEvent {
    pub kind: AgentEventKind,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub done: bool,
}

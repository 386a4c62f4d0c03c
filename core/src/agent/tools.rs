//! Tools the agent can invoke: built-ins plus MCP wrappers.
//!
//! Tool kinds are a tagged variant with a common capability set
//! {name, info, run}. Every side-effecting tool routes through the
//! permission mediator before doing anything; a denial surfaces as
//! [`ErrorPermissionDenied`] and the agent turns it into an error result
//! part rather than aborting the turn.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::history::HistoryService;
use crate::mcp::McpManager;
use crate::mcp::ToolOutcome;
use crate::permission::ErrorPermissionDenied;
use crate::permission::PermissionService;
use tether_protocol::CreatePermissionRequest;

/// Default budget for one shell execution unless the call or config asks
/// for less.
pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_SHELL_OUTPUT_CHARS: usize = 30_000;
const MAX_VIEW_LINES: usize = 2_000;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    PermissionDenied(#[from] ErrorPermissionDenied),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Descriptor advertised to the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub required: Vec<String>,
}

/// One tool invocation as decoded from the provider stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments.
    pub input: String,
}

/// Context threaded through every tool run.
#[derive(Debug, Clone)]
pub struct ToolCtx {
    pub session_id: String,
    pub working_dir: PathBuf,
}

/// Tagged variant over the tool kinds the agent dispatches on.
pub enum ToolKind {
    Shell(ShellTool),
    View(ViewTool),
    Write(WriteTool),
    Mcp(McpTool),
}

impl ToolKind {
    pub fn name(&self) -> String {
        match self {
            ToolKind::Shell(_) => "shell".to_string(),
            ToolKind::View(_) => "view".to_string(),
            ToolKind::Write(_) => "write".to_string(),
            ToolKind::Mcp(tool) => tool.qualified_name(),
        }
    }

    pub fn info(&self) -> ToolInfo {
        match self {
            ToolKind::Shell(_) => ToolInfo {
                name: "shell".to_string(),
                description: "Execute a shell command in the workspace and return its output."
                    .to_string(),
                parameters: json!({
                    "command": {"type": "string", "description": "The command to execute"},
                    "timeout_ms": {"type": "integer", "description": "Optional timeout in milliseconds"},
                }),
                required: vec!["command".to_string()],
            },
            ToolKind::View(_) => ToolInfo {
                name: "view".to_string(),
                description: "Read a file from the workspace.".to_string(),
                parameters: json!({
                    "file_path": {"type": "string", "description": "Path of the file to read"},
                    "offset": {"type": "integer", "description": "First line to read (0-based)"},
                    "limit": {"type": "integer", "description": "Maximum number of lines"},
                }),
                required: vec!["file_path".to_string()],
            },
            ToolKind::Write(_) => ToolInfo {
                name: "write".to_string(),
                description: "Write content to a file, recording the previous version."
                    .to_string(),
                parameters: json!({
                    "file_path": {"type": "string", "description": "Path of the file to write"},
                    "content": {"type": "string", "description": "Full new file content"},
                }),
                required: vec!["file_path".to_string(), "content".to_string()],
            },
            ToolKind::Mcp(tool) => tool.info(),
        }
    }

    /// A tool-local timeout, when the tool defines one. The orchestrator
    /// takes the minimum of this and the configured per-call timeout.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            ToolKind::Shell(_) => Some(DEFAULT_SHELL_TIMEOUT),
            _ => None,
        }
    }

    pub async fn run(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutcome, ToolError> {
        match self {
            ToolKind::Shell(tool) => tool.run(ctx, call).await,
            ToolKind::View(tool) => tool.run(ctx, call).await,
            ToolKind::Write(tool) => tool.run(ctx, call).await,
            ToolKind::Mcp(tool) => tool.run(ctx, call).await,
        }
    }
}

#[derive(Deserialize)]
struct ShellParams {
    command: String,
    timeout_ms: Option<u64>,
}

pub struct ShellTool {
    permissions: Arc<PermissionService>,
}

impl ShellTool {
    pub fn new(permissions: Arc<PermissionService>) -> Self {
        Self { permissions }
    }

    async fn run(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutcome, ToolError> {
        let params: ShellParams = serde_json::from_str(&call.input)
            .map_err(|e| ToolError::InvalidParams(e.to_string()))?;

        let granted = self
            .permissions
            .request(CreatePermissionRequest {
                session_id: ctx.session_id.clone(),
                tool_call_id: call.id.clone(),
                tool_name: "shell".to_string(),
                action: "execute".to_string(),
                description: format!("execute `{}`", params.command),
                params: call.input.clone(),
                path: ctx.working_dir.display().to_string(),
            })
            .await;
        if !granted {
            return Err(ErrorPermissionDenied.into());
        }

        let timeout = params
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SHELL_TIMEOUT);
        debug!(command = %params.command, "running shell tool");

        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(&params.command)
            .current_dir(&ctx.working_dir)
            // No stdin: some commands (ripgrep among them) try to read from
            // it and would hang forever.
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Ok(ToolOutcome::error(format!(
                    "command timed out after {}ms",
                    timeout.as_millis()
                )));
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        let text = truncate_middle(&text, MAX_SHELL_OUTPUT_CHARS);

        if output.status.success() {
            Ok(ToolOutcome::text(text))
        } else {
            Ok(ToolOutcome::error(format!(
                "command exited with {}: {text}",
                output.status
            )))
        }
    }
}

#[derive(Deserialize)]
struct ViewParams {
    file_path: String,
    offset: Option<usize>,
    limit: Option<usize>,
}

pub struct ViewTool;

impl ViewTool {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutcome, ToolError> {
        let params: ViewParams = serde_json::from_str(&call.input)
            .map_err(|e| ToolError::InvalidParams(e.to_string()))?;
        let path = resolve_path(&ctx.working_dir, &params.file_path);

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                return Ok(ToolOutcome::error(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        let offset = params.offset.unwrap_or(0);
        let limit = params.limit.unwrap_or(MAX_VIEW_LINES).min(MAX_VIEW_LINES);
        let mut out = String::new();
        for (idx, line) in content.lines().enumerate().skip(offset).take(limit) {
            out.push_str(&format!("{:>6}\t{line}\n", idx + 1));
        }
        Ok(ToolOutcome::text(out))
    }
}

impl Default for ViewTool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct WriteParams {
    file_path: String,
    content: String,
}

pub struct WriteTool {
    permissions: Arc<PermissionService>,
    history: Arc<HistoryService>,
}

impl WriteTool {
    pub fn new(permissions: Arc<PermissionService>, history: Arc<HistoryService>) -> Self {
        Self {
            permissions,
            history,
        }
    }

    async fn run(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutcome, ToolError> {
        let params: WriteParams = serde_json::from_str(&call.input)
            .map_err(|e| ToolError::InvalidParams(e.to_string()))?;
        let path = resolve_path(&ctx.working_dir, &params.file_path);

        let granted = self
            .permissions
            .request(CreatePermissionRequest {
                session_id: ctx.session_id.clone(),
                tool_call_id: call.id.clone(),
                tool_name: "write".to_string(),
                action: "write".to_string(),
                description: format!("write {}", path.display()),
                params: call.input.clone(),
                path: path.display().to_string(),
            })
            .await;
        if !granted {
            return Err(ErrorPermissionDenied.into());
        }

        // Record the pre-image (or the initial version) before touching the
        // file so the session history can show what changed.
        let path_str = path.display().to_string();
        match tokio::fs::read_to_string(&path).await {
            Ok(previous) => {
                if self
                    .history
                    .get_by_path_and_session(&path_str, &ctx.session_id)
                    .await
                    .is_none()
                {
                    self.history
                        .create(&ctx.session_id, &path_str, &previous)
                        .await;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &params.content).await?;
        self.history
            .create_version(&ctx.session_id, &path_str, &params.content)
            .await;

        Ok(ToolOutcome::text(format!("wrote {}", path.display())))
    }
}

/// Wrapper exposing one discovered MCP tool to the agent.
pub struct McpTool {
    server_name: String,
    tool: tether_mcp_types::Tool,
    manager: Arc<McpManager>,
    permissions: Arc<PermissionService>,
}

impl McpTool {
    pub fn new(
        server_name: String,
        tool: tether_mcp_types::Tool,
        manager: Arc<McpManager>,
        permissions: Arc<PermissionService>,
    ) -> Self {
        Self {
            server_name,
            tool,
            manager,
            permissions,
        }
    }

    fn qualified_name(&self) -> String {
        format!("mcp_{}_{}", self.server_name, self.tool.name)
    }

    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: self.qualified_name(),
            description: self.tool.description.clone().unwrap_or_default(),
            parameters: self
                .tool
                .input_schema
                .properties
                .clone()
                .unwrap_or_else(|| json!({})),
            required: self.tool.input_schema.required.clone().unwrap_or_default(),
        }
    }

    async fn run(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutcome, ToolError> {
        let granted = self
            .permissions
            .request(CreatePermissionRequest {
                session_id: ctx.session_id.clone(),
                tool_call_id: call.id.clone(),
                tool_name: self.qualified_name(),
                action: "execute".to_string(),
                description: format!(
                    "execute {} with the following parameters: {}",
                    self.qualified_name(),
                    call.input
                ),
                params: call.input.clone(),
                path: ctx.working_dir.display().to_string(),
            })
            .await;
        if !granted {
            return Err(ErrorPermissionDenied.into());
        }

        Ok(self
            .manager
            .run_tool(&self.server_name, &self.tool.name, &call.input)
            .await)
    }
}

fn resolve_path(working_dir: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    }
}

/// Keep the head and tail of oversized output, eliding the middle.
fn truncate_middle(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let half = max_chars / 2;
    let head: String = text.chars().take(half).collect();
    let tail_start = text.chars().count() - half;
    let tail: String = text.chars().skip(tail_start).collect();
    format!("{head}\n... [output truncated] ...\n{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx(dir: &Path) -> ToolCtx {
        ToolCtx {
            session_id: "s1".to_string(),
            working_dir: dir.to_path_buf(),
        }
    }

    fn call(name: &str, input: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "c1".to_string(),
            name: name.to_string(),
            input: input.to_string(),
        }
    }

    fn allowing_permissions() -> Arc<PermissionService> {
        Arc::new(PermissionService::new(Path::new("/tmp"), true, Vec::new()))
    }

    #[test]
    fn truncate_middle_keeps_head_and_tail() {
        let long = "a".repeat(100) + &"b".repeat(100);
        let out = truncate_middle(&long, 40);
        assert!(out.starts_with("aaaa"));
        assert!(out.ends_with("bbbb"));
        assert!(out.contains("[output truncated]"));
        assert_eq!(truncate_middle("short", 40), "short");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_tool_captures_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = ShellTool::new(allowing_permissions());
        let outcome = tool
            .run(
                &ctx(dir.path()),
                &call("shell", serde_json::json!({"command": "echo tool-ok"})),
            )
            .await
            .expect("run");
        assert!(!outcome.is_error);
        assert!(outcome.content.contains("tool-ok"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_tool_reports_nonzero_exit_in_band() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = ShellTool::new(allowing_permissions());
        let outcome = tool
            .run(
                &ctx(dir.path()),
                &call("shell", serde_json::json!({"command": "exit 3"})),
            )
            .await
            .expect("run");
        assert!(outcome.is_error);
    }

    #[tokio::test]
    async fn shell_tool_denied_returns_sentinel() {
        let dir = tempfile::tempdir().expect("tempdir");
        // No skip, no allow-list: the request would block forever, so deny
        // it from the topic side.
        let permissions = Arc::new(PermissionService::new(Path::new("/tmp"), false, Vec::new()));
        let tool = ShellTool::new(permissions.clone());

        let cancel = tokio_util::sync::CancellationToken::new();
        let mut requests = permissions.subscribe(&cancel);
        let denier = tokio::spawn({
            let permissions = permissions.clone();
            async move {
                let event = requests.recv().await.expect("request");
                permissions.deny(&event.payload).await;
            }
        });

        let err = tool
            .run(
                &ctx(dir.path()),
                &call("shell", serde_json::json!({"command": "echo nope"})),
            )
            .await
            .expect_err("denied");
        assert!(matches!(err, ToolError::PermissionDenied(_)));
        denier.await.expect("denier");
    }

    #[tokio::test]
    async fn view_tool_reads_numbered_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("hello.txt"), "one\ntwo\n")
            .await
            .expect("write");
        let tool = ViewTool::new();
        let outcome = tool
            .run(
                &ctx(dir.path()),
                &call("view", serde_json::json!({"file_path": "hello.txt"})),
            )
            .await
            .expect("run");
        assert!(outcome.content.contains("1\tone"));
        assert!(outcome.content.contains("2\ttwo"));
    }

    #[tokio::test]
    async fn write_tool_records_history_versions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let history = Arc::new(HistoryService::new());
        let tool = WriteTool::new(allowing_permissions(), history.clone());

        let target = dir.path().join("notes.txt");
        tokio::fs::write(&target, "original").await.expect("seed");

        tool.run(
            &ctx(dir.path()),
            &call(
                "write",
                serde_json::json!({"file_path": "notes.txt", "content": "updated"}),
            ),
        )
        .await
        .expect("run");

        let stored = tokio::fs::read_to_string(&target).await.expect("read");
        assert_eq!(stored, "updated");

        let latest = history
            .get_by_path_and_session(&target.display().to_string(), "s1")
            .await
            .expect("latest version");
        assert_eq!(latest.content, "updated");
        assert_eq!(latest.version, crate::history::INITIAL_VERSION + 1);
    }
}

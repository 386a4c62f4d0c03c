//! A minimal async client for the Model Context Protocol (MCP).
//!
//! The client can reach a server three ways:
//!   1. Spawning a subprocess that speaks line-delimited JSON-RPC over stdio.
//!   2. Posting each request to a streamable-HTTP endpoint and reading the
//!      JSON response body.
//!   3. Holding an SSE event stream open for responses while posting
//!      requests to the endpoint the server advertises.
//!
//! All three hide the JSON-RPC framing behind the typed
//! [`ModelContextProtocolRequest`] API from `tether-mcp-types`.

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tether_mcp_types::CallToolRequest;
use tether_mcp_types::CallToolRequestParams;
use tether_mcp_types::CallToolResult;
use tether_mcp_types::InitializeRequest;
use tether_mcp_types::InitializeRequestParams;
use tether_mcp_types::InitializeResult;
use tether_mcp_types::InitializedNotification;
use tether_mcp_types::JSONRPC_VERSION;
use tether_mcp_types::JSONRPCMessage;
use tether_mcp_types::JSONRPCNotification;
use tether_mcp_types::JSONRPCRequest;
use tether_mcp_types::JSONRPCResponse;
use tether_mcp_types::ListToolsRequest;
use tether_mcp_types::ListToolsRequestParams;
use tether_mcp_types::ListToolsResult;
use tether_mcp_types::ModelContextProtocolNotification;
use tether_mcp_types::ModelContextProtocolRequest;
use tether_mcp_types::RequestId;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Capacity of the bounded channel between the client API and the stdio
/// writer task.
const CHANNEL_CAPACITY: usize = 128;

/// How long to wait for an SSE server to advertise its POST endpoint.
const SSE_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

type PendingSender = oneshot::Sender<JSONRPCMessage>;
type PendingMap = Arc<Mutex<HashMap<i64, PendingSender>>>;

enum Transport {
    Stdio {
        /// Retained so the subprocess lives exactly as long as the client.
        child: std::sync::Mutex<tokio::process::Child>,
        outgoing_tx: mpsc::Sender<JSONRPCMessage>,
    },
    Http {
        url: String,
        headers: HeaderMap,
        http: reqwest::Client,
    },
    Sse {
        post_url: String,
        headers: HeaderMap,
        http: reqwest::Client,
        reader: tokio::task::JoinHandle<()>,
    },
}

/// A running MCP client instance over one of the three transports.
pub struct McpClient {
    transport: Transport,
    /// `request.id -> oneshot::Sender` used to route responses that arrive
    /// on a background reader (stdio and SSE) back to their caller.
    pending: PendingMap,
    id_counter: AtomicI64,
}

impl McpClient {
    /// Spawn the given command and establish an MCP session over its stdio.
    /// The caller is responsible for sending `initialize`; see
    /// [`initialize`](Self::initialize).
    pub async fn new_stdio_client(
        program: OsString,
        args: Vec<OsString>,
        env: Option<HashMap<String, String>>,
    ) -> std::io::Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(create_env_for_mcp_server(env))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("failed to capture child stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("failed to capture child stdout"))?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JSONRPCMessage>(CHANNEL_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        // Writer task: serialize outbound messages onto the child's stdin,
        // one JSON object per line.
        let writer_handle = {
            let mut stdin = stdin;
            tokio::spawn(async move {
                while let Some(msg) = outgoing_rx.recv().await {
                    match serde_json::to_string(&msg) {
                        Ok(json) => {
                            debug!("MCP message to server: {json}");
                            if stdin.write_all(json.as_bytes()).await.is_err()
                                || stdin.write_all(b"\n").await.is_err()
                            {
                                error!("failed to write message to child stdin");
                                break;
                            }
                        }
                        Err(e) => error!("failed to serialize JSONRPCMessage: {e}"),
                    }
                }
            })
        };

        // Reader task: line-delimited JSON from the child's stdout, routed
        // into the pending map.
        let reader_handle = {
            let pending = pending.clone();
            let mut lines = BufReader::new(stdout).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("MCP message from server: {line}");
                    dispatch_line(&line, &pending).await;
                }
            })
        };

        // The tasks are intentionally detached; dropping the client closes
        // the channel and the child's pipes, which ends both loops.
        let _ = (writer_handle, reader_handle);

        Ok(Self {
            transport: Transport::Stdio {
                child: std::sync::Mutex::new(child),
                outgoing_tx,
            },
            pending,
            id_counter: AtomicI64::new(1),
        })
    }

    /// Client for a streamable-HTTP server: every request is a POST to
    /// `url`, the response body carries the JSON-RPC reply.
    pub fn new_streamable_http_client(
        url: String,
        headers: HashMap<String, String>,
    ) -> Result<Self> {
        Ok(Self {
            transport: Transport::Http {
                url,
                headers: build_header_map(&headers)?,
                http: reqwest::Client::new(),
            },
            pending: Arc::new(Mutex::new(HashMap::new())),
            id_counter: AtomicI64::new(1),
        })
    }

    /// Client for an SSE server: hold a GET event stream open for replies
    /// and POST requests to the endpoint the server advertises in its first
    /// `endpoint` event.
    pub async fn new_sse_client(url: String, headers: HashMap<String, String>) -> Result<Self> {
        use eventsource_stream::Eventsource;

        let header_map = build_header_map(&headers)?;
        let http = reqwest::Client::new();
        let resp = http
            .get(&url)
            .headers(header_map.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .with_context(|| format!("failed to open SSE stream to {url}"))?
            .error_for_status()?;

        let mut stream = resp.bytes_stream().eventsource();

        // The first event names the endpoint requests must be posted to.
        let endpoint = time::timeout(SSE_ENDPOINT_TIMEOUT, async {
            while let Some(event) = stream.next().await {
                let event = event?;
                if event.event == "endpoint" {
                    return Ok(event.data);
                }
            }
            Err(anyhow!("SSE stream closed before an endpoint event"))
        })
        .await
        .map_err(|_| anyhow!("timed out waiting for the SSE endpoint event"))??;

        let base = reqwest::Url::parse(&url)?;
        let post_url = base
            .join(&endpoint)
            .with_context(|| format!("invalid SSE endpoint `{endpoint}`"))?
            .to_string();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = {
            let pending = pending.clone();
            tokio::spawn(async move {
                while let Some(event) = stream.next().await {
                    match event {
                        Ok(event) if event.event == "message" => {
                            dispatch_line(&event.data, &pending).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("SSE stream error: {e}");
                            break;
                        }
                    }
                }
            })
        };

        Ok(Self {
            transport: Transport::Sse {
                post_url,
                headers: header_map,
                http,
                reader,
            },
            pending,
            id_counter: AtomicI64::new(1),
        })
    }

    /// Send an arbitrary MCP request and await the typed result.
    ///
    /// With `timeout == None` the call waits indefinitely; otherwise a
    /// timeout error is returned once the duration elapses.
    pub async fn send_request<R>(
        &self,
        params: R::Params,
        timeout: Option<Duration>,
    ) -> Result<R::Result>
    where
        R: ModelContextProtocolRequest,
        R::Params: Serialize,
        R::Result: DeserializeOwned,
    {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);

        // For many request types `Params` is `Option<T>`; `None` must be
        // encoded as absence of the field.
        let params_json = serde_json::to_value(&params)?;
        let params_field = if params_json.is_null() {
            None
        } else {
            Some(params_json)
        };

        let message = JSONRPCMessage::Request(JSONRPCRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: RequestId::Integer(id),
            method: R::METHOD.to_string(),
            params: params_field,
        });

        let msg = match &self.transport {
            Transport::Http { url, headers, http } => {
                let fut = post_message(http, url, headers, &message);
                match timeout {
                    Some(duration) => time::timeout(duration, fut)
                        .await
                        .map_err(|_| anyhow!("request timed out"))??,
                    None => fut.await?,
                }
                .ok_or_else(|| anyhow!("server returned no response body"))?
            }
            Transport::Stdio { .. } | Transport::Sse { .. } => {
                // Register in the pending map *before* sending so an
                // immediate response cannot be lost.
                let (tx, rx) = oneshot::channel();
                {
                    let mut guard = self.pending.lock().await;
                    guard.insert(id, tx);
                }

                if let Err(e) = self.send_message(message).await {
                    self.pending.lock().await.remove(&id);
                    return Err(e);
                }

                match timeout {
                    Some(duration) => match time::timeout(duration, rx).await {
                        Ok(Ok(msg)) => msg,
                        Ok(Err(_)) => {
                            self.pending.lock().await.remove(&id);
                            return Err(anyhow!(
                                "response channel closed before a reply was received"
                            ));
                        }
                        Err(_) => {
                            self.pending.lock().await.remove(&id);
                            return Err(anyhow!("request timed out"));
                        }
                    },
                    None => rx
                        .await
                        .map_err(|_| anyhow!("response channel closed before a reply was received"))?,
                }
            }
        };

        match msg {
            JSONRPCMessage::Response(JSONRPCResponse { result, .. }) => {
                let typed: R::Result = serde_json::from_value(result)?;
                Ok(typed)
            }
            JSONRPCMessage::Error(err) => Err(anyhow!(format!(
                "server returned JSON-RPC error: code = {}, message = {}",
                err.error.code, err.error.message
            ))),
            other => Err(anyhow!(format!(
                "unexpected message variant received in reply path: {other:?}"
            ))),
        }
    }

    pub async fn send_notification<N>(&self, params: N::Params) -> Result<()>
    where
        N: ModelContextProtocolNotification,
        N::Params: Serialize,
    {
        let params_json = serde_json::to_value(&params)?;
        let params_field = if params_json.is_null() {
            None
        } else {
            Some(params_json)
        };

        let method = N::METHOD.to_string();
        let notification = JSONRPCMessage::Notification(JSONRPCNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.clone(),
            params: params_field,
        });

        self.send_message(notification)
            .await
            .with_context(|| format!("failed to send notification `{method}`"))
            .map(|_| ())
    }

    /// Negotiates initialization: sends `initialize`, then the
    /// `notifications/initialized` notification once the response arrives.
    pub async fn initialize(
        &self,
        initialize_params: InitializeRequestParams,
        initialize_notification_params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<InitializeResult> {
        let response = self
            .send_request::<InitializeRequest>(initialize_params, timeout)
            .await?;
        self.send_notification::<InitializedNotification>(initialize_notification_params)
            .await?;
        Ok(response)
    }

    /// Convenience wrapper around `tools/list`.
    pub async fn list_tools(
        &self,
        params: Option<ListToolsRequestParams>,
        timeout: Option<Duration>,
    ) -> Result<ListToolsResult> {
        self.send_request::<ListToolsRequest>(params, timeout).await
    }

    /// Convenience wrapper around `tools/call`.
    pub async fn call_tool(
        &self,
        name: String,
        arguments: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult> {
        let params = CallToolRequestParams { name, arguments };
        debug!("MCP tool call: {params:?}");
        self.send_request::<CallToolRequest>(params, timeout).await
    }

    /// Tear the transport down: kill the stdio subprocess or stop the SSE
    /// reader. Subsequent requests fail.
    pub fn close(&self) {
        match &self.transport {
            Transport::Stdio { child, .. } => {
                if let Ok(mut child) = child.lock() {
                    let _ = child.start_kill();
                }
            }
            Transport::Sse { reader, .. } => reader.abort(),
            Transport::Http { .. } => {}
        }
    }

    async fn send_message(&self, message: JSONRPCMessage) -> Result<Option<JSONRPCMessage>> {
        match &self.transport {
            Transport::Stdio { outgoing_tx, .. } => {
                outgoing_tx
                    .send(message)
                    .await
                    .map_err(|_| anyhow!("failed to send message to writer task - channel closed"))?;
                Ok(None)
            }
            Transport::Http { url, headers, http } => {
                post_message(http, url, headers, &message).await
            }
            Transport::Sse {
                post_url,
                headers,
                http,
                ..
            } => {
                // Replies arrive on the event stream; the POST only acks.
                post_message(http, post_url, headers, &message).await?;
                Ok(None)
            }
        }
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        match &self.transport {
            Transport::Stdio { child, .. } => {
                // kill_on_drop already covers the subprocess; reaping it
                // eagerly avoids leaving a zombie until the runtime gets to it.
                if let Ok(mut child) = child.lock() {
                    let _ = child.try_wait();
                }
            }
            Transport::Sse { reader, .. } => reader.abort(),
            Transport::Http { .. } => {}
        }
    }
}

/// POST one JSON-RPC message; returns the decoded reply when the server
/// responds with a JSON body.
async fn post_message(
    http: &reqwest::Client,
    url: &str,
    headers: &HeaderMap,
    message: &JSONRPCMessage,
) -> Result<Option<JSONRPCMessage>> {
    let resp = http
        .post(url)
        .headers(headers.clone())
        .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
        .json(message)
        .send()
        .await
        .with_context(|| format!("failed to POST MCP message to {url}"))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(anyhow!("server returned HTTP {status}"));
    }

    let body = resp.bytes().await?;
    if body.is_empty() {
        return Ok(None);
    }
    match serde_json::from_slice::<JSONRPCMessage>(&body) {
        Ok(msg) => Ok(Some(msg)),
        // Accepted-with-no-reply bodies (e.g. "Accepted") are fine for
        // notifications and SSE posts.
        Err(e) => {
            debug!("ignoring non-JSON-RPC response body: {e}");
            Ok(None)
        }
    }
}

/// Route one serialized JSON-RPC message from a background reader.
async fn dispatch_line(line: &str, pending: &PendingMap) {
    match serde_json::from_str::<JSONRPCMessage>(line) {
        Ok(JSONRPCMessage::Response(resp)) => {
            let id = match &resp.id {
                RequestId::Integer(i) => *i,
                RequestId::String(_) => {
                    // We only ever generate integer IDs.
                    error!("response with string ID - no matching pending request");
                    return;
                }
            };
            let tx_opt = pending.lock().await.remove(&id);
            if let Some(tx) = tx_opt {
                let _ = tx.send(JSONRPCMessage::Response(resp));
            } else {
                warn!(id, "no pending request found for response");
            }
        }
        Ok(JSONRPCMessage::Error(err)) => {
            let id = match &err.id {
                RequestId::Integer(i) => *i,
                RequestId::String(_) => return,
            };
            let tx_opt = pending.lock().await.remove(&id);
            if let Some(tx) = tx_opt {
                let _ = tx.send(JSONRPCMessage::Error(err));
            }
        }
        Ok(JSONRPCMessage::Notification(_)) => {
            info!("<- notification: {line}");
        }
        Ok(other) => {
            info!("<- unhandled message: {other:?}");
        }
        Err(e) => {
            error!("failed to deserialize JSONRPCMessage: {e}; line = {line}");
        }
    }
}

fn build_header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::try_from(name.as_str())
            .with_context(|| format!("invalid header name `{name}`"))?;
        let value = HeaderValue::try_from(value.as_str())
            .with_context(|| format!("invalid value for header `{name:?}`"))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Environment variables that are always forwarded when spawning an MCP
/// server over stdio; everything else must be opted in via the server's
/// `env` config.
#[rustfmt::skip]
#[cfg(unix)]
const DEFAULT_ENV_VARS: &[&str] = &[
    "HOME",
    "LANG",
    "LC_ALL",
    "LOGNAME",
    "PATH",
    "SHELL",
    "TERM",
    "TMPDIR",
    "TZ",
    "USER",
];

#[cfg(windows)]
const DEFAULT_ENV_VARS: &[&str] = &[
    "PATH",
    "PATHEXT",
    "TEMP",
    "TMP",
    "USERDOMAIN",
    "USERNAME",
    "USERPROFILE",
];

/// `extra_env` comes from the `mcp.<name>.env` table in the config file.
pub fn create_env_for_mcp_server(
    extra_env: Option<HashMap<String, String>>,
) -> HashMap<String, String> {
    DEFAULT_ENV_VARS
        .iter()
        .filter_map(|var| match std::env::var(var) {
            Ok(value) => Some((var.to_string(), value)),
            Err(_) => None,
        })
        .chain(extra_env.unwrap_or_default())
        .collect::<HashMap<_, _>>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    #[test]
    fn create_env_for_mcp_server_overlays_extra_env() {
        let env_var = "PATH";
        let existing = std::env::var(env_var).unwrap_or_default();
        let replacement = format!("{existing}-extra");
        let extra = HashMap::from([(env_var.to_owned(), replacement.clone())]);
        let env = create_env_for_mcp_server(Some(extra));
        assert_eq!(Some(&replacement), env.get(env_var));
    }

    #[tokio::test]
    async fn http_client_round_trips_list_tools() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {
                    "tools": [{
                        "name": "echo",
                        "inputSchema": {"type": "object"}
                    }]
                }
            })))
            .mount(&server)
            .await;

        let client = McpClient::new_streamable_http_client(
            format!("{}/mcp", server.uri()),
            HashMap::new(),
        )
        .expect("client");
        let tools = client
            .list_tools(None, Some(Duration::from_secs(5)))
            .await
            .expect("list tools");
        assert_eq!(tools.tools.len(), 1);
        assert_eq!(tools.tools[0].name, "echo");
    }

    #[tokio::test]
    async fn http_client_surfaces_jsonrpc_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32601, "message": "no such method"}
            })))
            .mount(&server)
            .await;

        let client =
            McpClient::new_streamable_http_client(server.uri(), HashMap::new()).expect("client");
        let err = client
            .list_tools(None, Some(Duration::from_secs(5)))
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("no such method"));
    }
}

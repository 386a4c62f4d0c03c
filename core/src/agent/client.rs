//! Streaming provider client.
//!
//! The provider adapters proper (the exact OpenAI/Anthropic/Gemini wire
//! payloads) are external collaborators; what the agent consumes is the
//! streaming-response contract modelled by [`ResponseEvent`]: a sequence of
//! text deltas and tool calls terminated by a `completed` envelope carrying
//! usage. The client owns endpoint/header shapes per provider type, the
//! SSE pump with an idle timeout, and the single 401-refresh-retry against
//! the OAuth broker.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::agent::tools::ToolInfo;
use crate::auth::TokenBroker;
use crate::config::Config;
use crate::config::ModelDescriptor;
use crate::config::ProviderConfig;
use crate::config::SelectedModel;
use crate::error::Result;
use crate::error::TetherErr;
use tether_protocol::Message;
use tether_protocol::TokenUsage;
use tether_protocol::config_types::ProviderType;
use tether_protocol::config_types::SelectedModelType;

/// If the stream stays completely silent this long, treat it as dead.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const EVENT_CHANNEL_CAPACITY: usize = 64;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const ANTHROPIC_API_VERSION: &str = "2023-06-01";

/// One unit of the streaming-response contract.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    TextDelta(String),
    ToolCall {
        id: String,
        name: String,
        input: String,
    },
    Completed {
        usage: TokenUsage,
    },
}

/// Bounded stream of [`ResponseEvent`]s; ends after `Completed` or an error.
pub struct ResponseStream {
    rx_event: mpsc::Receiver<Result<ResponseEvent>>,
}

impl ResponseStream {
    pub async fn recv(&mut self) -> Option<Result<ResponseEvent>> {
        self.rx_event.recv().await
    }
}

#[derive(Clone)]
pub struct ModelClient {
    http: reqwest::Client,
    provider_id: String,
    provider: ProviderConfig,
    selected: SelectedModel,
    descriptor: ModelDescriptor,
    auth: Arc<TokenBroker>,
}

impl ModelClient {
    /// Bind to the selected model of `model_type`; fails when no model is
    /// selected or its provider is missing.
    pub fn from_config(
        config: &Config,
        model_type: SelectedModelType,
        auth: Arc<TokenBroker>,
    ) -> Result<Self> {
        let selected = config
            .selected_model(model_type)
            .cloned()
            .ok_or(TetherErr::NoModelSelected)?;
        let (provider_id, provider) = config
            .provider_for(model_type)
            .ok_or(TetherErr::NoModelSelected)?;
        let descriptor = config.model_descriptor(model_type).unwrap_or(ModelDescriptor {
            id: selected.model.clone(),
            name: None,
            context_window: 128_000,
            default_max_tokens: 4_096,
        });
        let api_key = config.resolved_api_key(provider);

        Ok(Self {
            http: reqwest::Client::new(),
            provider_id: provider_id.to_string(),
            provider: ProviderConfig {
                api_key,
                ..provider.clone()
            },
            selected,
            descriptor,
            auth,
        })
    }

    pub fn model(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn context_window(&self) -> u64 {
        self.descriptor.context_window
    }

    /// Open a streaming turn. On HTTP 401 with an OAuth record for the
    /// provider, refresh and retry exactly once before giving up.
    pub async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolInfo],
    ) -> Result<ResponseStream> {
        let payload = self.build_payload(messages, tools)?;
        let mut refreshed = false;

        loop {
            let request = self.build_request(&payload).await?;
            let response = request.send().await?;
            let status = response.status();

            if status.is_success() {
                let (tx_event, rx_event) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
                let stream = response.bytes_stream().map(|r| r.map_err(TetherErr::Reqwest));
                tokio::spawn(process_sse(stream, tx_event));
                return Ok(ResponseStream { rx_event });
            }

            if status == StatusCode::UNAUTHORIZED
                && !refreshed
                && self
                    .auth
                    .get(&self.provider_id)
                    .await
                    .ok()
                    .flatten()
                    .is_some()
            {
                debug!(provider = %self.provider_id, "401 from provider, refreshing token");
                if let Err(e) = self.auth.refresh(&self.provider_id).await {
                    warn!("token refresh failed: {e:#}");
                }
                refreshed = true;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(TetherErr::UnexpectedStatus(status, body));
        }
    }

    fn build_payload(&self, messages: &[Message], tools: &[ToolInfo]) -> Result<Value> {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role.to_string(),
                    "content": m.parts,
                })
            })
            .collect();
        let tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": {
                        "type": "object",
                        "properties": t.parameters,
                        "required": t.required,
                    },
                })
            })
            .collect();

        let mut payload = json!({
            "model": self.selected.model,
            "max_tokens": self
                .selected
                .max_tokens
                .unwrap_or(self.descriptor.default_max_tokens),
            "messages": messages,
            "tools": tools,
            "stream": true,
        });
        if let Some(object) = payload.as_object_mut() {
            for (key, value) in &self.provider.extra_body {
                object.insert(key.clone(), value.clone());
            }
        }
        Ok(payload)
    }

    async fn build_request(&self, payload: &Value) -> Result<reqwest::RequestBuilder> {
        let base_url = self
            .provider
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(self.provider.r#type).to_string());

        let mut request = match self.provider.r#type {
            ProviderType::OpenAi => {
                let mut req = self.http.post(format!("{base_url}/chat/completions"));
                if let Some(key) = &self.provider.api_key {
                    req = req.bearer_auth(key);
                }
                req
            }
            ProviderType::Anthropic => {
                let mut req = self
                    .http
                    .post(format!("{base_url}/messages"))
                    .header("anthropic-version", ANTHROPIC_API_VERSION);
                if let Some(key) = &self.provider.api_key {
                    req = req.header("x-api-key", key.as_str());
                } else if let Ok(Some(token)) = self.auth.access_token(&self.provider_id).await {
                    req = req.bearer_auth(token);
                }
                req
            }
            ProviderType::Gemini => {
                let model = &self.selected.model;
                let mut url =
                    format!("{base_url}/v1beta/models/{model}:streamGenerateContent?alt=sse");
                if let Some(key) = &self.provider.api_key {
                    url.push_str(&format!("&key={key}"));
                }
                self.http.post(url)
            }
        };

        for (name, value) in &self.provider.extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = request
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(payload);
        Ok(request)
    }
}

fn default_base_url(provider_type: ProviderType) -> &'static str {
    match provider_type {
        ProviderType::OpenAi => DEFAULT_OPENAI_BASE_URL,
        ProviderType::Anthropic => DEFAULT_ANTHROPIC_BASE_URL,
        ProviderType::Gemini => DEFAULT_GEMINI_BASE_URL,
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct SseEvent {
    #[serde(rename = "type")]
    kind: String,
    delta: Option<String>,
    item: Option<Value>,
    response: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ToolCallItem {
    id: String,
    name: String,
    arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ResponseCompleted {
    usage: Option<CompletedUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletedUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

async fn process_sse<S>(stream: S, tx_event: mpsc::Sender<Result<ResponseEvent>>)
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();
    let mut completed: Option<ResponseCompleted> = None;

    loop {
        let sse = match timeout(STREAM_IDLE_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(sse))) => sse,
            Ok(Some(Err(e))) => {
                debug!("SSE error: {e:#}");
                let _ = tx_event.send(Err(TetherErr::Stream(e.to_string()))).await;
                return;
            }
            Ok(None) => {
                match completed {
                    Some(ResponseCompleted { usage }) => {
                        let usage = usage
                            .map(|u| TokenUsage {
                                prompt_tokens: u.prompt_tokens,
                                completion_tokens: u.completion_tokens,
                            })
                            .unwrap_or_default();
                        let _ = tx_event.send(Ok(ResponseEvent::Completed { usage })).await;
                    }
                    None => {
                        let _ = tx_event
                            .send(Err(TetherErr::Stream(
                                "stream closed before response.completed".into(),
                            )))
                            .await;
                    }
                }
                return;
            }
            Err(_) => {
                let _ = tx_event
                    .send(Err(TetherErr::Stream("idle timeout waiting for SSE".into())))
                    .await;
                return;
            }
        };

        trace!("SSE event: {}", sse.data);
        let event: SseEvent = match serde_json::from_str(&sse.data) {
            Ok(event) => event,
            Err(e) => {
                debug!("failed to parse SSE event: {e}, data: {}", sse.data);
                continue;
            }
        };

        match event.kind.as_str() {
            "response.output_text.delta" => {
                if let Some(delta) = event.delta
                    && tx_event
                        .send(Ok(ResponseEvent::TextDelta(delta)))
                        .await
                        .is_err()
                {
                    return;
                }
            }
            "response.tool_call" => {
                let Some(item) = event.item else { continue };
                let Ok(call) = serde_json::from_value::<ToolCallItem>(item) else {
                    debug!("failed to parse tool call from response.tool_call");
                    continue;
                };
                let input = match call.arguments {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => "{}".to_string(),
                };
                let ev = ResponseEvent::ToolCall {
                    id: call.id,
                    name: call.name,
                    input,
                };
                if tx_event.send(Ok(ev)).await.is_err() {
                    return;
                }
            }
            "response.completed" => {
                if let Some(response) = event.response {
                    match serde_json::from_value::<ResponseCompleted>(response) {
                        Ok(r) => completed = Some(r),
                        Err(e) => debug!("failed to parse response.completed: {e}"),
                    }
                }
            }
            _ => {}
        }
    }
}

#![expect(clippy::expect_used)]

use std::path::Path;

use serde_json::Value;
use serde_json::json;

use tether_core::config::Config;
use tether_core::config::ProviderConfig;
use tether_core::config::SelectedModel;
use tether_protocol::config_types::ProviderType;
use tether_protocol::config_types::SelectedModelType;

/// Builds an SSE stream body from a list of JSON events.
pub fn sse(events: Vec<Value>) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();
    for ev in events {
        let kind = ev.get("type").and_then(|v| v.as_str()).expect("event type");
        writeln!(&mut out, "event: {kind}").expect("write");
        write!(&mut out, "data: {ev}\n\n").expect("write");
    }
    out
}

/// SSE event: one streamed text delta.
pub fn ev_text_delta(delta: &str) -> Value {
    json!({"type": "response.output_text.delta", "delta": delta})
}

/// SSE event: the provider requests a tool call.
pub fn ev_tool_call(call_id: &str, name: &str, arguments: Value) -> Value {
    json!({
        "type": "response.tool_call",
        "item": {"id": call_id, "name": name, "arguments": arguments}
    })
}

/// SSE event: end of turn with usage.
pub fn ev_completed(prompt_tokens: u64, completion_tokens: u64) -> Value {
    json!({
        "type": "response.completed",
        "response": {"usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
        }}
    })
}

/// A config confined to `dir` with one enabled provider pointed at
/// `base_url` (a mock server) and a selected large model.
pub fn config_with_provider(dir: &Path, base_url: &str) -> Config {
    // Keep the global config and auth stores inside the test sandbox.
    // SAFETY: test-only; worst case a concurrent test sees another temp dir.
    unsafe {
        std::env::set_var("XDG_CONFIG_HOME", dir.join("xdg-config"));
        std::env::set_var("XDG_DATA_HOME", dir.join("xdg-data"));
    }

    let mut config = Config::for_test(dir, &dir.join("config.json"));
    config.providers.insert(
        "mock".to_string(),
        ProviderConfig {
            r#type: ProviderType::OpenAi,
            base_url: Some(base_url.to_string()),
            api_key: Some("test-key".to_string()),
            ..Default::default()
        },
    );
    config.models.insert(
        SelectedModelType::Large,
        SelectedModel {
            model: "gpt-4o".to_string(),
            provider: "mock".to_string(),
            max_tokens: None,
            reasoning_effort: None,
            think: false,
        },
    );
    config
}

#![expect(clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_partial_json;
use wiremock::matchers::method;

use tether_core::config::McpConfig;
use tether_core::mcp::McpManager;
use tether_protocol::McpState;
use tether_protocol::config_types::McpTransportType;

fn http_server_config(uri: &str) -> McpConfig {
    McpConfig {
        r#type: McpTransportType::Http,
        url: Some(uri.to_string()),
        ..Default::default()
    }
}

async fn mount_initialize(server: &MockServer) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "protocolVersion": "2025-06-18",
                "serverInfo": {"name": "fake-server", "version": "1.0.0"}
            }
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"tools": [{
                "name": "echo",
                "description": "Echo the input back",
                "inputSchema": {"type": "object"}
            }]}
        })))
        .mount(server)
        .await;
}

async fn mount_call_success(server: &MockServer) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"content": [{"type": "text", "text": "echoed"}]}
        })))
        .mount(server)
        .await;
}

/// Collect state transitions for one server until `expected` have arrived.
async fn collect_states(
    events: &mut tokio::sync::mpsc::Receiver<
        tether_core::pubsub::Event<tether_protocol::McpEvent>,
    >,
    expected: usize,
) -> Vec<McpState> {
    let mut states = Vec::new();
    while states.len() < expected {
        let event = tokio::time::timeout(Duration::from_secs(15), events.recv())
            .await
            .expect("event before deadline")
            .expect("event");
        states.push(event.payload.state);
    }
    states
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn startup_connects_and_discovers_tools() {
    let server = MockServer::start().await;
    mount_initialize(&server).await;
    mount_call_success(&server).await;

    let manager = Arc::new(McpManager::new());
    let cancel = CancellationToken::new();
    let mut events = manager.subscribe(&cancel);

    let mut servers = HashMap::new();
    servers.insert("fake".to_string(), http_server_config(&server.uri()));
    servers.insert(
        "off".to_string(),
        McpConfig {
            disabled: true,
            ..http_server_config(&server.uri())
        },
    );
    let tools = manager.initialize_clients(&servers).await;

    assert_eq!(tools["fake"].len(), 1);
    assert_eq!(tools["fake"][0].name, "echo");
    assert!(!tools.contains_key("off"));

    let info = manager.state("fake").expect("state");
    assert_eq!(info.state, McpState::Connected);
    assert_eq!(info.tool_count, 1);
    assert!(info.connected_at.is_some());
    assert_eq!(manager.state("off").expect("state").state, McpState::Disabled);

    // Drain the startup transitions: Disabled for `off`, Starting+Connected
    // for `fake`, in per-server order.
    let mut by_name: HashMap<String, Vec<McpState>> = HashMap::new();
    for _ in 0..3 {
        let event = events.recv().await.expect("event");
        by_name
            .entry(event.payload.name.clone())
            .or_default()
            .push(event.payload.state);
    }
    assert_eq!(by_name["off"], vec![McpState::Disabled]);
    assert_eq!(by_name["fake"], vec![McpState::Starting, McpState::Connected]);

    let outcome = manager.run_tool("fake", "echo", r#"{"text": "hi"}"#).await;
    assert!(!outcome.is_error);
    assert_eq!(outcome.content, "echoed");

    manager.close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_transport_error_restarts_once_and_retries() {
    let server = MockServer::start().await;
    mount_initialize(&server).await;
    // First tools/call dies with a transport-flavored error, the retry
    // succeeds.
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32000, "message": "transport error: connection reset by peer"}
        })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_call_success(&server).await;

    let manager = Arc::new(McpManager::new());
    let mut servers = HashMap::new();
    servers.insert("fake".to_string(), http_server_config(&server.uri()));
    manager.initialize_clients(&servers).await;

    let cancel = CancellationToken::new();
    let mut events = manager.subscribe(&cancel);

    let outcome = manager.run_tool("fake", "echo", "{}").await;
    assert!(!outcome.is_error, "retry should succeed: {outcome:?}");
    assert_eq!(outcome.content, "echoed");

    // Post-startup transitions: Connected -> Error -> Starting -> Connected.
    let states = collect_states(&mut events, 3).await;
    assert_eq!(
        states,
        vec![McpState::Error, McpState::Starting, McpState::Connected]
    );

    manager.close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_calls_against_errored_server_restart_single_flight() {
    let server = MockServer::start().await;
    // Nothing mounted yet: startup fails and drives the server to Error.
    let manager = Arc::new(McpManager::new());
    let mut servers = HashMap::new();
    servers.insert("fake".to_string(), http_server_config(&server.uri()));
    manager.initialize_clients(&servers).await;
    assert_eq!(manager.state("fake").expect("state").state, McpState::Error);

    // Bring the server back and race two calls at it.
    mount_initialize(&server).await;
    mount_call_success(&server).await;

    let cancel = CancellationToken::new();
    let mut events = manager.subscribe(&cancel);

    let m1 = Arc::clone(&manager);
    let m2 = Arc::clone(&manager);
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { m1.run_tool("fake", "echo", "{}").await }),
        tokio::spawn(async move { m2.run_tool("fake", "echo", "{}").await }),
    );
    let (r1, r2) = (r1.expect("join"), r2.expect("join"));
    assert!(!r1.is_error, "first call failed: {r1:?}");
    assert!(!r2.is_error, "second call failed: {r2:?}");

    // Exactly one restart is observable: one Starting, one Connected.
    let states = collect_states(&mut events, 2).await;
    assert_eq!(states, vec![McpState::Starting, McpState::Connected]);
    assert!(
        tokio::time::timeout(Duration::from_millis(300), events.recv())
            .await
            .is_err(),
        "no further state transitions expected"
    );

    manager.close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn startup_failure_isolates_the_failing_server() {
    let healthy = MockServer::start().await;
    mount_initialize(&healthy).await;

    let manager = Arc::new(McpManager::new());
    let mut servers = HashMap::new();
    servers.insert("good".to_string(), http_server_config(&healthy.uri()));
    servers.insert(
        "bad".to_string(),
        http_server_config("http://127.0.0.1:1/nothing-here"),
    );
    let tools = manager.initialize_clients(&servers).await;

    assert_eq!(manager.state("good").expect("state").state, McpState::Connected);
    assert_eq!(manager.state("bad").expect("state").state, McpState::Error);
    assert!(manager.state("bad").expect("state").error.is_some());
    assert!(tools.contains_key("good"));
    assert!(!tools.contains_key("bad"));

    manager.close_all().await;
}

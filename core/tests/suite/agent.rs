#![expect(clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

use crate::suite::common::config_with_provider;
use crate::suite::common::ev_completed;
use crate::suite::common::ev_text_delta;
use crate::suite::common::ev_tool_call;
use crate::suite::common::sse;
use tether_core::App;
use tether_core::TetherErr;
use tether_core::agent::ModelClient;
use tether_core::agent::ResponseEvent;
use tether_core::auth::OauthInfo;
use tether_core::auth::TokenBroker;
use tether_protocol::ContentPart;
use tether_protocol::config_types::SelectedModelType;

fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_interactive_run_completes_with_assistant_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse(vec![
            ev_text_delta("Say "),
            ev_text_delta("ok"),
            ev_completed(12, 2),
        ])))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_with_provider(dir.path(), &server.uri());
    let app = App::new(config).await.expect("app");

    app.run_non_interactive("Say ok", true).await.expect("run");

    let sessions = app.sessions.list().await;
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert!(session.title.starts_with("Non-interactive: "));
    assert_eq!(session.prompt_tokens, 12);
    assert_eq!(session.completion_tokens, 2);

    let messages = app.messages.list(&session.id).await;
    let assistant = messages
        .iter()
        .find(|m| m.role == tether_protocol::Role::Assistant)
        .expect("assistant message");
    assert_eq!(assistant.content(), "Say ok");

    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denied_tool_call_becomes_error_part_and_run_continues() {
    let server = MockServer::start().await;
    // First provider turn asks for a shell execution; the second completes
    // after seeing the denial result.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse(vec![
            ev_tool_call("call-1", "shell", serde_json::json!({"command": "rm -rf /"})),
            ev_completed(5, 1),
        ])))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse(vec![
            ev_text_delta("understood"),
            ev_completed(6, 1),
        ])))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_with_provider(dir.path(), &server.uri());
    let app = App::new(config).await.expect("app");
    let agent = app.coder_agent.as_ref().expect("agent").clone();

    let session = app.sessions.create("deny-test").await;

    // Deny the permission request from the topic side, as the UI would.
    let cancel = CancellationToken::new();
    let mut requests = app.permissions.subscribe(&cancel);
    let permissions = app.permissions.clone();
    let denier = tokio::spawn(async move {
        let event = tokio::time::timeout(Duration::from_secs(10), requests.recv())
            .await
            .expect("request before deadline")
            .expect("request event");
        assert_eq!(event.payload.tool_name, "shell");
        permissions.deny(&event.payload).await;
    });

    let mut done = agent.run(&session.id, "please run it").await.expect("run");
    let result = tokio::time::timeout(Duration::from_secs(30), done.recv())
        .await
        .expect("result before deadline")
        .expect("one result")
        .expect("successful run");
    denier.await.expect("denier");

    // The run continued to a completed assistant message.
    assert_eq!(result.content(), "understood");

    // And the denial surfaced as an error result part.
    let messages = app.messages.list(&session.id).await;
    let denial = messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .find_map(|part| match part {
            ContentPart::ToolResult {
                tool_call_id,
                content,
                is_error,
                ..
            } if tool_call_id == "call-1" => Some((content.clone(), *is_error)),
            _ => None,
        })
        .expect("denial result part");
    assert!(denial.1);
    assert_eq!(denial.0, "permission denied");

    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crossing_context_threshold_compacts_history_into_summary() {
    let server = MockServer::start().await;
    // First turn pushes the session to the context threshold; the follow-up
    // summarize request condenses the conversation.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse(vec![
            ev_text_delta("hello"),
            ev_completed(96, 4),
        ])))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse(vec![
            ev_text_delta("conversation summary"),
            ev_completed(5, 1),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config_with_provider(dir.path(), &server.uri());
    let mock = config.providers.get_mut("mock").expect("provider");
    mock.models = vec![tether_core::config::ModelDescriptor {
        id: "gpt-4o".to_string(),
        name: None,
        context_window: 100,
        default_max_tokens: 50,
    }];
    let app = App::new(config).await.expect("app");
    let agent = app.coder_agent.as_ref().expect("agent").clone();

    let session = app.sessions.create("summarize-test").await;
    let mut done = agent.run(&session.id, "long conversation").await.expect("run");
    let result = tokio::time::timeout(Duration::from_secs(30), done.recv())
        .await
        .expect("result before deadline")
        .expect("one result")
        .expect("successful run");
    // The request's own result is untouched by compaction.
    assert_eq!(result.content(), "hello");

    // The stored history is now the single condensed turn.
    let messages = app.messages.list(&session.id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, tether_protocol::Role::Assistant);
    assert_eq!(messages[0].content(), "conversation summary");

    let stored = app.sessions.get(&session.id).await.expect("session");
    assert_eq!(stored.prompt_tokens, 96 + 5);
    assert_eq!(stored.completion_tokens, 4 + 1);

    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disable_auto_summarize_leaves_history_untouched() {
    let server = MockServer::start().await;
    // expect(1): with the gate set, no summarize request follows the turn.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse(vec![
            ev_text_delta("hello"),
            ev_completed(96, 4),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config_with_provider(dir.path(), &server.uri());
    config.options.disable_auto_summarize = true;
    let mock = config.providers.get_mut("mock").expect("provider");
    mock.models = vec![tether_core::config::ModelDescriptor {
        id: "gpt-4o".to_string(),
        name: None,
        context_window: 100,
        default_max_tokens: 50,
    }];
    let app = App::new(config).await.expect("app");
    let agent = app.coder_agent.as_ref().expect("agent").clone();

    let session = app.sessions.create("no-summarize-test").await;
    let mut done = agent.run(&session.id, "long conversation").await.expect("run");
    tokio::time::timeout(Duration::from_secs(30), done.recv())
        .await
        .expect("result before deadline")
        .expect("one result")
        .expect("successful run");

    let messages = app.messages.list(&session.id).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content(), "hello");

    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_timeout_cancels_with_sentinel() {
    let server = MockServer::start().await;
    // The provider never answers within the request budget.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            sse_response(sse(vec![ev_completed(1, 1)])).set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config_with_provider(dir.path(), &server.uri());
    config.options.request_timeout_seconds = 1;
    let app = App::new(config).await.expect("app");
    let agent = app.coder_agent.as_ref().expect("agent").clone();

    let session = app.sessions.create("timeout-test").await;
    let mut done = agent.run(&session.id, "hang forever").await.expect("run");
    let result = tokio::time::timeout(Duration::from_secs(10), done.recv())
        .await
        .expect("result before deadline")
        .expect("one result");
    assert!(matches!(result, Err(TetherErr::RequestCancelled)));

    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_all_unwinds_inflight_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            sse_response(sse(vec![ev_completed(1, 1)])).set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_with_provider(dir.path(), &server.uri());
    let app = App::new(config).await.expect("app");
    let agent = app.coder_agent.as_ref().expect("agent").clone();

    let session = app.sessions.create("cancel-test").await;
    let mut done = agent.run(&session.id, "slow").await.expect("run");
    assert!(agent.is_busy());

    agent.cancel_all();
    let result = tokio::time::timeout(Duration::from_secs(5), done.recv())
        .await
        .expect("result before deadline")
        .expect("one result");
    assert!(matches!(result, Err(TetherErr::RequestCancelled)));
    assert!(!agent.is_busy());

    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthorized_response_refreshes_token_and_retries_once() {
    let provider = MockServer::start().await;
    let token_endpoint = MockServer::start().await;

    // First provider attempt: 401. Second (after refresh): streams fine.
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(sse_response(sse(vec![
            ev_text_delta("hello"),
            ev_completed(1, 1),
        ])))
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "refresh_token": "R2",
            "access_token": "A2",
            "expires_in": 3600,
        })))
        .expect(1)
        .mount(&token_endpoint)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config_with_provider(dir.path(), &provider.uri());
    // Re-point the provider at Anthropic header shapes with no API key so
    // the client leans on the OAuth broker.
    let mock = config.providers.get_mut("mock").expect("provider");
    mock.r#type = tether_protocol::config_types::ProviderType::Anthropic;
    mock.api_key = None;

    let broker = Arc::new(
        TokenBroker::with_store_path(dir.path().join("auth.json"))
            .with_token_url(token_endpoint.uri()),
    );
    broker
        .set(
            "mock",
            OauthInfo {
                token_type: "oauth".to_string(),
                refresh: "R1".to_string(),
                access: "A1".to_string(),
                expires: tether_core::util::now_ms() + 60_000,
            },
        )
        .await
        .expect("seed token");

    let client =
        ModelClient::from_config(&config, SelectedModelType::Large, broker.clone()).expect("client");
    let mut stream = client.stream(&[], &[]).await.expect("stream");

    let mut text = String::new();
    while let Some(event) = stream.recv().await {
        match event.expect("event") {
            ResponseEvent::TextDelta(delta) => text.push_str(&delta),
            ResponseEvent::Completed { .. } => break,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(text, "hello");

    // The refreshed token was persisted.
    let stored = broker.get("mock").await.expect("get").expect("record");
    assert_eq!(stored.access, "A2");
}

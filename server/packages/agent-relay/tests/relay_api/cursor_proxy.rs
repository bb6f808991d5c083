#![cfg(unix)]

use super::*;

const FAKE_CURSOR_AGENT: &str = r#"#!/bin/sh
case "$1" in
  status) echo "Logged in as dev@example.com"; exit 0 ;;
  create-chat) echo "Creating chat..."; echo "chat-123"; exit 0 ;;
esac
trust=0
for arg in "$@"; do
  if [ "$arg" = "--trust" ]; then trust=1; fi
done
if [ "$trust" = "0" ] && [ -f "$PWD/.needs-trust" ]; then
  echo "Workspace Trust Required: rerun with --trust to continue"
  exec sleep 30
fi
echo '{"type":"system","subtype":"init","model":"gpt-5","session_id":"chat-123"}'
echo '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Hel"}]},"timestamp_ms":1}'
echo '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"lo"}]},"timestamp_ms":2}'
echo '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Hello"}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"result":"Hello"}'
"#;

async fn cursor_session(test_app: &TestApp, project: &Path) -> String {
    fs::write(
        test_app.root().join("cli-config.json"),
        r#"{"model":{"modelId":"sonnet-4"}}"#,
    )
    .expect("write cli config");
    test_app.install_agent("cursor", FAKE_CURSOR_AGENT).await;

    let (status, session) = test_app.create_session("cursor", project).await;
    assert_eq!(status, StatusCode::CREATED, "{session}");
    assert_eq!(session["status"], "running");
    assert_eq!(session["chat_id"], "chat-123");
    assert!(session["port"].is_null());
    session["id"].as_str().expect("session id").to_string()
}

#[tokio::test]
async fn in_process_prompt_and_transcript() {
    let test_app = TestApp::new();
    let project = test_app.project_dir("proj");
    let session_id = cursor_session(&test_app, &project).await;
    let proxy = format!("/v1/sessions/{session_id}/proxy");

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        &format!("{proxy}/prompt"),
        Some(json!({"text": "   "})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse_json(&body)["type"], "urn:agent-relay:error:invalid_argument");

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        &format!("{proxy}/prompt"),
        Some(json!({"text": "say hello"})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body), json!({"stopReason": "end_turn", "text": "Hello"}));

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, &format!("{proxy}/message"), None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    let transcript = parse_json(&body);
    let roles: Vec<&str> = transcript
        .as_array()
        .expect("transcript")
        .iter()
        .filter_map(|message| message["role"].as_str())
        .collect();
    assert_eq!(roles, vec!["user", "agent"]);
    assert_eq!(transcript[1]["parts"][0]["content"], "Hello");

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, &format!("{proxy}/session"), None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    let info = parse_json(&body);
    assert_eq!(info["chatId"], "chat-123");
    assert_eq!(info["model"], "gpt-5");

    let (status, _, _) =
        send_request(&test_app.app, Method::POST, &format!("{proxy}/cancel"), None, &[]).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, &format!("{proxy}/config"), None, &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(parse_json(&body)["error"].as_str().is_some());

    assert!(test_app
        .manager()
        .find_adapter_by_chat("chat-123")
        .await
        .is_some());
}

#[tokio::test]
async fn event_stream_drains_until_session_stops() {
    let test_app = TestApp::new();
    let project = test_app.project_dir("proj");
    let session_id = cursor_session(&test_app, &project).await;
    let proxy = format!("/v1/sessions/{session_id}/proxy");

    let (status, _, _) = send_request(
        &test_app.app,
        Method::POST,
        &format!("{proxy}/prompt"),
        Some(json!({"text": "say hello"})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("{proxy}/event"))
        .body(Body::empty())
        .expect("build request");
    let response = test_app
        .app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    assert_eq!(response.status(), StatusCode::OK);

    let (status, _, body) = send_request(
        &test_app.app,
        Method::DELETE,
        &format!("/v1/sessions?id={session_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["stopped"], true);

    let body = tokio::time::timeout(Duration::from_secs(10), response.into_body().collect())
        .await
        .expect("stream ends once the session stops")
        .expect("collect body")
        .to_bytes();
    let kinds: Vec<String> = sse_payloads(&body)
        .iter()
        .filter_map(|update| update["type"].as_str().map(str::to_string))
        .collect();
    assert_eq!(
        kinds,
        vec![
            "session_info",
            "session_info",
            "agent_message_chunk",
            "agent_message_chunk",
            "done"
        ]
    );
    assert!(test_app.manager().find_adapter_by_chat("chat-123").await.is_none());
}

#[tokio::test]
async fn trust_response_retries_parked_prompt() {
    let test_app = TestApp::new();
    let project = test_app.project_dir("proj");
    fs::write(project.join(".needs-trust"), "").expect("write marker");
    let session_id = cursor_session(&test_app, &project).await;

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/proxy/prompt"),
        Some(json!({"text": "edit files"})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:agent-relay:error:trust_prompt_pending"
    );

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/agents/cursor/session/trust-response",
        Some(json!({"sessionId": "chat-123", "trust": true})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body), json!({"retried": true}));

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/agents/cursor/session/settings?sessionId=chat-123",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["workspaceTrusted"], true);

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/agents/opencode/session/trust-response",
        Some(json!({"sessionId": "whatever", "trust": true})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse_json(&body)["type"], "urn:agent-relay:error:invalid_argument");
}

#[tokio::test]
async fn trust_response_without_live_session_is_recorded() {
    let test_app = TestApp::new();

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/agents/cursor/session/trust-response",
        Some(json!({"sessionId": "chat-offline", "trust": false})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["retried"], false);

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/agents/cursor/session/settings?sessionId=chat-offline",
        None,
        &[],
    )
    .await;
    assert_eq!(parse_json(&body)["workspaceTrusted"], false);
}

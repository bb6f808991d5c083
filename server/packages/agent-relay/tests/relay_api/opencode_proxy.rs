#![cfg(unix)]

use std::sync::Mutex;

use axum::extract::State;
use axum::http::Uri;
use axum::routing::get;
use axum::Json;

use super::*;

/// Records the port it was asked to serve on, then idles like a server
/// would. The test binds the HTTP side itself on that port.
const FAKE_OPENCODE: &str = "#!/bin/sh\necho \"$3\" > \"$PWD/port\"\nexec sleep 60\n";

const NATIVE_EVENTS: &str = concat!(
    "data: {\"type\":\"server.connected\",\"properties\":{}}\n\n",
    "data: {\"type\":\"message.updated\",\"properties\":{\"info\":{\"id\":\"a1\",\"role\":\"assistant\",\"sessionID\":\"ses_native\",\"providerID\":\"anthropic\",\"modelID\":\"claude-sonnet-4\"}}}\n\n",
    "data: {\"type\":\"message.part.updated\",\"properties\":{\"part\":{\"id\":\"t1\",\"messageID\":\"a1\",\"type\":\"text\",\"text\":\"Hi\"}}}\n\n",
    // The final frame is left unterminated, as when the server closes mid-frame.
    "data: {\"type\":\"session.idle\",\"properties\":{\"sessionID\":\"ses_native\"}}\n",
);

#[derive(Clone, Default)]
struct FakeOpencode {
    patches: Arc<Mutex<Vec<Value>>>,
}

impl FakeOpencode {
    fn patches(&self) -> Vec<Value> {
        self.patches.lock().expect("patches lock").clone()
    }
}

async fn record_patch(State(fake): State<FakeOpencode>, Json(body): Json<Value>) -> Json<Value> {
    fake.patches.lock().expect("patches lock").push(body.clone());
    Json(body)
}

async fn native_messages() -> Json<Value> {
    Json(json!([
        {
            "info": {"id": "u1", "role": "user", "time": {"created": 10}},
            "parts": [{"id": "p1", "type": "text", "text": "hello"}]
        },
        {
            "info": {"id": "a1", "role": "assistant", "providerID": "anthropic", "modelID": "claude-sonnet-4", "time": {"created": 20}},
            "parts": [
                {"id": "p2", "type": "tool", "callID": "c1", "tool": "read", "state": {"status": "completed", "input": {"path": "a.rs"}, "output": "fn main() {}"}},
                {"id": "p3", "type": "text", "text": "Hi"}
            ]
        }
    ]))
}

async fn echo_request(uri: Uri, headers: HeaderMap) -> Json<Value> {
    Json(json!({
        "query": uri.query(),
        "tag": headers.get("x-trace-tag").and_then(|value| value.to_str().ok()),
        "host": headers.get("host").and_then(|value| value.to_str().ok()),
    }))
}

async fn serve_fake_opencode(project: &Path) -> FakeOpencode {
    let port_file = project.join("port");
    let port: u16 = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(port) = fs::read_to_string(&port_file)
                .ok()
                .and_then(|text| text.trim().parse().ok())
            {
                return port;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("fake opencode never reported its port");

    let fake = FakeOpencode::default();
    let app = Router::new()
        .route("/global/health", get(|| async { Json(json!({"healthy": true})) }))
        .route(
            "/config",
            get(|| async { Json(json!({"theme": "dark"})) }).patch(record_patch),
        )
        .route(
            "/config/providers",
            get(|| async {
                Json(json!({"providers": [], "default": {"openai": "gpt-5", "anthropic": "claude-sonnet-4"}}))
            }),
        )
        .route("/session/:id/message", get(native_messages))
        .route(
            "/event",
            get(|| async { ([(header::CONTENT_TYPE, "text/event-stream")], NATIVE_EVENTS) }),
        )
        .route("/file", get(echo_request))
        .with_state(fake.clone());
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("bind fake opencode");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    fake
}

async fn wait_for_patch(fake: &FakeOpencode, expected: &Value) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !fake.patches().contains(expected) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("fake opencode never received {expected}"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_session_lifecycle_through_proxy() {
    let test_app = TestApp::new();
    test_app.install_agent("opencode", FAKE_OPENCODE).await;
    let project = test_app.project_dir("proj");

    let (status, session) = test_app.create_session("opencode", &project).await;
    assert_eq!(status, StatusCode::CREATED, "{session}");
    assert_eq!(session["status"], "starting");
    assert_eq!(session["agent_id"], "opencode");
    let session_id = session["id"].as_str().expect("session id").to_string();
    let proxy = format!("/v1/sessions/{session_id}/proxy");

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, &format!("{proxy}/config"), None, &[]).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(parse_json(&body)["error"], "session is still starting");

    let fake = serve_fake_opencode(&project).await;
    let running = test_app.wait_for_status(&session_id, "running").await;
    assert_eq!(running["port"], session["port"]);

    // Nothing configured upstream, so the provider default is applied once.
    wait_for_patch(&fake, &json!({"model": "anthropic/claude-sonnet-4"})).await;

    let (status, _, body) = send_request(
        &test_app.app,
        Method::PATCH,
        &format!("{proxy}/config"),
        Some(json!({"model": {"modelID": "x"}})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body), json!({"model": "x"}));
    assert_eq!(fake.patches().last(), Some(&json!({"model": "x"})));

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/agents/opencode/settings",
        None,
        &[],
    )
    .await;
    assert_eq!(parse_json(&body)["preferredModel"], "x");

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("{proxy}/session/ses_native/message"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let messages = parse_json(&body);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "agent");
    assert_eq!(messages[1]["model"], "anthropic/claude-sonnet-4");
    let part_types: Vec<&str> = messages[1]["parts"]
        .as_array()
        .expect("parts")
        .iter()
        .filter_map(|part| part["type"].as_str())
        .collect();
    assert_eq!(part_types, vec!["tool_call", "tool_result", "text"]);
    assert_eq!(messages[1]["parts"][1]["id"], "p2:result");

    let (status, headers, body) =
        send_request(&test_app.app, Method::GET, &format!("{proxy}/event"), None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .expect("content type")
        .starts_with("text/event-stream"));
    let updates = sse_payloads(&body);
    assert_eq!(
        updates,
        vec![
            json!({"type": "session_info", "session_id": "ses_native", "model": "anthropic/claude-sonnet-4"}),
            json!({"type": "agent_message_chunk", "text": "Hi"}),
            json!({"type": "done", "stop_reason": "end_turn", "text": "Hi"}),
        ]
    );

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("{proxy}/file?path=src/a.rs"),
        None,
        &[("x-trace-tag", "forwarded")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let echoed = parse_json(&body);
    assert_eq!(echoed["query"], "path=src/a.rs");
    assert_eq!(echoed["tag"], "forwarded");

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

    let (status, _, _) =
        send_request(&test_app.app, Method::GET, &format!("{proxy}/config"), None, &[]).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(test_app.manager().get(&session_id).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashed_server_is_reported_as_error() {
    let test_app = TestApp::new();
    test_app
        .install_agent("opencode", "#!/bin/sh\necho boom >&2\nexit 5\n")
        .await;
    let project = test_app.project_dir("proj");

    let (status, session) = test_app.create_session("opencode", &project).await;
    assert_eq!(status, StatusCode::CREATED);
    let session_id = session["id"].as_str().expect("session id").to_string();

    let failed = test_app.wait_for_status(&session_id, "error").await;
    let error = failed["error"].as_str().expect("error message").to_string();
    assert!(error.contains("exited"), "{error}");

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/sessions/{session_id}/proxy/config"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(parse_json(&body)["error"], error.as_str());

    let logs = test_app
        .root()
        .join("data/opencode/logs")
        .join(format!("{session_id}.log"));
    assert_eq!(fs::read_to_string(logs).expect("server log").trim(), "boom");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unhealthy_server_times_out() {
    let test_app = TestApp::with_config(|config| {
        config.health_timeout = Duration::from_millis(300);
    });
    test_app
        .install_agent("opencode", "#!/bin/sh\nexec sleep 60\n")
        .await;
    let project = test_app.project_dir("proj");

    let (_, session) = test_app.create_session("opencode", &project).await;
    let session_id = session["id"].as_str().expect("session id").to_string();

    let failed = test_app.wait_for_status(&session_id, "error").await;
    assert!(failed["error"]
        .as_str()
        .expect("error message")
        .contains("did not become healthy"));

    let (page_status, _, body) =
        send_request(&test_app.app, Method::GET, "/v1/sessions", None, &[]).await;
    assert_eq!(page_status, StatusCode::OK);
    assert_eq!(parse_json(&body)["total"], 1);

    test_app.manager().stop(&session_id).await;
    let failed_again = test_app.manager().get(&session_id).await;
    assert!(failed_again.is_none());
}

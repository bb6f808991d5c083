use super::*;

#[tokio::test]
async fn health_and_agent_registry() {
    let test_app = TestApp::new();

    let (status, _, body) = send_request(&test_app.app, Method::GET, "/v1/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["status"], "ok");

    let binary = test_app.install_agent("cursor", "#!/bin/sh\nexit 0\n").await;
    let (status, _, body) = send_request(&test_app.app, Method::GET, "/v1/agents", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    let agents = parse_json(&body)["agents"].as_array().cloned().expect("agents");
    let ids: Vec<&str> = agents
        .iter()
        .filter_map(|agent| agent["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["opencode", "cursor", "gemini"]);

    let cursor = &agents[1];
    assert_eq!(cursor["adapterKind"], "in_process");
    assert_eq!(cursor["headless"], true);
    assert_eq!(cursor["binaryPath"], binary.to_string_lossy().as_ref());
    assert_eq!(agents[2]["headless"], false);

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, "/v1/openapi.json", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(parse_json(&body)["paths"]["/v1/sessions"].is_object());
}

#[tokio::test]
async fn launch_rejects_bad_requests_with_problem_details() {
    let test_app = TestApp::new();
    let project = test_app.project_dir("proj");

    let (status, body) = test_app
        .create_session("opencode", &test_app.root().join("missing"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "urn:agent-relay:error:invalid_argument");
    assert!(body["error"].as_str().is_some());

    let (status, body) = test_app.create_session("emacs", &project).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "urn:agent-relay:error:unknown_agent");
    assert_eq!(body["agent"], "emacs");

    let (status, body) = test_app.create_session("gemini", &project).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "urn:agent-relay:error:not_headless_capable");

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({"agent_id": "", "project_dir": project.to_string_lossy()})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse_json(&body)["status"], 400);

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, "/v1/sessions", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    let page = parse_json(&body);
    assert_eq!(page["total"], 0);
    assert_eq!(page["total_pages"], 0);
    assert_eq!(page["sessions"], json!([]));
}

#[tokio::test]
async fn missing_binary_is_not_installed() {
    let test_app = TestApp::new();
    let project = test_app.project_dir("proj");
    let (status, _, _) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/agents/opencode/settings",
        Some(json!({"binaryPath": test_app.root().join("nowhere/opencode-not-here").to_string_lossy()})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Only meaningful where no real opencode is on PATH.
    if agent_relay_agent_management::resolve_binary(
        agent_relay_agent_management::AgentId::Opencode,
        None,
    )
    .is_ok()
    {
        return;
    }
    let (status, body) = test_app.create_session("opencode", &project).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "urn:agent-relay:error:not_installed");
}

#[tokio::test]
async fn stop_is_idempotent_and_unknown_ids_are_fine() {
    let test_app = TestApp::new();

    for _ in 0..2 {
        let (status, _, body) = send_request(
            &test_app.app,
            Method::DELETE,
            "/v1/sessions?id=ses_missing",
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parse_json(&body), json!({"id": "ses_missing", "stopped": false}));
    }

    let (status, _, _) =
        send_request(&test_app.app, Method::DELETE, "/v1/sessions", None, &[]).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/sessions/ses_missing",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(parse_json(&body)["sessionId"], "ses_missing");

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/sessions/ses_missing/proxy/config",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(parse_json(&body)["error"].as_str().is_some());
}

#[tokio::test]
async fn agent_settings_update_and_clear() {
    let test_app = TestApp::new();

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/agents/cursor/settings",
        Some(json!({"apiKey": "sk-test", "preferredModel": "sonnet-4"})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let settings = parse_json(&body);
    assert_eq!(settings["hasApiKey"], true);
    assert_eq!(settings["preferredModel"], "sonnet-4");
    assert!(settings.get("apiKey").is_none());

    let (_, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/agents/cursor/settings",
        Some(json!({"apiKey": ""})),
        &[],
    )
    .await;
    let settings = parse_json(&body);
    assert_eq!(settings["hasApiKey"], false);
    assert_eq!(settings["preferredModel"], "sonnet-4");

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/agents/zed/settings",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse_json(&body)["type"], "urn:agent-relay:error:unknown_agent");

    let (status, _, body) = send_request(
        &test_app.app,
        Method::PUT,
        "/v1/agents/cursor/session/settings?sessionId=chat-9",
        Some(json!({"yolo": true})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["yolo"], true);

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/agents/cursor/session/settings?sessionId=chat-9",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entry = parse_json(&body);
    assert_eq!(entry["sessionId"], "chat-9");
    assert_eq!(entry["yolo"], true);

    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/agents/cursor/session/settings?sessionId=..",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{app_state, settings, standard_providers, EchoLlm, FakeProviders, TestServer};
use serde_json::{json, Value};
use std::time::Duration;
use tower::util::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method("POST")
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_chat_round_trip_and_history() {
    let providers = FakeProviders::default();
    let state = app_state(settings(standard_providers(), json!({})), &providers, EchoLlm::new(Duration::ZERO)).await;
    let app = concierge::create_app(&state);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/chat",
            json!({"session_id": "web-1", "message": "show projects from source control"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["session_id"], "web-1");
    assert_eq!(body["reply"], "echo: show projects from source control");
    assert_eq!(body["degraded"], false);
    assert_eq!(body["context_used"]["sources"][0]["provider_id"], "gitlab");

    let response = app.clone().oneshot(get("/api/chat/web-1/history")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    assert_eq!(body["messages"][0]["role"], "user");

    let response = app.oneshot(get("/api/chat/sessions")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["sessions"][0]["session_id"], "web-1");
}

#[tokio::test]
async fn test_chat_errors_map_to_status_codes() {
    let providers = FakeProviders::default();
    let state = app_state(settings(json!({}), json!({})), &providers, EchoLlm::new(Duration::ZERO)).await;
    let app = concierge::create_app(&state);

    let response = app
        .clone()
        .oneshot(post_json("/api/chat", json!({"message": "  "})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"].is_string());

    let response = app.oneshot(get("/api/chat/nobody/history")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_config_view_hides_credentials() {
    let providers = FakeProviders::default();
    let state = app_state(settings(standard_providers(), json!({})), &providers, EchoLlm::new(Duration::ZERO)).await;
    let app = concierge::create_app(&state);

    let response = app.oneshot(get("/api/config")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    for secret in [
        "sk-live-do-not-leak",
        "glpat-very-secret",
        "jira-token-secret",
        "ldap-pass-secret",
    ] {
        assert!(!text.contains(secret), "{} leaked", secret);
    }
    let view: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(view["mcp_servers"]["jira"]["credentials"]["username"], "[redacted]");
    assert_eq!(view["llm"]["model"], "llama3");
}

#[tokio::test]
async fn test_provider_status_and_tools() {
    let providers = FakeProviders::default();
    providers.set_down("ldap");
    let state = app_state(settings(standard_providers(), json!({})), &providers, EchoLlm::new(Duration::ZERO)).await;
    let app = concierge::create_app(&state);

    let response = app.clone().oneshot(get("/api/mcp/status")).await.unwrap();
    let body = body_json(response).await;
    let statuses: Vec<(String, String)> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|s| {
            (
                s["provider_id"].as_str().unwrap().to_string(),
                s["status"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert!(statuses.contains(&("gitlab".to_string(), "healthy".to_string())));
    assert!(statuses.contains(&("ldap".to_string(), "unreachable".to_string())));

    let response = app.clone().oneshot(get("/api/mcp/tools/jira")).await.unwrap();
    let body = body_json(response).await;
    let names: Vec<&str> = body["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"get_issue"));

    let response = app.clone().oneshot(get("/api/mcp/tools/unknown")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(post_json("/api/mcp/status/ldap/probe", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "unreachable");
}

#[tokio::test]
async fn test_manual_probe_updates_health_gauge() {
    let providers = FakeProviders::default();
    let state = app_state(settings(standard_providers(), json!({})), &providers, EchoLlm::new(Duration::ZERO)).await;
    let app = concierge::create_app(&state);

    providers.set_down("ldap");
    let response = app
        .clone()
        .oneshot(post_json("/api/mcp/status/ldap/probe", json!({})))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["status"], "unreachable");

    let response = app.oneshot(get("/metrics")).await.unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains(r#"concierge_provider_healthy{provider="ldap"} 0"#));
}

#[tokio::test]
async fn test_server_info_endpoint() {
    let providers = FakeProviders::default();
    providers.set_down("ldap");
    let state = app_state(settings(standard_providers(), json!({})), &providers, EchoLlm::new(Duration::ZERO)).await;
    let app = concierge::create_app(&state);

    let response = app.clone().oneshot(get("/api/mcp/info/jira")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["provider"], "jira");
    assert_eq!(body["info"]["protocolVersion"], "2025-03-26");
    assert_eq!(body["info"]["serverInfo"]["name"], "fake-jira");

    let response = app.clone().oneshot(get("/api/mcp/info/ldap")).await.unwrap();
    assert!(body_json(response).await["info"].is_null());

    let response = app.oneshot(get("/api/mcp/info/unknown")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_direct_tool_call() {
    let providers = FakeProviders::default();
    let state = app_state(settings(standard_providers(), json!({})), &providers, EchoLlm::new(Duration::ZERO)).await;
    let app = concierge::create_app(&state);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/mcp/call",
            json!({"server": "jira", "tool": "get_issue", "arguments": {"issue_key": "ONEC-8927"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["payload"]["arguments"]["issue_key"], "ONEC-8927");
    assert_eq!(providers.calls(), vec!["jira.get_issue".to_string()]);

    let response = app
        .oneshot(post_json(
            "/api/mcp/call",
            json!({"provider": "jira", "tool": "drop_database"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_and_metrics_endpoints() {
    let providers = FakeProviders::default();
    let state = app_state(settings(standard_providers(), json!({})), &providers, EchoLlm::new(Duration::ZERO)).await;
    let app = concierge::create_app(&state);

    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");

    let response = app.clone().oneshot(get("/health/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    app.clone()
        .oneshot(post_json("/api/chat", json!({"message": "hi"})))
        .await
        .unwrap();
    let response = app.oneshot(get("/metrics")).await.unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("concierge_turns_total"));
}

#[tokio::test]
async fn test_stream_endpoint_sends_frames() {
    let providers = FakeProviders::default();
    let state = app_state(settings(standard_providers(), json!({})), &providers, EchoLlm::new(Duration::ZERO)).await;
    let server = TestServer::new(&state).await;

    let response = reqwest::Client::new()
        .post(server.url("/api/chat/stream"))
        .json(&json!({"message": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let session_id = response
        .headers()
        .get("x-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let text = response.text().await.unwrap();
    let frames: Vec<Value> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(|d| serde_json::from_str(d.trim()).unwrap())
        .collect();
    assert_eq!(frames.first().unwrap()["type"], "context");
    assert_eq!(frames.last().unwrap()["type"], "done");
    let reply: String = frames
        .iter()
        .filter(|f| f["type"] == "token")
        .map(|f| f["content"].as_str().unwrap())
        .collect();
    assert_eq!(reply, "echo: hello");

    let history = state.pipeline.sessions().history(&session_id).await.unwrap();
    assert_eq!(history.len(), 2);
}

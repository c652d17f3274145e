use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use concierge::domain::{
    CapabilityClient, CapabilityError, Credentials, ProviderConfig, ProviderKind,
};
use concierge::mcp::create_client;
use concierge::mcp::transport::{Auth, McpTransport, SESSION_HEADER, TOOL_ERROR_CODE};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const TOKEN: &str = "tracker-token";

/// Minimal streamable-HTTP MCP server with a few scripted tools
async fn handle_rpc(headers: HeaderMap, Json(request): Json<Value>) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", TOKEN))
        .unwrap_or(false);
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let method = request["method"].as_str().unwrap_or_default().to_string();
    let Some(id) = request.get("id").cloned() else {
        // Notifications get no body
        return StatusCode::ACCEPTED.into_response();
    };

    if method != "initialize" && headers.get(SESSION_HEADER).is_none() {
        return (StatusCode::BAD_REQUEST, "missing session").into_response();
    }

    match method.as_str() {
        "initialize" => (
            [(SESSION_HEADER, "session-1")],
            Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"protocolVersion": "2025-03-26", "serverInfo": {"name": "fake"}}
            })),
        )
            .into_response(),
        // Answered as an event stream with a notification first
        "tools/list" => {
            let body = format!(
                "event: message\ndata: {}\n\nevent: message\ndata: {}\n\n",
                json!({"jsonrpc": "2.0", "method": "notifications/progress"}),
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"tools": [
                        {"name": "get_issue", "inputSchema": {"type": "object", "properties": {"issue_key": {"type": "string"}}}},
                        {"name": "search_issues"}
                    ]}
                })
            );
            ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
        }
        "tools/call" => {
            let name = request["params"]["name"].as_str().unwrap_or_default();
            let response = match name {
                "get_issue" => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"content": [{
                        "type": "text",
                        "text": json!({"key": request["params"]["arguments"]["issue_key"], "status": "Open"}).to_string()
                    }]}
                }),
                "broken" => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"content": [{"type": "text", "text": "boom"}], "isError": true}
                }),
                _ => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": "unknown tool"}
                }),
            };
            Json(response).into_response()
        }
        "ping" => Json(json!({"jsonrpc": "2.0", "id": id, "result": {}})).into_response(),
        _ => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": "method not found"}
        }))
        .into_response(),
    }
}

async fn spawn_server() -> String {
    let app = Router::new().route("/mcp", post(handle_rpc));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/mcp", addr)
}

fn transport(endpoint: &str, token: &str) -> McpTransport {
    McpTransport::new(
        "jira",
        endpoint,
        Auth::Bearer(SecretString::from(token.to_string())),
        Duration::from_secs(5),
    )
}

#[tokio::test]
async fn test_connect_and_list_tools_from_event_stream() {
    let endpoint = spawn_server().await;
    let transport = transport(&endpoint, TOKEN);

    transport.connect(Duration::from_secs(5)).await.unwrap();
    assert!(transport.is_connected());

    let tools = transport.list_tools(Duration::from_secs(5)).await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["get_issue", "search_issues"]);
    assert!(tools[0].input_schema.is_some());
}

#[tokio::test]
async fn test_handshake_result_is_cached() {
    let endpoint = spawn_server().await;
    let transport = transport(&endpoint, TOKEN);
    assert!(transport.server_info().is_none());

    transport.connect(Duration::from_secs(5)).await.unwrap();
    let info = transport.server_info().unwrap();
    assert_eq!(info.protocol_version, "2025-03-26");
    assert_eq!(info.server_info["name"], "fake");
}

#[tokio::test]
async fn test_call_tool_parses_text_content() {
    let endpoint = spawn_server().await;
    let transport = transport(&endpoint, TOKEN);

    let value = transport
        .call_tool("get_issue", &json!({"issue_key": "ONEC-8927"}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(value["key"], "ONEC-8927");
    assert_eq!(value["status"], "Open");
}

#[tokio::test]
async fn test_tool_errors_are_remote_errors() {
    let endpoint = spawn_server().await;
    let transport = transport(&endpoint, TOKEN);

    let err = transport
        .call_tool("broken", &json!({}), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CapabilityError::Remote {
            code: TOOL_ERROR_CODE,
            message: "boom".to_string()
        }
    );

    let err = transport
        .call_tool("nope", &json!({}), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, CapabilityError::Remote { code: -32601, .. }));
}

#[tokio::test]
async fn test_rejected_credentials_are_auth_errors() {
    let endpoint = spawn_server().await;
    let transport = transport(&endpoint, "wrong");

    let err = transport.connect(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, CapabilityError::Auth(_)));
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_unreachable_endpoint_is_connection_error() {
    // Bind then drop to get a port with nothing listening
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = transport(&format!("http://{}/mcp", addr), TOKEN);
    let err = transport.ping(Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, CapabilityError::Connection(_)));
}

#[tokio::test]
async fn test_tracker_client_probe_and_invoke() {
    let endpoint = spawn_server().await;
    let mut credentials = BTreeMap::new();
    credentials.insert("token".to_string(), TOKEN.to_string());
    let config = Arc::new(ProviderConfig {
        id: "jira".into(),
        kind: ProviderKind::IssueTracker,
        enabled: true,
        host: None,
        port: None,
        base_url: endpoint,
        credentials: Credentials::new(credentials),
        timeout: Duration::from_secs(5),
        declared_tools: vec![],
        keywords: vec![],
    });
    let client = create_client(config);

    let outcome = client.probe().await;
    assert!(outcome.reachable, "probe failed: {:?}", outcome.error);
    assert_eq!(client.server_info().unwrap().server_info["name"], "fake");

    let value = client
        .invoke("get_issue", &json!({"issue_key": "ONEC-1"}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(value["key"], "ONEC-1");
}

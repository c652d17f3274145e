//! MCP JSON-RPC client transport (streamable HTTP).
//!
//! One transport per provider. It performs the `initialize` handshake lazily,
//! keeps the `Mcp-Session-Id` the server hands out, and accepts both plain
//! JSON and `text/event-stream` response bodies.

use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::{CapabilityError, ServerInfo, ToolDescriptor};

pub const PROTOCOL_VERSION: &str = "2025-03-26";
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// JSON-RPC code reported for tool results flagged with `isError`
pub const TOOL_ERROR_CODE: i64 = -32000;

const MAX_LIST_PAGES: usize = 20;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<Value>,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
    #[serde(rename = "nextCursor", default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallToolResult {
    #[serde(default)]
    content: Vec<ContentItem>,
    #[serde(rename = "isError", default)]
    is_error: bool,
    #[serde(rename = "structuredContent", default)]
    structured_content: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

/// How credentials are attached to outgoing requests
pub enum Auth {
    None,
    Bearer(SecretString),
    Basic {
        username: String,
        password: SecretString,
    },
    Headers(Vec<(&'static str, SecretString)>),
}

impl Auth {
    fn apply(&self, req: RequestBuilder) -> RequestBuilder {
        match self {
            Auth::None => req,
            Auth::Bearer(token) => req.bearer_auth(token.expose_secret()),
            Auth::Basic { username, password } => {
                req.basic_auth(username, Some(password.expose_secret()))
            }
            Auth::Headers(headers) => headers
                .iter()
                .fold(req, |req, (name, value)| req.header(*name, value.expose_secret())),
        }
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::None => write!(f, "None"),
            Auth::Bearer(_) => write!(f, "Bearer(..)"),
            Auth::Basic { username, .. } => write!(f, "Basic({}, ..)", username),
            Auth::Headers(h) => f.debug_list().entries(h.iter().map(|(n, _)| n)).finish(),
        }
    }
}

pub struct McpTransport {
    provider_id: String,
    endpoint: String,
    client: Client,
    auth: Auth,
    request_id: AtomicU64,
    session_id: Mutex<Option<String>>,
    server_info: Mutex<Option<ServerInfo>>,
    initialized: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
    default_timeout: Duration,
}

impl McpTransport {
    pub fn new(
        provider_id: impl Into<String>,
        endpoint: impl Into<String>,
        auth: Auth,
        default_timeout: Duration,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            endpoint: endpoint.into(),
            client: Client::new(),
            auth,
            request_id: AtomicU64::new(0),
            session_id: Mutex::new(None),
            server_info: Mutex::new(None),
            initialized: AtomicBool::new(false),
            connect_lock: tokio::sync::Mutex::new(()),
            default_timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Cached handshake result; survives session resets until the next connect
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn reset_session(&self) {
        self.initialized.store(false, Ordering::Release);
        *self.session_id.lock() = None;
    }

    fn build(&self, body: &JsonRpcRequest<'_>, timeout: Duration) -> RequestBuilder {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json, text/event-stream")
            .timeout(timeout)
            .json(body);
        req = self.auth.apply(req);
        if let Some(session) = self.session_id.lock().clone() {
            req = req.header(SESSION_HEADER, session);
        }
        req
    }

    fn map_send_error(&self, err: reqwest::Error, timeout: Duration) -> CapabilityError {
        if err.is_timeout() {
            CapabilityError::timeout(timeout)
        } else {
            CapabilityError::from(err)
        }
    }

    /// Check the HTTP status, keeping session bookkeeping in sync
    fn check_status(&self, status: StatusCode, had_session: bool) -> Result<(), CapabilityError> {
        if status.is_success() {
            return Ok(());
        }
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CapabilityError::Auth(
                format!("{} rejected credentials ({})", self.provider_id, status),
            )),
            StatusCode::NOT_FOUND if had_session => {
                warn!(provider = %self.provider_id, "MCP session expired, will reconnect");
                self.reset_session();
                Err(CapabilityError::Connection("session expired".to_string()))
            }
            s if s.is_server_error() => Err(CapabilityError::Connection(format!(
                "{} returned HTTP {}",
                self.provider_id, s
            ))),
            s => Err(CapabilityError::Protocol(format!(
                "{} returned HTTP {}",
                self.provider_id, s
            ))),
        }
    }

    /// Send one JSON-RPC request and return its `result`
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, CapabilityError> {
        let id = self.next_id();
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        };

        let had_session = self.session_id.lock().is_some();
        let response = self
            .build(&body, timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, timeout))?;

        self.check_status(response.status(), had_session)?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        let text = response
            .text()
            .await
            .map_err(|e| self.map_send_error(e, timeout))?;

        let rpc = if is_event_stream {
            parse_event_stream(&text, id)?
        } else {
            serde_json::from_str::<JsonRpcResponse>(&text).map_err(|e| {
                CapabilityError::Protocol(format!("invalid JSON-RPC response: {}", e))
            })?
        };

        if let Some(error) = rpc.error {
            return Err(CapabilityError::Remote {
                code: error.code,
                message: error.message,
            });
        }

        rpc.result
            .ok_or_else(|| CapabilityError::Protocol("response carries no result".to_string()))
    }

    /// Send a JSON-RPC notification (no response body expected)
    pub async fn notify(&self, method: &str, timeout: Duration) -> Result<(), CapabilityError> {
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params: None,
        };
        let had_session = self.session_id.lock().is_some();
        let response = self
            .build(&body, timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, timeout))?;
        self.check_status(response.status(), had_session)
    }

    /// Perform the `initialize` handshake
    pub async fn connect(&self, timeout: Duration) -> Result<(), CapabilityError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        *self.session_id.lock() = None;

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let result = self.send_request("initialize", Some(params), timeout).await?;
        let info: ServerInfo = serde_json::from_value(result)
            .map_err(|e| CapabilityError::Protocol(format!("invalid initialize result: {}", e)))?;
        debug!(
            provider = %self.provider_id,
            protocol = %info.protocol_version,
            server = %info.server_info,
            "MCP session initialized"
        );

        self.notify("notifications/initialized", timeout).await?;
        *self.server_info.lock() = Some(info);
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn ensure_connected(&self, timeout: Duration) -> Result<(), CapabilityError> {
        if self.is_connected() {
            Ok(())
        } else {
            self.connect(timeout).await
        }
    }

    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDescriptor>, CapabilityError> {
        self.ensure_connected(timeout).await?;

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.send_request("tools/list", params, timeout).await?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| CapabilityError::Protocol(format!("invalid tools/list result: {}", e)))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: &Value,
        timeout: Duration,
    ) -> Result<Value, CapabilityError> {
        self.ensure_connected(timeout).await?;

        let params = json!({
            "name": name,
            "arguments": arguments,
        });
        let result = self.send_request("tools/call", Some(params), timeout).await?;
        let call: CallToolResult = serde_json::from_value(result)
            .map_err(|e| CapabilityError::Protocol(format!("invalid tools/call result: {}", e)))?;

        let text = call
            .content
            .iter()
            .filter(|item| item.content_type == "text")
            .filter_map(|item| item.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        if call.is_error {
            return Err(CapabilityError::Remote {
                code: TOOL_ERROR_CODE,
                message: if text.is_empty() {
                    format!("tool {} reported an error", name)
                } else {
                    text
                },
            });
        }

        if let Some(structured) = call.structured_content {
            return Ok(structured);
        }

        if text.is_empty() {
            return Ok(Value::Null);
        }

        // Try to parse as JSON, otherwise return as string
        Ok(serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text)))
    }

    pub async fn ping(&self, timeout: Duration) -> Result<(), CapabilityError> {
        self.ensure_connected(timeout).await?;
        self.send_request("ping", None, timeout).await.map(|_| ())
    }
}

/// Pick the response matching `id` out of an SSE body
fn parse_event_stream(body: &str, id: u64) -> Result<JsonRpcResponse, CapabilityError> {
    let mut data = String::new();
    let mut events = Vec::new();

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            if !data.is_empty() {
                events.push(std::mem::take(&mut data));
            }
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        }
    }
    if !data.is_empty() {
        events.push(data);
    }

    for event in events {
        let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&event) else {
            continue;
        };
        let matches = match &response.id {
            Some(Value::Number(n)) => n.as_u64() == Some(id),
            Some(Value::String(s)) => s == &id.to_string(),
            _ => false,
        };
        if matches {
            return Ok(response);
        }
    }

    Err(CapabilityError::Protocol(
        "event stream ended without a response".to_string(),
    ))
}

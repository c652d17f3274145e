//! REST API handlers for chat, provider status and configuration

use axum::{
    extract::{Path, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

use super::metrics_handler::MetricsCollector;
use crate::chat::event::TurnEvent;
use crate::chat::{ChatError, TurnPipeline};
use crate::config::sanitize::sanitized_view;
use crate::config::SettingsHandle;
use crate::domain::{ChatMessage, ContextSummary, ProviderStatus, ToolDescriptor, ToolInvocation};
use crate::mcp::dispatcher::DispatchLimits;
use crate::mcp::registry::ProviderRegistry;

/// Frames buffered between a streaming turn and its HTTP response
pub const EVENT_BUFFER: usize = 64;

/// Header carrying the session id of a streamed turn
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Shared application state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<TurnPipeline>,
    pub settings: Arc<SettingsHandle>,
    pub registry: Arc<ProviderRegistry>,
    pub metrics: Arc<MetricsCollector>,
}

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub reply: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub degraded: bool,
    pub context_used: ContextSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallRequest {
    #[serde(alias = "server")]
    pub provider: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// Error body returned by every endpoint
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }

    pub fn not_found(error: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error)
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        let status = match &err {
            ChatError::EmptyMessage => StatusCode::BAD_REQUEST,
            ChatError::SessionBusy(_) => StatusCode::CONFLICT,
            ChatError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

// ============================================================================
// Chat
// ============================================================================

/// Submit a turn and wait for the full reply
pub async fn submit_chat(
    State(state): State<ApiState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let outcome = state
        .pipeline
        .submit_turn(request.session_id.as_deref(), &request.message)
        .await?;

    Ok(Json(ChatResponse {
        session_id: outcome.session_id,
        reply: outcome.reply.content,
        timestamp: outcome.reply.timestamp,
        degraded: outcome.reply.degraded,
        context_used: outcome.context.summary(),
    }))
}

/// Submit a turn and stream its frames as Server-Sent Events
pub async fn stream_chat(
    State(state): State<ApiState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let session_id = request
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let header = HeaderValue::from_str(&session_id)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid session id"))?;

    let (tx, rx) = mpsc::channel::<TurnEvent>(EVENT_BUFFER);
    let pipeline = state.pipeline.clone();
    let turn_session = session_id.clone();
    tokio::spawn(async move {
        // Frames already carry the outcome; the result only matters for logging
        let _ = pipeline
            .run_turn_streaming(Some(&turn_session), &request.message, tx)
            .await;
    });

    let events = ReceiverStream::new(rx).map(|event| Event::default().json_data(event));
    let sse = Sse::new(events).keep_alive(KeepAlive::default());

    Ok((
        [(HeaderName::from_static(SESSION_ID_HEADER), header)],
        sse,
    )
        .into_response())
}

pub async fn get_history(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let messages = state
        .pipeline
        .sessions()
        .history(&session_id)
        .await
        .ok_or_else(|| ApiError::from(ChatError::SessionNotFound(session_id.clone())))?;

    Ok(Json(HistoryResponse {
        session_id,
        messages,
    }))
}

pub async fn list_sessions(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({ "sessions": state.pipeline.sessions().list().await }))
}

// ============================================================================
// Providers
// ============================================================================

pub async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.registry.status_snapshot())
}

pub async fn probe_provider(
    State(state): State<ApiState>,
    Path(provider_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state
        .registry
        .probe_now(&provider_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Unknown provider: {}", provider_id)))?;

    // Skipped probes (disabled, or one already in flight) leave the gauge alone
    if !matches!(view.status, ProviderStatus::Disabled | ProviderStatus::Probing) {
        state.metrics.record_probe(&provider_id, view.status);
    }
    Ok(Json(view))
}

/// Handshake details the provider reported when the session was opened
pub async fn get_server_info(
    State(state): State<ApiState>,
    Path(provider_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state
        .registry
        .get(&provider_id)
        .ok_or_else(|| ApiError::not_found(format!("Unknown provider: {}", provider_id)))?;

    Ok(Json(json!({
        "provider": provider_id,
        "status": handle.status(),
        "info": handle.server_info(),
    })))
}

pub async fn list_tools(State(state): State<ApiState>) -> impl IntoResponse {
    let tools: BTreeMap<String, Vec<ToolDescriptor>> = state
        .registry
        .available_capabilities()
        .into_iter()
        .map(|p| (p.provider_id, p.tools))
        .collect();
    Json(json!({ "tools": tools }))
}

pub async fn get_provider_tools(
    State(state): State<ApiState>,
    Path(provider_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state
        .registry
        .get(&provider_id)
        .ok_or_else(|| ApiError::not_found(format!("Unknown provider: {}", provider_id)))?;

    Ok(Json(json!({
        "provider": provider_id,
        "status": handle.status(),
        "tools": handle.capabilities(),
    })))
}

/// Invoke one tool directly, through the same guard and timeouts as a turn
pub async fn call_tool(
    State(state): State<ApiState>,
    Json(request): Json<ToolCallRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state
        .registry
        .get(&request.provider)
        .ok_or_else(|| ApiError::not_found(format!("Unknown provider: {}", request.provider)))?;
    if !handle.has_tool(&request.tool) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Provider {} has no tool {}", request.provider, request.tool),
        ));
    }

    let chat = state.settings.current().settings.chat.clone();
    let limits = DispatchLimits {
        invocation_timeout: chat.invocation_timeout(),
        turn_timeout: chat.turn_timeout(),
    };
    let mut invocation = ToolInvocation::new(request.provider, request.tool);
    invocation.arguments = request.arguments;

    let mut results = state
        .pipeline
        .dispatcher()
        .dispatch(vec![invocation], limits)
        .await;

    match results.pop() {
        Some(result) => {
            if !result.success {
                warn!(
                    provider = %result.provider_id,
                    tool = %result.tool_name,
                    error = ?result.error,
                    "Direct tool call failed"
                );
            }
            Ok(Json(result))
        }
        None => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "dispatcher returned no result",
        )),
    }
}

// ============================================================================
// Configuration
// ============================================================================

pub async fn get_config(State(state): State<ApiState>) -> impl IntoResponse {
    Json(sanitized_view(&state.settings.current().settings))
}

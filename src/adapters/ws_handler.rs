//! Duplex chat channel over WebSocket.
//!
//! Client frames: `{"type":"message","content":"..."}`. Server frames are
//! the turn events (`token`, `context`, `error`, `done`), preceded once per
//! connection by `{"type":"session","session_id":"..."}`. Turns from one
//! connection run one after another; closing the socket cancels the turn in
//! flight without touching the session.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::api_handler::{ApiState, EVENT_BUFFER};
use crate::chat::event::TurnEvent;

/// Messages a connection may queue while a turn is running
const PENDING_MESSAGES: usize = 8;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Message { content: String },
    Ping,
}

pub async fn handle_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    let session_id = params
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| handle_socket(state, socket, session_id))
}

fn frame(event: &TurnEvent) -> String {
    serde_json::to_string(event).unwrap_or_default()
}

async fn handle_socket(state: ApiState, socket: WebSocket, session_id: String) {
    info!(session = %session_id, "WebSocket client connected");
    let (mut sender, mut receiver) = socket.split();

    // Single writer for the socket
    let (out_tx, mut out_rx) = mpsc::channel::<String>(EVENT_BUFFER);
    let send_task = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let hello = json!({"type": "session", "session_id": session_id}).to_string();
    if out_tx.send(hello).await.is_err() {
        send_task.abort();
        return;
    }

    // Turns run sequentially in their own task so the reader keeps watching
    // for the socket closing
    let (msg_tx, mut msg_rx) = mpsc::channel::<String>(PENDING_MESSAGES);
    let turn_out = out_tx.clone();
    let turn_session = session_id.clone();
    let pipeline = state.pipeline.clone();
    let turn_task = tokio::spawn(async move {
        while let Some(content) = msg_rx.recv().await {
            let (tx, mut rx) = mpsc::channel::<TurnEvent>(EVENT_BUFFER);
            let out = turn_out.clone();
            let forward = async move {
                while let Some(event) = rx.recv().await {
                    if out.send(frame(&event)).await.is_err() {
                        break;
                    }
                }
            };
            let (result, _) = tokio::join!(
                pipeline.run_turn_streaming(Some(&turn_session), &content, tx),
                forward
            );
            if let Err(e) = result {
                debug!(session = %turn_session, error = %e, "Turn ended without reply");
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Message { content }) => {
                    if msg_tx.try_send(content).is_err() {
                        let busy = frame(&TurnEvent::error("too many pending messages"));
                        let _ = out_tx.send(busy).await;
                    }
                }
                Ok(ClientFrame::Ping) => {
                    let _ = out_tx.send(json!({"type": "pong"}).to_string()).await;
                }
                Err(e) => {
                    let invalid = frame(&TurnEvent::error(format!("invalid frame: {}", e)));
                    let _ = out_tx.send(invalid).await;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(session = %session_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Dropping the turn future releases the session lock before anything
    // was appended; spawned tool calls finish on their own
    turn_task.abort();
    send_task.abort();
    info!(session = %session_id, "WebSocket client disconnected");
}

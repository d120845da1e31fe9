// ============================
// pika-backend-lib/src/ws_router.rs
// ============================
//! HTTP router: the WebSocket endpoint plus a small discovery API.
use crate::coordinator::{SessionRecap, SessionSummary};
use crate::error::AppError;
use crate::messages::ServerMessage;
use crate::metrics::{WS_ACTIVE, WS_CONNECTION};
use crate::validation;
use crate::websocket::WebSocketHandler;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

/// Outbound messages buffered per connection before senders wait
const OUTBOUND_BUFFER: usize = 64;

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{session_id}/recap", get(session_recap))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "liveSessions": state.coordinator.live_session_count(),
    }))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSummary>> {
    Json(state.coordinator.live_sessions())
}

async fn session_recap(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionRecap>, AppError> {
    validation::validate_session_id(&session_id).map_err(|issue| AppError::Validation {
        path: issue.path,
        message: issue.message,
    })?;
    Ok(Json(state.coordinator.recap(&session_id).await?))
}

/// Handler for WebSocket connections
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    counter!(WS_CONNECTION).increment(1);
    gauge!(WS_ACTIVE).increment(1.0);

    let (mut sink, mut stream) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);

    // Forward queued ServerMessages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to serialize outbound message");
                    continue;
                },
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                debug!("Socket closed while sending");
                break;
            }
        }
    });

    let mut handler = WebSocketHandler::new(state, outbound);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handler.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                debug!(connection = %handler.connection_id(), "Ignoring binary frame");
            },
            // Ping/pong are answered by axum
            Ok(_) => {},
            Err(e) => {
                debug!(connection = %handler.connection_id(), error = %e, "WebSocket receive error");
                break;
            },
        }
    }

    handler.on_close().await;
    drop(handler);

    gauge!(WS_ACTIVE).decrement(1.0);
    send_task.abort();
}

//! HTTP and WebSocket routes for runbox server.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{IntoResponse, Json},
    routing::get,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use runbox_core::BrokerConfig;
use tower_http::cors::CorsLayer;

use crate::error::{ServerError, ServerResult};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::PlaygroundSession;

/// Application state shared across handlers.
pub struct AppState {
    /// Configuration every new session's broker is built from.
    pub broker: BrokerConfig,
}

/// Create the router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check handler.
async fn health_handler() -> Json<serde_json::Value> {
    Json(health_body())
}

fn health_body() -> serde_json::Value {
    serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    })
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_websocket(socket, state))
}

type WsSender = SplitSink<WebSocket, Message>;

/// Handle WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let mut session = match PlaygroundSession::new(&state.broker) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Failed to start session: {}", e);
            let _ = send_message(&mut sender, &ServerMessage::InitFailed {
                message: e.to_string(),
            })
            .await;
            return;
        }
    };

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::warn!(session = %session.id(), "WebSocket error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => continue,
                };

                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => session.handle_client_message(message),
                    Err(e) => {
                        tracing::warn!("Failed to parse client message: {} (input: {})", e, text);
                        Some(ServerMessage::error(format!("Invalid message format: {}", e)))
                    }
                };
                if let Some(reply) = reply {
                    if let Err(e) = send_message(&mut sender, &reply).await {
                        tracing::debug!(session = %session.id(), "{}", e);
                        break;
                    }
                }
            }
            outgoing = session.next_message() => {
                let Some(message) = outgoing else {
                    break;
                };
                if let Err(e) = send_message(&mut sender, &message).await {
                    tracing::debug!(session = %session.id(), "{}", e);
                    break;
                }
            }
        }
    }

    session.close();
}

/// Send a server message through the WebSocket.
async fn send_message(sender: &mut WsSender, message: &ServerMessage) -> ServerResult<()> {
    let json = serde_json::to_string(message)?;
    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| ServerError::WebSocket(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_json() {
        let health = health_body();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
    }
}

//! Real-time log feed over WebSocket
//!
//! Every appended request log is pushed to connected clients as a
//! `{"type":"new-log","log":...}` frame. A failing or slow client only
//! affects itself: it subscribes to the engine's broadcast channel, and
//! lagging simply skips messages for that one subscriber.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use engine::{ChaosEngine, ServerMessage};

use crate::server::AppState;
use crate::services::upstream::UpstreamClient;

pub async fn websocket_handler<U>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<U>>,
) -> Response
where
    U: UpstreamClient + 'static,
{
    ws.on_upgrade(move |socket| handle_websocket(socket, state.engine))
}

async fn handle_websocket(socket: WebSocket, engine: Arc<ChaosEngine>) {
    let client_id = Uuid::new_v4();
    info!("🔗 New WebSocket client: {client_id}");

    let (mut sender, mut receiver) = socket.split();

    let hello = ServerMessage::Connected {
        message: "WebSocket connected".to_string(),
    };
    let hello_json = match serde_json::to_string(&hello) {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to serialize hello frame: {e}");
            return;
        }
    };
    if sender.send(Message::Text(hello_json)).await.is_err() {
        debug!("client {client_id} went away before the hello frame");
        return;
    }

    let mut log_rx = engine.subscribe();
    let forward_task = tokio::spawn(async move {
        loop {
            match log_rx.recv().await {
                Ok(log) => {
                    let frame = ServerMessage::NewLog { log };
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("failed to serialize log frame: {e}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("client {client_id} lagged, skipped {skipped} log frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Drain the client side until it closes; inbound frames carry nothing.
    let drain_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = forward_task => {}
        _ = drain_task => {}
    }

    debug!("🔌 WebSocket client {client_id} disconnected");
}

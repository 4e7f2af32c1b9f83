//! WebSocket transport for the broadcast hub

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

use crate::broadcast::{BroadcastHub, ClientHandle, ServerMessage};
use crate::AppState;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Bridge one socket to a hub connection until either side goes away
async fn handle_socket(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let ClientHandle { id, mut outbound } = hub.connect();

    info!(connection_id = %id, "WebSocket client connected");

    // Write task: hub -> client
    let write_id = id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if matches!(message, ServerMessage::Ping { .. })
                && ws_tx.send(Message::Ping(Default::default())).await.is_err()
            {
                break;
            }
            let Ok(json) = serde_json::to_string(&message) else {
                continue;
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        // The hub dropped this connection (heartbeat or shutdown)
        let _ = ws_tx.send(Message::Close(None)).await;
        debug!(connection_id = %write_id, "WebSocket writer finished");
    });

    // Read task: client -> hub
    let read_hub = hub.clone();
    let read_id = id.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = ws_rx.next().await {
            match frame {
                Message::Text(text) => {
                    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                        if let Err(e) = read_hub.handle_message(&read_id, line) {
                            debug!(connection_id = %read_id, error = %e, "Rejected client message");
                        }
                    }
                }
                Message::Pong(_) => read_hub.mark_alive(&read_id),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    hub.disconnect(&id);
    info!(connection_id = %id, "WebSocket client disconnected");
}

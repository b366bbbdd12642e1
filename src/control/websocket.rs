//! WebSocket feed of listener status
//!
//! Pushes a [`ServerStatus`](crate::protocol::ServerStatus) snapshot on
//! connect and after every state change.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

use crate::control::server::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| push_status(socket, state))
}

fn status_message(state: &AppState) -> Option<Message> {
    match serde_json::to_string(&state.server.status()) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            tracing::warn!("Failed to serialize status: {}", e);
            None
        }
    }
}

async fn push_status(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut states = state.server.subscribe_state();

    if let Some(message) = status_message(&state) {
        if sender.send(message).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                states.borrow_and_update();
                let Some(message) = status_message(&state) else {
                    continue;
                };
                if sender.send(message).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!("Status WebSocket closed");
}

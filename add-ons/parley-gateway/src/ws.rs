//! Websocket endpoint: one socket per session.
//!
//! The socket is split in two: a writer task drains the session's outbound
//! channel onto the sink, while this handler's read loop feeds inbound
//! frames to the session driver. Text frames carry JSON control messages,
//! binary frames carry framed audio; both pass through opaque — all protocol
//! interpretation lives in the engine.

use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use parley_voice::WireMessage;
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: Option<String>,
}

pub async fn voice_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Option<String>) {
    let mut connection = state.manager.connect(user_id);
    let session_id = connection.id;
    info!(session = %session_id, "websocket connected");

    let (mut sink, mut stream) = socket.split();

    // Writer: session outbound channel → socket. Ends when the session
    // closes (channel end) or the peer goes away (send failure).
    let mut out_rx = connection.out_rx;
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let frame = match msg {
                WireMessage::Text(text) => Message::Text(text),
                WireMessage::Binary(bytes) => Message::Binary(bytes),
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(Message::Text(text)) => WireMessage::Text(text),
            Ok(Message::Binary(bytes)) => WireMessage::Binary(bytes),
            Ok(Message::Close(_)) => break,
            // Ping/pong handled by the websocket layer.
            Ok(_) => continue,
            Err(e) => {
                debug!(session = %session_id, "websocket read error: {e}");
                break;
            }
        };
        if connection.in_tx.send(msg).is_err() {
            // Session driver already gone (idle timeout or fatal error).
            break;
        }
    }

    state.manager.disconnect(session_id);
    drop(connection.in_tx);
    let _ = writer.await;
    info!(session = %session_id, "websocket closed");
}

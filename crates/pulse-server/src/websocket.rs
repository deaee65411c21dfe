//! Duplex endpoint: WebSocket upgrade, per-connection loops, inbound relay.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use pulse_core::{Message, MessageKind, MessageSequence};

use crate::registry::{SubscriberId, SubscriberRegistry};
use crate::server::AppState;

/// Upgrade to a duplex connection, or tell the client why we couldn't.
pub async fn handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
) -> Response {
    match ws {
        Ok(upgrade) => upgrade
            .on_upgrade(move |socket| handle_socket(socket, state))
            .into_response(),
        Err(rejection) => {
            tracing::warn!(reason = %rejection, "websocket upgrade failed");
            (StatusCode::BAD_REQUEST, "WebSocket upgrade failed").into_response()
        }
    }
}

/// Run one duplex connection: greet, then pump frames both ways until
/// either side ends.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (id, mut rx) = state.sockets.register();
    tracing::info!(subscriber = %id, "duplex subscriber connected");

    if let Ok(greeting) = serde_json::to_string(&Message::socket_welcome()) {
        let _ = state.sockets.send_to(&id, Arc::new(greeting));
    }

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: drain the subscriber queue onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = frame.as_str().to_owned();
            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Reader: echo and relay inbound text until the peer closes.
    let reader_registry = Arc::clone(&state.sockets);
    let reader_sequence = Arc::clone(&state.sequence);
    let reader_id = id.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(inbound)) = ws_rx.next().await {
            match inbound {
                WsMessage::Text(payload) => {
                    relay_inbound(
                        &reader_registry,
                        &reader_sequence,
                        &reader_id,
                        payload.as_str(),
                    );
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }

    state.sockets.mark_closed(&id);
    state.sockets.unregister(&id);
    tracing::info!(subscriber = %id, "duplex subscriber disconnected");
}

/// Echo an inbound payload to its sender and relay it to every other open
/// subscriber. Both payloads share one sequence value: one inbound event,
/// two deliveries.
pub(crate) fn relay_inbound(
    registry: &SubscriberRegistry,
    sequence: &MessageSequence,
    sender: &SubscriberId,
    payload: &str,
) {
    let id = sequence.next();

    let echo = Message::new(
        id,
        MessageKind::Websocket,
        format!("You said: {payload}"),
        "Server received your message and responded",
    );
    match serde_json::to_string(&echo) {
        Ok(frame) => {
            if let Err(reason) = registry.send_to(sender, Arc::new(frame)) {
                tracing::debug!(subscriber = %sender, %reason, "echo not delivered");
            }
        }
        Err(error) => tracing::warn!(%error, "failed to encode echo"),
    }

    let relay = Message::new(
        id,
        MessageKind::Websocket,
        format!("[Broadcast] Someone said: {payload}"),
        "Message from another client",
    );
    match serde_json::to_string(&relay) {
        Ok(frame) => {
            let delivered = registry.fan_out_open(&Arc::new(frame), Some(sender));
            tracing::debug!(id, delivered, "relayed inbound message");
        }
        Err(error) => tracing::warn!(%error, "failed to encode relay"),
    }
}

//! The two periodic fan-out loops.

use std::sync::Arc;
use std::time::Duration;

use pulse_core::{Message, MessageKind, MessageSequence};
use tokio::task::JoinHandle;

use crate::registry::SubscriberRegistry;
use crate::sse;

/// Periodic push to streaming subscribers.
pub fn start_stream_loop(
    registry: Arc<SubscriberRegistry>,
    sequence: Arc<MessageSequence>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // consume first immediate tick
        loop {
            ticker.tick().await;
            stream_tick(&registry, &sequence);
        }
    })
}

/// One streaming broadcast pass. An empty registry is a no-op that leaves
/// the sequence untouched.
pub(crate) fn stream_tick(registry: &SubscriberRegistry, sequence: &MessageSequence) {
    if registry.is_empty() {
        return;
    }
    let id = sequence.next();
    let message = Message::new(
        id,
        MessageKind::Sse,
        format!("SSE Push #{id}"),
        "Server pushed this without client asking",
    );
    let frame = match sse::encode_frame(&message) {
        Ok(frame) => Arc::new(frame),
        Err(error) => {
            tracing::warn!(%error, "failed to encode streaming broadcast");
            return;
        }
    };
    let outcome = registry.fan_out(&frame);
    tracing::debug!(
        id,
        delivered = outcome.delivered,
        removed = outcome.removed,
        "streaming broadcast"
    );
}

/// Periodic push to duplex subscribers.
pub fn start_socket_loop(
    registry: Arc<SubscriberRegistry>,
    sequence: Arc<MessageSequence>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // consume first immediate tick
        loop {
            ticker.tick().await;
            socket_tick(&registry, &sequence);
        }
    })
}

/// One duplex broadcast pass. Only subscribers still open get the frame;
/// closed ones are left for their own teardown to remove.
pub(crate) fn socket_tick(registry: &SubscriberRegistry, sequence: &MessageSequence) {
    if registry.is_empty() {
        return;
    }
    let id = sequence.next();
    let message = Message::new(
        id,
        MessageKind::Websocket,
        format!("WebSocket Broadcast #{id}"),
        "Server broadcast to all connected clients",
    );
    match serde_json::to_string(&message) {
        Ok(frame) => {
            let delivered = registry.fan_out_open(&Arc::new(frame), None);
            tracing::debug!(id, delivered, "duplex broadcast");
        }
        Err(error) => tracing::warn!(%error, "failed to encode duplex broadcast"),
    }
}

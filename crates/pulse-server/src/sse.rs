//! Server-sent events endpoint and frame encoding.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use pulse_core::Message;
use tokio_stream::wrappers::ReceiverStream;

use crate::registry::{SubscriberId, SubscriberRegistry};
use crate::server::AppState;

/// Encode one message in the line-oriented event-stream framing.
pub fn encode_frame(message: &Message) -> Result<String, serde_json::Error> {
    Ok(format!("data: {}\n\n", serde_json::to_string(message)?))
}

/// Deregisters the subscriber when the response body is dropped. Body drop
/// is the transport's disconnect signal, so cleanup happens immediately
/// instead of waiting for the next broadcast tick to fail a send.
struct StreamGuard {
    registry: Arc<SubscriberRegistry>,
    id: SubscriberId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
        tracing::info!(subscriber = %self.id, "streaming subscriber disconnected");
    }
}

pin_project_lite::pin_project! {
    /// Frame stream that owns its registry guard for its whole lifetime.
    struct GuardedFrames<S> {
        #[pin]
        frames: S,
        _guard: StreamGuard,
    }
}

impl<S: Stream> Stream for GuardedFrames<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().frames.poll_next(cx)
    }
}

/// Open a streaming subscription: the welcome frame first, then whatever
/// the broadcast loop pushes, until the client goes away. The server never
/// ends the stream on its own.
pub async fn handler(State(state): State<AppState>) -> Response {
    let (id, rx) = state.streams.register();
    tracing::info!(subscriber = %id, "streaming subscriber connected");

    let welcome = match encode_frame(&Message::stream_welcome()) {
        Ok(frame) => Some(Arc::new(frame)),
        Err(error) => {
            tracing::warn!(%error, "failed to encode welcome frame");
            None
        }
    };

    let guard = StreamGuard {
        registry: Arc::clone(&state.streams),
        id,
    };
    let frames = futures::stream::iter(welcome)
        .chain(ReceiverStream::new(rx))
        .map(|frame| Ok::<_, Infallible>(Bytes::copy_from_slice(frame.as_bytes())));

    let body = Body::from_stream(GuardedFrames {
        frames,
        _guard: guard,
    });

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}

//! Long-polling endpoint: hold the request, then answer with one update.

use axum::extract::{Query, State};
use axum::Json;
use pulse_core::{Message, MessageKind};
use serde::Deserialize;

use crate::server::AppState;

/// Query parameters accepted by the long-polling endpoint.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PollQuery {
    #[serde(rename = "lastId")]
    last_id: Option<String>,
}

impl PollQuery {
    /// Client bookkeeping value. The server logs it and nothing more;
    /// responses are never diffed against it.
    fn last_id(&self) -> u64 {
        self.last_id
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }
}

/// Suspend the request for a randomized interval, then mint and return one
/// update. Exactly one response per request; the delay models "server
/// holds the connection until data is ready".
pub async fn handler(State(state): State<AppState>, Query(query): Query<PollQuery>) -> Json<Message> {
    let hold = state.config.sample_poll_hold();
    tracing::debug!(
        last_id = query.last_id(),
        hold_ms = hold.as_millis() as u64,
        "holding long-poll request"
    );
    tokio::time::sleep(hold).await;

    let id = state.sequence.next();
    Json(Message::new(
        id,
        MessageKind::LongPolling,
        format!("Long Polling Update #{id}"),
        "Server held connection, then responded with new data",
    ))
}

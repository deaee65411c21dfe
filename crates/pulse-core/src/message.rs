use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// The three delivery patterns the demo exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "long-polling")]
    LongPolling,
    #[serde(rename = "sse")]
    Sse,
    #[serde(rename = "websocket")]
    Websocket,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LongPolling => "long-polling",
            Self::Sse => "sse",
            Self::Websocket => "websocket",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A synthetic update delivered to clients.
///
/// Immutable once constructed. Fan-out shares one encoded copy; the struct
/// itself is never mutated after handoff.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: String,
    pub explanation: String,
}

impl Message {
    pub fn new(
        id: u64,
        kind: MessageKind,
        content: impl Into<String>,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            id,
            kind,
            content: content.into(),
            timestamp: now_iso8601(),
            explanation: explanation.into(),
        }
    }

    /// Greeting pushed when a streaming subscriber connects. Fixed id 0 —
    /// greetings never consume the shared sequence.
    pub fn stream_welcome() -> Self {
        Self::new(
            0,
            MessageKind::Sse,
            "SSE Connection established!",
            "Server will now push updates to you",
        )
    }

    /// Greeting sent once a duplex subscriber finishes the upgrade.
    pub fn socket_welcome() -> Self {
        Self::new(
            0,
            MessageKind::Websocket,
            "WebSocket Connected!",
            "Bidirectional channel established",
        )
    }
}

/// UTC timestamp with millisecond precision and `Z` suffix.
fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use pulse_core::MessageSequence;
use rand::Rng;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeFile;

use crate::broadcast;
use crate::registry::SubscriberRegistry;
use crate::{longpoll, sse, websocket};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    /// Per-subscriber frame queue depth.
    pub send_queue: usize,
    /// Cadence of both broadcast loops.
    pub broadcast_period: Duration,
    /// Long-poll hold range, sampled uniformly per request from [min, max).
    pub poll_hold_min: Duration,
    pub poll_hold_max: Duration,
    /// Directory the static demo page is served from.
    pub assets_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            send_queue: 256,
            broadcast_period: Duration::from_millis(3000),
            poll_hold_min: Duration::from_millis(2000),
            poll_hold_max: Duration::from_millis(4000),
            assets_dir: PathBuf::from("public"),
        }
    }
}

impl ServerConfig {
    /// Draw one long-poll hold time.
    pub fn sample_poll_hold(&self) -> Duration {
        let span = self.poll_hold_max.saturating_sub(self.poll_hold_min);
        if span.is_zero() {
            return self.poll_hold_min;
        }
        let jitter = rand::thread_rng().gen_range(0..span.as_millis() as u64);
        self.poll_hold_min + Duration::from_millis(jitter)
    }
}

/// Shared application state passed to the Axum handlers. The sequence and
/// the two registries are the only shared mutable state in the process.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub sequence: Arc<MessageSequence>,
    pub streams: Arc<SubscriberRegistry>,
    pub sockets: Arc<SubscriberRegistry>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let send_queue = config.send_queue;
        Self {
            config: Arc::new(config),
            sequence: Arc::new(MessageSequence::new()),
            streams: Arc::new(SubscriberRegistry::new(send_queue)),
            sockets: Arc::new(SubscriberRegistry::new(send_queue)),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let index = ServeFile::new(state.config.assets_dir.join("index.html"));
    let styles = ServeFile::new(state.config.assets_dir.join("styles.css"));

    Router::new()
        .route_service("/", index.clone())
        .route_service("/index.html", index)
        .route_service("/styles.css", styles)
        .route("/api/long-polling", get(longpoll::handler))
        .route("/api/sse", get(sse::handler))
        .route("/api/websocket", get(websocket::handler))
        .fallback(not_found)
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not Found")
}

/// Create and start the server. Returns a handle that keeps the broadcast
/// loops alive and can shut everything down.
pub async fn start(config: ServerConfig) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(config);

    let stream_loop = broadcast::start_stream_loop(
        Arc::clone(&state.streams),
        Arc::clone(&state.sequence),
        state.config.broadcast_period,
    );
    let socket_loop = broadcast::start_socket_loop(
        Arc::clone(&state.sockets),
        Arc::clone(&state.sequence),
        state.config.broadcast_period,
    );

    let router = build_router(state.clone());
    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    tracing::info!(port = local_addr.port(), "realtime demo server started");

    Ok(ServerHandle {
        port: local_addr.port(),
        state,
        server,
        stream_loop,
        socket_loop,
    })
}

/// Handle returned by `start()` — keeps the background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    state: AppState,
    server: tokio::task::JoinHandle<()>,
    stream_loop: tokio::task::JoinHandle<()>,
    socket_loop: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop the listener and both loops, and drop every subscriber.
    pub fn shutdown(&self) {
        self.stream_loop.abort();
        self.socket_loop.abort();
        self.server.abort();
        self.state.streams.clear();
        self.state.sockets.clear();
        tracing::info!("realtime demo server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use pulse_core::{Message, MessageKind};
    use tokio_tungstenite::tungstenite::Message as WsClientMessage;

    fn assets_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../public")
    }

    fn fast_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            broadcast_period: Duration::from_millis(100),
            poll_hold_min: Duration::from_millis(10),
            poll_hold_max: Duration::from_millis(20),
            assets_dir: assets_dir(),
            ..Default::default()
        }
    }

    /// Broadcast period long enough that periodic frames never interleave
    /// with the frames under test.
    fn quiet_config() -> ServerConfig {
        ServerConfig {
            broadcast_period: Duration::from_secs(600),
            ..fast_config()
        }
    }

    fn decode_frame(chunk: &[u8]) -> Message {
        let text = std::str::from_utf8(chunk).unwrap();
        assert!(text.starts_with("data: "), "got: {text}");
        assert!(text.ends_with("\n\n"), "got: {text}");
        serde_json::from_str(text.trim_start_matches("data: ").trim_end()).unwrap()
    }

    #[test]
    fn default_config_matches_demo_constants() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.broadcast_period, Duration::from_millis(3000));
        assert_eq!(config.poll_hold_min, Duration::from_millis(2000));
        assert_eq!(config.poll_hold_max, Duration::from_millis(4000));
    }

    #[test]
    fn poll_hold_sampled_within_range() {
        let config = ServerConfig::default();
        for _ in 0..200 {
            let hold = config.sample_poll_hold();
            assert!(hold >= config.poll_hold_min, "got: {hold:?}");
            assert!(hold < config.poll_hold_max, "got: {hold:?}");
        }
    }

    #[test]
    fn poll_hold_degenerate_range() {
        let config = ServerConfig {
            poll_hold_min: Duration::from_millis(50),
            poll_hold_max: Duration::from_millis(50),
            ..Default::default()
        };
        assert_eq!(config.sample_poll_hold(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let handle = start(fast_config()).await.unwrap();
        let resp = reqwest::get(format!("http://127.0.0.1:{}/api/unknown", handle.port))
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.text().await.unwrap(), "Not Found");
        handle.shutdown();
    }

    #[tokio::test]
    async fn serves_static_assets() {
        let handle = start(fast_config()).await.unwrap();

        let index = reqwest::get(format!("http://127.0.0.1:{}/", handle.port))
            .await
            .unwrap();
        assert_eq!(index.status(), 200);
        assert!(index.text().await.unwrap().contains("<html"));

        let named = reqwest::get(format!("http://127.0.0.1:{}/index.html", handle.port))
            .await
            .unwrap();
        assert_eq!(named.status(), 200);

        let styles = reqwest::get(format!("http://127.0.0.1:{}/styles.css", handle.port))
            .await
            .unwrap();
        assert_eq!(styles.status(), 200);

        handle.shutdown();
    }

    #[tokio::test]
    async fn long_polling_returns_one_minted_message() {
        let handle = start(quiet_config()).await.unwrap();
        let resp = reqwest::get(format!(
            "http://127.0.0.1:{}/api/long-polling?lastId=5",
            handle.port
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 200);

        let message: Message = resp.json().await.unwrap();
        assert_eq!(message.kind, MessageKind::LongPolling);
        assert!(message.id >= 1);
        assert_eq!(message.content, format!("Long Polling Update #{}", message.id));
        assert_eq!(
            message.explanation,
            "Server held connection, then responded with new data"
        );
        handle.shutdown();
    }

    #[tokio::test]
    async fn long_polling_garbage_last_id_is_accepted() {
        let handle = start(quiet_config()).await.unwrap();
        let resp = reqwest::get(format!(
            "http://127.0.0.1:{}/api/long-polling?lastId=garbage",
            handle.port
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 200);
        handle.shutdown();
    }

    #[tokio::test]
    async fn long_polling_holds_two_to_four_seconds_by_default() {
        let config = ServerConfig {
            port: 0,
            broadcast_period: Duration::from_secs(600),
            assets_dir: assets_dir(),
            ..Default::default()
        };
        let handle = start(config).await.unwrap();

        let started = std::time::Instant::now();
        let resp = reqwest::get(format!("http://127.0.0.1:{}/api/long-polling", handle.port))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(resp.status(), 200);
        assert!(elapsed >= Duration::from_millis(2000), "held only {elapsed:?}");
        assert!(elapsed < Duration::from_millis(4500), "held too long: {elapsed:?}");
        handle.shutdown();
    }

    #[tokio::test]
    async fn sse_sends_welcome_then_periodic_push() {
        let handle = start(fast_config()).await.unwrap();
        let resp = reqwest::get(format!("http://127.0.0.1:{}/api/sse", handle.port))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");
        assert_eq!(resp.headers()["cache-control"], "no-cache");

        let mut body = resp.bytes_stream();

        let welcome = decode_frame(&body.next().await.unwrap().unwrap());
        assert_eq!(welcome.id, 0);
        assert_eq!(welcome.kind, MessageKind::Sse);
        assert_eq!(welcome.content, "SSE Connection established!");

        let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .expect("no push within one broadcast period")
            .unwrap()
            .unwrap();
        let push = decode_frame(&chunk);
        assert_eq!(push.kind, MessageKind::Sse);
        assert!(push.id >= 1);
        assert_eq!(push.content, format!("SSE Push #{}", push.id));

        handle.shutdown();
    }

    #[tokio::test]
    async fn sse_disconnect_deregisters_subscriber() {
        let handle = start(quiet_config()).await.unwrap();
        let resp = reqwest::get(format!("http://127.0.0.1:{}/api/sse", handle.port))
            .await
            .unwrap();
        let mut body = resp.bytes_stream();
        let _welcome = body.next().await.unwrap().unwrap();
        assert_eq!(handle.state.streams.count(), 1);

        drop(body);

        // the body drop propagates through the connection teardown
        for _ in 0..50 {
            if handle.state.streams.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(handle.state.streams.is_empty());
        handle.shutdown();
    }

    #[tokio::test]
    async fn websocket_without_upgrade_is_400() {
        let handle = start(fast_config()).await.unwrap();
        let resp = reqwest::get(format!("http://127.0.0.1:{}/api/websocket", handle.port))
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(resp.text().await.unwrap(), "WebSocket upgrade failed");
        handle.shutdown();
    }

    #[tokio::test]
    async fn websocket_greets_then_echoes_and_relays_with_one_id() {
        let handle = start(quiet_config()).await.unwrap();
        let url = format!("ws://127.0.0.1:{}/api/websocket", handle.port);

        let (mut alice, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (mut bob, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let alice_greeting = next_message(&mut alice).await;
        assert_eq!(alice_greeting.id, 0);
        assert_eq!(alice_greeting.kind, MessageKind::Websocket);
        assert_eq!(alice_greeting.content, "WebSocket Connected!");
        let _bob_greeting = next_message(&mut bob).await;

        alice
            .send(WsClientMessage::Text("hello".into()))
            .await
            .unwrap();

        let echo = next_message(&mut alice).await;
        assert_eq!(echo.kind, MessageKind::Websocket);
        assert_eq!(echo.content, "You said: hello");

        let relay = next_message(&mut bob).await;
        assert_eq!(relay.content, "[Broadcast] Someone said: hello");
        assert_eq!(relay.id, echo.id);

        handle.shutdown();
    }

    #[tokio::test]
    async fn websocket_close_deregisters_subscriber() {
        let handle = start(quiet_config()).await.unwrap();
        let url = format!("ws://127.0.0.1:{}/api/websocket", handle.port);

        let (mut client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let _greeting = next_message(&mut client).await;
        assert_eq!(handle.state.sockets.count(), 1);

        client.close(None).await.unwrap();
        drop(client);

        for _ in 0..50 {
            if handle.state.sockets.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(handle.state.sockets.is_empty());
        handle.shutdown();
    }

    #[tokio::test]
    async fn websocket_periodic_broadcast_reaches_all_clients() {
        let handle = start(fast_config()).await.unwrap();
        let url = format!("ws://127.0.0.1:{}/api/websocket", handle.port);

        let (mut alice, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (mut bob, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let _ = next_message(&mut alice).await;
        let _ = next_message(&mut bob).await;

        let alice_broadcast = next_message(&mut alice).await;
        let bob_broadcast = next_message(&mut bob).await;
        assert!(alice_broadcast.content.starts_with("WebSocket Broadcast #"));
        assert!(bob_broadcast.content.starts_with("WebSocket Broadcast #"));

        handle.shutdown();
    }

    async fn next_message<S>(ws: &mut S) -> Message
    where
        S: futures::Stream<Item = Result<WsClientMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("no websocket frame in time")
                .expect("websocket closed")
                .expect("websocket error");
            if let WsClientMessage::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }
}

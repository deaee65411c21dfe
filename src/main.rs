use std::path::PathBuf;

use clap::Parser;
use pulse_server::ServerConfig;

/// Demo server showing long polling, server-sent events, and WebSockets
/// side by side.
#[derive(Debug, Parser)]
#[command(name = "pulse", version)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Directory the static demo page is served from.
    #[arg(long, default_value = "public")]
    assets: PathBuf,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        port: args.port,
        assets_dir: args.assets,
        ..Default::default()
    };

    let handle = pulse_server::start(config)
        .await
        .expect("Failed to start server");

    tracing::info!(port = handle.port, "open http://localhost:{} in a browser", handle.port);
    tracing::info!("GET  /api/long-polling  - long polling demo");
    tracing::info!("GET  /api/sse           - server-sent events stream");
    tracing::info!("WS   /api/websocket     - websocket connection");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    tracing::info!("Shutting down");
    handle.shutdown();
}

//! # wsproto
//!
//! Signaling relay binary: accepts WebSocket peers identified by a `peer`
//! query parameter and fans `sdp` events out to every other peer.

#![deny(unsafe_code)]

mod relay;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use wsproto_server::WebSocketServer;
use wsproto_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

use crate::relay::Room;

/// WebSocket signaling relay.
#[derive(Parser, Debug)]
#[command(name = "wsproto", about = "WebSocket signaling relay")]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0:9999")]
    addr: String,

    /// Route serving the WebSocket endpoint.
    #[arg(long, default_value = "/stream")]
    path: String,

    /// Default log level (RUST_LOG takes precedence).
    #[arg(long, default_value = "debug")]
    log_level: Level,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// PEM certificate; serves wss:// together with `--key`.
    #[cfg(feature = "tls")]
    #[arg(long, requires = "key")]
    cert: Option<std::path::PathBuf>,

    /// PEM private key for `--cert`.
    #[cfg(feature = "tls")]
    #[arg(long, requires = "cert")]
    key: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        format: if args.json_logs { LogFormat::Json } else { LogFormat::Text },
        ..Default::default()
    })?;

    let mut server = WebSocketServer::new();
    server
        .set_path(args.path.as_str())
        .set_before_upgrade(relay::peer_hook);
    relay::install(&server, Arc::new(Room::new()));

    tracing::info!(addr = %args.addr, path = %args.path, "Starting signaling relay");

    #[cfg(feature = "tls")]
    let served = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => server.listen_and_serve_tls(&args.addr, cert, key).await,
        _ => server.listen_and_serve(&args.addr).await,
    };
    #[cfg(not(feature = "tls"))]
    let served = server.listen_and_serve(&args.addr).await;

    if let Err(err) = served {
        tracing::error!(error = %err, "Server terminated");
        std::process::exit(1);
    }
    Ok(())
}

//! wsbridge server - JSON-RPC over WebSocket bridge to HTTP upstreams.
//!
//! Clients hold one WebSocket open and multiplex JSON-RPC calls over it;
//! each call encodes an HTTP method and URL, and the bridge answers with the
//! upstream's status, content type, timing, and body. A single-shot HTTP
//! endpoint exposes the same machinery for debugging.

mod api;
mod config;
mod proxy;
mod sink;
mod stats;
mod upstream;
mod websocket;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use config::{ProxyParams, ServerConfig};
use stats::StatCounter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, Level};

/// Process-wide shared state.
pub struct AppState {
    pub config: ServerConfig,
    pub params: ProxyParams,
    pub http: reqwest::Client,
    pub stats: Arc<StatCounter>,
    pub start_time: Instant,
}

fn init_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();
    init_logging(config.debug);

    info!("Starting bridge-server v{}", env!("CARGO_PKG_VERSION"));

    let params = ProxyParams::from_config(&config);
    let http = upstream::build_http_client(Duration::from_secs(config.timeout_seconds))?;

    let stats = StatCounter::root();
    tokio::spawn(stats.clone().ticking_loop());

    let state = Arc::new(AppState {
        params,
        http,
        stats,
        start_time: Instant::now(),
        config,
    });

    let app = Router::new()
        .route("/", get(api::frontpage_handler))
        .route("/ws", get(websocket::websocket_handler))
        .route("/jsonrpc", post(api::jsonrpc_handler))
        .route("/api/health", get(api::health_handler))
        .route("/api/stats", get(api::stats_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&state.config.listen).await?;
    info!("Listening on {}...", state.config.listen);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

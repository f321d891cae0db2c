//! Plain-HTTP endpoints: the single-shot JSON-RPC adapter, the frontpage,
//! and introspection.

use crate::proxy::{panic_message, ProxyClient};
use crate::sink::ResponseSink;
use crate::AppState;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use bridge_core::protocol::JsonRpcRequest;
use futures_util::FutureExt;
use serde::Serialize;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::error;

/// `POST /jsonrpc` - one JSON-RPC call over plain HTTP, for debugging. Runs
/// the same dispatch machinery as the WebSocket path against a buffered
/// sink; no ping loop, no read deadline, no multiplexing.
pub async fn jsonrpc_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let rq: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(rq) => rq,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("bad JSON-RPC request: {e}\n"),
            )
                .into_response()
        }
    };

    let client = ProxyClient::new(state.clone(), addr, ResponseSink::Buffered(None));
    let request = client.stats.clone().request_started();
    client
        .stats
        .throttle_if_needed(
            SystemTime::now(),
            state.config.throttle_rps_per_client,
            state.config.throttle_concurrent_requests_per_client,
        )
        .await;
    let handled = AssertUnwindSafe(client.handle_rpc_request(&rq))
        .catch_unwind()
        .await;
    drop(request);

    if let Err(panic) = handled {
        let message = panic_message(panic.as_ref());
        error!("[{}] panic while handling `{}`: {}", addr, rq.method, message);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("PANIC: {message}\n"),
        )
            .into_response();
    }

    let payload = client.take_buffered().await.unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        payload,
    )
        .into_response()
}

const FRONTPAGE_HTML: &str = "<!DOCTYPE html>\n<html>\n<head><title>wsbridge</title></head>\n<body>\n<h1>wsbridge</h1>\n<p>JSON-RPC over WebSocket bridge to HTTP upstreams.</p>\n<ul>\n<li><code>/ws</code> &mdash; WebSocket endpoint</li>\n<li><code>/jsonrpc</code> &mdash; single-shot HTTP endpoint (POST)</li>\n</ul>\n</body>\n</html>\n";

/// `GET /` - static landing page.
pub async fn frontpage_handler() -> Html<&'static str> {
    Html(FRONTPAGE_HTML)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// `GET /api/health`
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

#[derive(Debug, Serialize)]
pub struct ServerStats {
    pub active_connections: i64,
    pub active_requests: i64,
}

/// `GET /api/stats` - the live gauges from the root counter.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ServerStats {
        active_connections: state.stats.active_connections(),
        active_requests: state.stats.active_requests(),
    })
}

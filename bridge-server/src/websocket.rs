//! The JSON-RPC WebSocket session.
//!
//! One session owns a reader loop on the upgraded socket, a keep-alive
//! pinger, and one worker task per in-flight call. The reader is the only
//! task that ends the session: a close frame, a decode error, or sixty
//! silent seconds all land here.

use crate::proxy::{panic_message, ProxyClient};
use crate::sink::ResponseSink;
use crate::AppState;
use axum::extract::ws::{close_code, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bridge_core::protocol::JsonRpcRequest;
use futures_util::{FutureExt, StreamExt};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Write-side buffer handed to the WebSocket library.
const WRITE_BUFFER_SIZE: usize = 32 * 1024;
/// Ceiling on one inbound message.
const MESSAGE_SIZE_LIMIT: usize = 1024 * 1024;
/// A session with no inbound frame for this long is torn down. Any frame,
/// pongs included, restarts the clock.
const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Keep-alive ping cadence; must stay under the read deadline.
const PING_INTERVAL: Duration = Duration::from_secs(50);

/// Accept a client on the origin whitelist. An empty whitelist admits
/// anyone; empty suffixes are skipped.
pub fn check_origin(whitelisted_origins: &[String], origin: &str) -> bool {
    if whitelisted_origins.is_empty() {
        return true;
    }
    whitelisted_origins
        .iter()
        .any(|suffix| !suffix.is_empty() && origin.ends_with(suffix))
}

/// `GET /ws` - upgrade and run a proxy session.
pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    state.stats.connection_attempt();

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !check_origin(&state.params.whitelisted_origins, origin) {
        warn!("request from non-whitelisted origin: `{}`", origin);
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    ws.write_buffer_size(WRITE_BUFFER_SIZE)
        .max_message_size(MESSAGE_SIZE_LIMIT)
        .on_upgrade(move |socket| run_session(state, socket, addr))
}

async fn run_session(state: Arc<AppState>, socket: WebSocket, addr: SocketAddr) {
    let (sender, mut receiver) = socket.split();
    let client = Arc::new(ProxyClient::new(
        state.clone(),
        addr,
        ResponseSink::WebSocket(sender),
    ));

    if state.config.log_connections {
        info!("[{}] connected", addr);
    }
    let _connection = state.stats.clone().opened_connection();

    // Keep-alive: one ping per interval through the shared write lock. A
    // failed write stops the pinger; the read deadline then ends the session.
    let pinger = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                if client.send_ping().await.is_err() {
                    break;
                }
            }
        })
    };

    loop {
        let message = match timeout(READ_DEADLINE, receiver.next()).await {
            Err(_) => {
                if state.config.log_connections {
                    error!("[{}] on read: deadline exceeded", addr);
                }
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                if state.config.log_connections {
                    error!("[{}] on read: {}", addr, e);
                }
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let payload = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(frame) => {
                match frame.as_ref().map(|f| f.code) {
                    None | Some(close_code::NORMAL) | Some(close_code::AWAY) => {}
                    Some(code) => {
                        if state.config.log_connections {
                            error!("[{}] on read: close code {}", addr, code);
                        }
                    }
                }
                break;
            }
            // control frames; arriving at all is what refreshes the deadline
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let rq: JsonRpcRequest = match serde_json::from_slice(&payload) {
            Ok(rq) => rq,
            Err(e) => {
                if state.config.log_connections {
                    error!("[{}] on read: {}", addr, e);
                }
                break;
            }
        };

        dispatch(&state, &client, rq);
    }

    pinger.abort();
    // close the write half so workers racing teardown get write errors
    // instead of landing frames on a dead session
    let _ = client.shutdown_sink().await;

    if client.write_failed() && state.config.log_client_io_errors {
        warn!("[{}] session had write errors", addr);
    }
    if state.config.log_connections {
        info!("[{}] disconnected", addr);
    }
}

/// Run one call on its own worker task. Responses reach the wire in
/// completion order; the sink lock keeps each frame atomic. A panicking
/// worker is logged and contained, and its request still counts as finished.
fn dispatch(state: &Arc<AppState>, client: &Arc<ProxyClient>, rq: JsonRpcRequest) {
    let request = client.stats.clone().request_started();
    let rps_limit = state.config.throttle_rps_per_client;
    let concurrent_limit = state.config.throttle_concurrent_requests_per_client;
    let client = client.clone();
    tokio::spawn(async move {
        let _request = request;
        client
            .stats
            .throttle_if_needed(SystemTime::now(), rps_limit, concurrent_limit)
            .await;
        let handled = AssertUnwindSafe(client.handle_rpc_request(&rq))
            .catch_unwind()
            .await;
        if let Err(panic) = handled {
            error!(
                "[{}] panic while handling `{}`: {}",
                client.remote_addr(),
                rq.method,
                panic_message(panic.as_ref())
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origins(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_whitelist_admits_anyone() {
        assert!(check_origin(&[], "http://evil.example"));
        assert!(check_origin(&[], ""));
    }

    #[test]
    fn test_origin_suffix_match() {
        let whitelist = origins(&["example.com", "trusted.net"]);
        assert!(check_origin(&whitelist, "http://app.example.com"));
        assert!(check_origin(&whitelist, "https://trusted.net"));
        assert!(!check_origin(&whitelist, "http://example.com.evil.org"));
        assert!(!check_origin(&whitelist, ""));
    }

    #[test]
    fn test_empty_suffixes_are_skipped() {
        // a trailing comma in the flag yields an empty entry, which must not
        // turn into a match-everything suffix
        let whitelist = origins(&["example.com", ""]);
        assert!(!check_origin(&whitelist, "http://elsewhere.org"));
        assert!(check_origin(&whitelist, "http://app.example.com"));
    }

    #[test]
    fn test_ping_interval_stays_under_read_deadline() {
        assert!(PING_INTERVAL < READ_DEADLINE);
    }
}

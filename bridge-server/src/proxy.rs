//! JSON-RPC to HTTP dispatch.
//!
//! One [`ProxyClient`] lives for the duration of a connection. Each call it
//! handles is translated into an upstream HTTP request; the upstream's
//! status, content type, timing, and body come back as one JSON-RPC response
//! written through the connection's sink. Many calls may be in flight at
//! once; responses hit the wire in completion order, serialized by the sink
//! lock.

use crate::sink::ResponseSink;
use crate::stats::StatCounter;
use crate::AppState;
use bridge_core::error::ProxyError;
use bridge_core::protocol::{
    shape_upstream_body, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
};
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde_json::value::to_raw_value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

/// Built-in method that rewrites the client's `X-Real-IP`.
pub const METHOD_SET_X_REAL_IP: &str = "httpsocket.setxrealip";

/// Per-connection dispatcher state.
pub struct ProxyClient {
    state: Arc<AppState>,
    /// Peer address of the originating connection, for logging.
    remote_addr: SocketAddr,
    /// Value forwarded as `X-Real-IP`; rewritable via the built-in method.
    /// Workers read it without ordering guarantees against the rewrite, so
    /// clients must await the rewrite's reply before depending on it.
    x_real_ip: Mutex<String>,
    /// Write sink; the lock serializes the JSON stream.
    sink: tokio::sync::Mutex<ResponseSink>,
    /// Set after the first failed write. The session is torn down by the
    /// read side, never from here.
    got_write_error: AtomicBool,
    /// Child of the process-wide counter.
    pub stats: Arc<StatCounter>,
}

impl ProxyClient {
    pub fn new(state: Arc<AppState>, remote_addr: SocketAddr, sink: ResponseSink) -> Self {
        let stats = StatCounter::child(&state.stats);
        Self {
            x_real_ip: Mutex::new(remote_addr.ip().to_string()),
            state,
            remote_addr,
            sink: tokio::sync::Mutex::new(sink),
            got_write_error: AtomicBool::new(false),
            stats,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn write_failed(&self) -> bool {
        self.got_write_error.load(Ordering::Relaxed)
    }

    /// Take the buffered payload out of a single-shot sink.
    pub async fn take_buffered(&self) -> Option<String> {
        match &mut *self.sink.lock().await {
            ResponseSink::Buffered(slot) => slot.take(),
            _ => None,
        }
    }

    /// Handle one JSON-RPC call end to end.
    pub async fn handle_rpc_request(&self, rq: &JsonRpcRequest) {
        if self.handle_special_method(rq).await {
            return;
        }

        let (verb, url) = match rq.method.split_once(' ') {
            Some((verb, url)) if !verb.is_empty() && !url.is_empty() => (verb, url),
            _ => {
                self.send_error(rq, &ProxyError::invalid_method("malformed method"))
                    .await;
                return;
            }
        };

        let method = match verb {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "PATCH" => Method::PATCH,
            "DELETE" => Method::DELETE,
            "HEAD" => Method::HEAD,
            "OPTIONS" => Method::OPTIONS,
            other => {
                let err = ProxyError::invalid_method(format!("unknown HTTP method {other}"));
                self.send_error(rq, &err).await;
                return;
            }
        };

        debug!("[{}] Request: {} {}", self.remote_addr, verb, url);

        let url = match self.resolve_url(url) {
            Ok(url) => url,
            Err(err) => {
                self.send_error(rq, &err).await;
                return;
            }
        };

        let mut builder = self.state.http.request(method.clone(), url.as_str());
        if method != Method::GET && method != Method::HEAD {
            if let Some((content_type, body)) = request_body(rq) {
                builder = builder.header(CONTENT_TYPE, content_type).body(body);
            }
        }
        builder = builder
            .header("X-Real-IP", self.x_real_ip())
            .header("X-Request-ID", self.make_x_request_id(&url));

        let http_rq = match builder.build() {
            Ok(http_rq) => http_rq,
            Err(e) => {
                self.send_error(rq, &ProxyError::internal(e.to_string())).await;
                return;
            }
        };

        let started = Instant::now();
        let fake_ms = self.state.config.fake_upstream_response_time_ms;
        let outcome = if fake_ms > 0 {
            tokio::time::sleep(Duration::from_millis(fake_ms)).await;
            Err(ProxyError::fake_upstream())
        } else {
            self.state
                .http
                .execute(http_rq)
                .await
                .map_err(|e| ProxyError::bad_gateway(e.to_string()))
        };
        let elapsed = started.elapsed().as_secs_f64();

        let upstream = match outcome {
            Ok(upstream) => upstream,
            Err(err) => {
                self.send_error_with_time(rq, &err, Some(elapsed)).await;
                return;
            }
        };

        if !rq.wants_reply() {
            return; // drop the upstream reply unread
        }

        let content_type = upstream
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut resp = JsonRpcResponse {
            id: rq.id.clone(),
            http_status: Some(upstream.status().as_u16()),
            http_content_type: if content_type.is_empty() {
                None
            } else {
                Some(content_type.clone())
            },
            upstream_response_time_seconds: Some(elapsed),
            ..Default::default()
        };

        let body = match upstream.bytes().await {
            Ok(body) => body,
            Err(e) => {
                let err = ProxyError::bad_gateway(format!("reading response: {e}"));
                self.send_error(rq, &err).await;
                return;
            }
        };

        shape_upstream_body(&mut resp, &content_type, &body);
        self.send(rq, &resp).await;
    }

    /// Handle a built-in method. Returns true when the request was consumed.
    async fn handle_special_method(&self, rq: &JsonRpcRequest) -> bool {
        match rq.method.as_str() {
            METHOD_SET_X_REAL_IP => {
                let parsed = rq
                    .params
                    .as_ref()
                    .map(|raw| serde_json::from_str::<String>(raw.get()));
                match parsed {
                    Some(Ok(ip)) => {
                        *self.x_real_ip.lock().unwrap() = ip;
                        self.send(rq, &rq.simple_response(&"ok")).await;
                    }
                    _ => {
                        self.send_error(rq, &ProxyError::bad_request("params must be a string"))
                            .await;
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Apply the default-host and whitelist rules to the URL part of the
    /// method string.
    fn resolve_url(&self, url: &str) -> Result<String, ProxyError> {
        let params = &self.state.params;
        if url.starts_with('/') {
            if params.default_host.is_empty() {
                return Err(ProxyError::invalid_method("must specify protocol://host"));
            }
            // the extra slash between host and path is load-bearing for some
            // upstreams; keep it
            return Ok(format!("http://{}/{}", params.default_host, url));
        }
        if !params.whitelisted_upstream_hosts.is_empty() {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| ProxyError::invalid_method(e.to_string()))?;
            let host = match (parsed.host_str(), parsed.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                (None, _) => String::new(),
            };
            if !params
                .whitelisted_upstream_hosts
                .iter()
                .any(|allowed| *allowed == host)
            {
                return Err(ProxyError::invalid_method("specified host not in whitelist"));
            }
        }
        Ok(url.to_string())
    }

    fn x_real_ip(&self) -> String {
        self.x_real_ip.lock().unwrap().clone()
    }

    /// `<unix-seconds>:<x-real-ip>::<url-without-query>:ws-proxy`
    fn make_x_request_id(&self, url: &str) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let url = url.split('?').next().unwrap_or(url);
        format!("{}:{}::{}:ws-proxy", now, self.x_real_ip(), url)
    }

    pub async fn send_error(&self, rq: &JsonRpcRequest, err: &ProxyError) {
        self.send_error_with_time(rq, err, None).await;
    }

    /// Report `err` back to the client, with the measured upstream time when
    /// one exists. The fake-upstream sentinel skips the warning log.
    pub async fn send_error_with_time(
        &self,
        rq: &JsonRpcRequest,
        err: &ProxyError,
        response_time: Option<f64>,
    ) {
        if !err.is_fake_upstream() {
            warn!(
                "[{}] send error for `{}`: {} {}",
                self.remote_addr,
                rq.method,
                err.jsonrpc_code(),
                err
            );
        }
        let error = to_raw_value(&JsonRpcError {
            code: err.jsonrpc_code(),
            message: err.to_string(),
        })
        .expect("error object always serializes");
        let resp = JsonRpcResponse {
            error: Some(error),
            upstream_response_time_seconds: response_time,
            id: rq.id.clone(),
            ..Default::default()
        };
        self.send(rq, &resp).await;
    }

    /// Write one response under the write lock. Requests without an id get
    /// no reply. Write failures set the sticky flag and are otherwise
    /// swallowed; the session ends when the read side fails.
    pub async fn send(&self, rq: &JsonRpcRequest, resp: &JsonRpcResponse) {
        if !rq.wants_reply() {
            return;
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.write_json(resp).await {
            self.got_write_error.store(true, Ordering::Relaxed);
            if self.state.config.log_client_io_errors {
                error!("[{}] write: {}", self.remote_addr, e);
            }
        }
    }

    /// Keep-alive ping through the same write lock as responses.
    pub async fn send_ping(&self) -> anyhow::Result<()> {
        self.sink.lock().await.send_ping().await
    }

    /// Close the sink so writes from still-running workers fail fast.
    pub async fn shutdown_sink(&self) -> anyhow::Result<()> {
        self.sink.lock().await.shutdown().await
    }
}

/// Upstream body and content type derived from `params`. A JSON string
/// becomes a form-urlencoded body holding the string's inner bytes, escapes
/// and all; any other JSON value is forwarded verbatim.
fn request_body(rq: &JsonRpcRequest) -> Option<(&'static str, Vec<u8>)> {
    let raw = rq.params.as_ref()?.get().as_bytes();
    if raw.is_empty() {
        return None;
    }
    if raw[0] == b'"' {
        let inner = &raw[1..raw.len() - 1];
        Some(("application/x-www-form-urlencoded", inner.to_vec()))
    } else {
        Some(("application/json", raw.to_vec()))
    }
}

/// Printable message from a worker panic payload.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyParams, ServerConfig};
    use clap::Parser;
    use serde_json::Value;

    fn test_state(params: ProxyParams) -> Arc<AppState> {
        let config = ServerConfig::parse_from(["bridge-server"]);
        Arc::new(AppState {
            config,
            params,
            http: reqwest::Client::new(),
            stats: StatCounter::root(),
            start_time: Instant::now(),
        })
    }

    fn test_client(params: ProxyParams) -> ProxyClient {
        ProxyClient::new(
            test_state(params),
            "127.0.0.1:40000".parse().unwrap(),
            ResponseSink::Buffered(None),
        )
    }

    fn parse(input: &str) -> JsonRpcRequest {
        serde_json::from_str(input).unwrap()
    }

    async fn dispatch(client: &ProxyClient, input: &str) -> Option<Value> {
        client.handle_rpc_request(&parse(input)).await;
        let payload = client.take_buffered().await?;
        Some(serde_json::from_str(&payload).unwrap())
    }

    fn error_of(resp: &Value) -> (i64, &str) {
        let err = &resp["error"];
        (err["code"].as_i64().unwrap(), err["message"].as_str().unwrap())
    }

    #[tokio::test]
    async fn test_malformed_method() {
        let client = test_client(ProxyParams::default());
        let resp = dispatch(&client, r#"{"method":"GETx","id":1}"#).await.unwrap();
        assert_eq!(error_of(&resp), (-32601, "malformed method"));
        assert_eq!(resp["id"], Value::from(1));
    }

    #[tokio::test]
    async fn test_unknown_http_method() {
        let client = test_client(ProxyParams::default());
        let resp = dispatch(&client, r#"{"method":"FROB /x","id":1}"#).await.unwrap();
        assert_eq!(error_of(&resp), (-32601, "unknown HTTP method FROB"));
    }

    #[tokio::test]
    async fn test_path_without_default_host() {
        let client = test_client(ProxyParams::default());
        let resp = dispatch(&client, r#"{"method":"GET /x","id":1}"#).await.unwrap();
        assert_eq!(error_of(&resp), (-32601, "must specify protocol://host"));
    }

    #[tokio::test]
    async fn test_host_not_in_whitelist() {
        let client = test_client(ProxyParams {
            whitelisted_upstream_hosts: vec!["example.com".into()],
            ..Default::default()
        });
        let resp = dispatch(&client, r#"{"method":"GET http://other.com/x","id":1}"#)
            .await
            .unwrap();
        assert_eq!(error_of(&resp), (-32601, "specified host not in whitelist"));
    }

    #[tokio::test]
    async fn test_whitelist_port_must_match_exactly() {
        let client = test_client(ProxyParams {
            whitelisted_upstream_hosts: vec!["example.com".into()],
            ..Default::default()
        });
        let resp = dispatch(&client, r#"{"method":"GET http://example.com:8080/x","id":1}"#)
            .await
            .unwrap();
        assert_eq!(error_of(&resp), (-32601, "specified host not in whitelist"));
    }

    #[tokio::test]
    async fn test_bad_url_surfaces_parser_message() {
        let client = test_client(ProxyParams {
            whitelisted_upstream_hosts: vec!["example.com".into()],
            ..Default::default()
        });
        let resp = dispatch(&client, r#"{"method":"GET ht!tp://x","id":1}"#).await.unwrap();
        assert_eq!(resp["error"]["code"], Value::from(-32601));
    }

    #[test]
    fn test_default_host_keeps_the_double_slash() {
        let client = test_client(ProxyParams {
            default_host: "example.com".into(),
            ..Default::default()
        });
        assert_eq!(
            client.resolve_url("/x").unwrap(),
            "http://example.com//x"
        );
    }

    #[test]
    fn test_absolute_url_passes_without_whitelist() {
        let client = test_client(ProxyParams::default());
        assert_eq!(
            client.resolve_url("http://anywhere.net/x").unwrap(),
            "http://anywhere.net/x"
        );
    }

    #[tokio::test]
    async fn test_set_x_real_ip() {
        let client = test_client(ProxyParams::default());
        let resp = dispatch(
            &client,
            r#"{"method":"httpsocket.setxrealip","params":"1.2.3.4","id":9}"#,
        )
        .await
        .unwrap();
        assert_eq!(resp["result"], Value::from("ok"));
        assert_eq!(resp["id"], Value::from(9));
        assert_eq!(client.x_real_ip(), "1.2.3.4");
    }

    #[tokio::test]
    async fn test_set_x_real_ip_rejects_non_string_params() {
        let client = test_client(ProxyParams::default());
        let resp = dispatch(
            &client,
            r#"{"method":"httpsocket.setxrealip","params":{"ip":"1.2.3.4"},"id":9}"#,
        )
        .await
        .unwrap();
        assert_eq!(error_of(&resp), (400, "params must be a string"));
        // the original peer IP is untouched
        assert_eq!(client.x_real_ip(), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_null_id_suppresses_the_reply() {
        let client = test_client(ProxyParams::default());
        assert!(dispatch(
            &client,
            r#"{"method":"httpsocket.setxrealip","params":"1.2.3.4","id":null}"#,
        )
        .await
        .is_none());
        // the side effect still happened
        assert_eq!(client.x_real_ip(), "1.2.3.4");
    }

    #[tokio::test]
    async fn test_null_id_suppresses_error_replies_too() {
        let client = test_client(ProxyParams::default());
        assert!(dispatch(&client, r#"{"method":"nonsense"}"#).await.is_none());
    }

    #[test]
    fn test_request_body_string_params_become_form_body() {
        let rq = parse(r#"{"method":"POST /x","params":"a=1&b=2","id":1}"#);
        let (content_type, body) = request_body(&rq).unwrap();
        assert_eq!(content_type, "application/x-www-form-urlencoded");
        assert_eq!(body, b"a=1&b=2");
    }

    #[test]
    fn test_request_body_string_params_keep_escapes_verbatim() {
        let rq = parse(r#"{"method":"POST /x","params":"a=1\nb","id":1}"#);
        let (_, body) = request_body(&rq).unwrap();
        // the JSON escape is not decoded; the inner bytes go out as-is
        assert_eq!(body, b"a=1\\nb");
    }

    #[test]
    fn test_request_body_json_params_forwarded_verbatim() {
        let rq = parse(r#"{"method":"POST /x","params":{"a": 1},"id":1}"#);
        let (content_type, body) = request_body(&rq).unwrap();
        assert_eq!(content_type, "application/json");
        assert_eq!(body, br#"{"a": 1}"#);
    }

    #[test]
    fn test_request_body_absent_params() {
        let rq = parse(r#"{"method":"POST /x","id":1}"#);
        assert!(request_body(&rq).is_none());
    }

    #[test]
    fn test_x_request_id_strips_the_query() {
        let client = test_client(ProxyParams::default());
        let id = client.make_x_request_id("http://example.com/x?a=1");
        assert!(id.ends_with("::http://example.com/x:ws-proxy"));
        assert!(id.contains(":127.0.0.1:"));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("boom"));
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}

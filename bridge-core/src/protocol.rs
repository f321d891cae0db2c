//! JSON-RPC envelopes for HTTP-over-WebSocket proxying.
//!
//! A request's `method` carries an HTTP verb and URL (`"GET /path"`), its
//! `params` the upstream body, and its `id` an opaque correlation key echoed
//! back in the response. How a response is filled depends on the upstream
//! reply:
//!
//! 1. JSON content type, body is an object with `result` or `error`: both
//!    fields are copied into the response verbatim.
//! 2. JSON content type, any other object: the whole body lands in `result`
//!    as one nested JSON value.
//! 3. Any other content type: the body bytes land in `result` as a JSON
//!    string.
//! 4. No upstream reply at all: `error` holds a `{"code", "message"}` object.

use serde::{Deserialize, Serialize};
use serde_json::value::{to_raw_value, RawValue};
use serde_json::Value;

/// One inbound JSON-RPC call.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    /// Either `"<VERB> <path-or-URL>"` or a built-in method name.
    #[serde(default)]
    pub method: String,
    /// Retained verbatim; interpreted when the upstream body is built.
    #[serde(default)]
    pub params: Option<Box<RawValue>>,
    /// Opaque correlation key. `null` or absent means no reply is expected.
    #[serde(default)]
    pub id: Value,
}

impl JsonRpcRequest {
    /// Whether this call expects a response frame at all.
    pub fn wants_reply(&self) -> bool {
        !self.id.is_null()
    }

    /// A success response carrying `value` as its result.
    pub fn simple_response<T: Serialize>(&self, value: &T) -> JsonRpcResponse {
        JsonRpcResponse {
            result: Some(to_raw_value(value).expect("result value serializes")),
            id: self.id.clone(),
            ..Default::default()
        }
    }
}

/// One outbound JSON-RPC response. Optional fields are omitted from the wire
/// when unset; `id` is always present.
#[derive(Debug, Default, Serialize)]
pub struct JsonRpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_response_time_seconds: Option<f64>,
    pub id: Value,
}

/// The error object placed in a response's `error` field.
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// The shape of an upstream body that already resembles JSON-RPC.
#[derive(Debug, Deserialize)]
pub struct JsonRpcLikeResponse {
    #[serde(default)]
    pub result: Option<Box<RawValue>>,
    #[serde(default)]
    pub error: Option<Box<RawValue>>,
}

/// Whether a Content-Type belongs to the JSON family.
pub fn is_json_content_type(content_type: &str) -> bool {
    content_type.starts_with("application/json") || content_type.starts_with("text/json")
}

/// Fill `result`/`error` from a fully buffered upstream body according to its
/// content type. Implements the four cases from the module docs.
pub fn shape_upstream_body(resp: &mut JsonRpcResponse, content_type: &str, body: &[u8]) {
    if is_json_content_type(content_type) {
        match serde_json::from_slice::<JsonRpcLikeResponse>(body) {
            Ok(like) if like.result.is_some() || like.error.is_some() => {
                resp.result = like.result;
                resp.error = like.error;
            }
            // a valid JSON object without result/error keys, or something
            // that is not an object at all: pass the body through as one
            // raw JSON value
            _ => resp.result = Some(raw_body(body)),
        }
    } else {
        resp.result = Some(string_body(body));
    }
}

fn raw_body(body: &[u8]) -> Box<RawValue> {
    match std::str::from_utf8(body)
        .ok()
        .and_then(|s| RawValue::from_string(s.to_owned()).ok())
    {
        Some(raw) => raw,
        // claimed to be JSON but does not parse as one value; fall back to
        // the string form so the frame on the wire stays valid JSON
        None => string_body(body),
    }
}

fn string_body(body: &[u8]) -> Box<RawValue> {
    to_raw_value(&String::from_utf8_lossy(body)).expect("a string always serializes")
}

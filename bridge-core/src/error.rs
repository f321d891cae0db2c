//! Proxy errors and their JSON-RPC error codes.

use thiserror::Error;

/// Invalid method string, unknown verb, or URL validation failure.
pub const ERR_CODE_INVALID_METHOD: i64 = -32601;
/// Internal error while constructing the upstream request.
pub const ERR_CODE_INTERNAL: i64 = -32603;
/// Upstream transport or body-read failure.
pub const ERR_CODE_BAD_GATEWAY: i64 = -502;
/// Bad parameters to a built-in method.
pub const ERR_CODE_BAD_REQUEST: i64 = 400;

/// What went wrong, independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad method string, unknown verb, or a URL that fails validation.
    InvalidMethod,
    /// Bad parameters to a built-in method.
    BadRequest,
    /// The upstream request could not be constructed.
    Internal,
    /// The upstream call or body read failed.
    BadGateway,
    /// Synthetic failure injected by fake-upstream mode. Call sites that
    /// suppress logging for it match on this kind, never on the message.
    FakeUpstream,
}

impl ErrorKind {
    /// The JSON-RPC error code sent on the wire.
    pub fn jsonrpc_code(self) -> i64 {
        match self {
            ErrorKind::InvalidMethod => ERR_CODE_INVALID_METHOD,
            ErrorKind::BadRequest => ERR_CODE_BAD_REQUEST,
            ErrorKind::Internal => ERR_CODE_INTERNAL,
            ErrorKind::BadGateway | ErrorKind::FakeUpstream => ERR_CODE_BAD_GATEWAY,
        }
    }
}

/// An error surfaced to the client as a JSON-RPC error object.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_method(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidMethod, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadGateway, message)
    }

    /// The sentinel reported instead of a real upstream reply when
    /// fake-upstream mode is active.
    pub fn fake_upstream() -> Self {
        Self::new(ErrorKind::FakeUpstream, "fake upstream response")
    }

    pub fn is_fake_upstream(&self) -> bool {
        self.kind == ErrorKind::FakeUpstream
    }

    pub fn jsonrpc_code(&self) -> i64 {
        self.kind.jsonrpc_code()
    }
}

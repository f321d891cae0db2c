//! Transport-independent protocol types for the wsbridge proxy.
//!
//! Defines the JSON-RPC envelopes carried over WebSocket (and over plain HTTP
//! for debugging), the rules for folding an upstream HTTP reply into a
//! response, and the error taxonomy surfaced to clients.

pub mod error;
pub mod protocol;

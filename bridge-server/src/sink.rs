//! Write sinks shared by the WebSocket and single-shot HTTP transports.
//!
//! Both transports expose the same capability: serialize one value as JSON
//! and hand it to the wire. The dispatcher never sees transport state beyond
//! this.

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde::Serialize;

pub enum ResponseSink {
    /// Outbound half of an upgraded socket; each value is one text frame.
    WebSocket(SplitSink<WebSocket, Message>),
    /// Single-use buffer backing the one-shot HTTP endpoint.
    Buffered(Option<String>),
}

impl ResponseSink {
    /// Serialize `value` and write it to the transport.
    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        match self {
            ResponseSink::WebSocket(sender) => Ok(sender.send(Message::Text(payload)).await?),
            ResponseSink::Buffered(slot) => {
                *slot = Some(payload);
                Ok(())
            }
        }
    }

    /// Send a keep-alive ping with an empty payload. A no-op for buffers.
    pub async fn send_ping(&mut self) -> Result<()> {
        match self {
            ResponseSink::WebSocket(sender) => Ok(sender.send(Message::Ping(Vec::new())).await?),
            ResponseSink::Buffered(_) => Ok(()),
        }
    }

    /// Close the underlying transport; writes after this fail.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            ResponseSink::WebSocket(sender) => Ok(sender.close().await?),
            ResponseSink::Buffered(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_buffered_sink_stores_one_payload() {
        let mut sink = ResponseSink::Buffered(None);
        sink.write_json(&json!({"id": 1})).await.unwrap();
        match sink {
            ResponseSink::Buffered(Some(payload)) => assert_eq!(payload, r#"{"id":1}"#),
            _ => panic!("payload not buffered"),
        }
    }

    #[tokio::test]
    async fn test_buffered_sink_ignores_pings() {
        let mut sink = ResponseSink::Buffered(None);
        sink.send_ping().await.unwrap();
        assert!(matches!(sink, ResponseSink::Buffered(None)));
    }
}

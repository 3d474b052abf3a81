//! WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing the split
//! [`FrameSink`] / [`FrameSource`] halves the core expects. Frames are
//! binary WebSocket messages; text frames are tolerated and read as
//! bytes. Ping/pong is handled below this layer.

use crate::transport::{Dialer, FrameSink, FrameSource, FramedPair};
use crate::TransportError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

/// Concrete WebSocket stream type.
type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Dialer for `ws://` and `wss://` broker endpoints
pub struct WsDialer {
    url: String,
}

impl WsDialer {
    /// Create a dialer for the given broker URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// The broker URL this dialer connects to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self) -> Result<FramedPair, TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(url = %self.url, "websocket connected");

        let (sink, source) = stream.split();
        Ok((
            Box::new(WsSink { sink }),
            Box::new(WsSource { stream: source }),
        ))
    }
}

struct WsSink {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.sink
            .send(tungstenite::Message::Binary(frame))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

struct WsSource {
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Binary(data))) => return Ok(data),
                Some(Ok(tungstenite::Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_))) => {
                    // Keepalive traffic, not a frame
                    continue;
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => {
                    return Err(TransportError::Closed);
                }
                Some(Ok(tungstenite::Message::Frame(_))) => continue,
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_unreachable_host_returns_error() {
        let dialer = WsDialer::new("ws://127.0.0.1:1/unreachable");
        assert!(dialer.dial().await.is_err());
    }

    #[test]
    fn dialer_keeps_url() {
        let dialer = WsDialer::new("ws://localhost:8776");
        assert_eq!(dialer.url(), "ws://localhost:8776");
    }
}

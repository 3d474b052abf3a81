//! Transport abstraction traits.
//!
//! A transport carries opaque byte messages with reliable, ordered,
//! message-at-a-time semantics. The two halves are split so a
//! connection can read from its supervisor task while writers send
//! concurrently.

use crate::TransportError;
use async_trait::async_trait;

/// Write half of a framed stream
#[async_trait]
pub trait FrameSink: Send {
    /// Send one opaque message.
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Flush and close the stream.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a framed stream
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next message.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] when the stream ends.
    async fn next(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// A connected stream, split into its two halves
pub type FramedPair = (Box<dyn FrameSink>, Box<dyn FrameSource>);

/// Factory for framed streams to one remote endpoint.
///
/// A connection holds its dialer for the lifetime of the link and
/// re-dials on every reconnect.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Establish a new stream to the endpoint.
    async fn dial(&self) -> Result<FramedPair, TransportError>;
}

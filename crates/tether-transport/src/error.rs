//! Transport error types.

use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dialing the remote endpoint failed
    #[error("connect failed: {0}")]
    Connect(String),

    /// The stream was closed by the peer or torn down locally
    #[error("transport closed")]
    Closed,

    /// Read or write failure on an established stream
    #[error("transport i/o error: {0}")]
    Io(String),
}

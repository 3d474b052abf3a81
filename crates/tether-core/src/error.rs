//! Error types for the Tether core protocol.
//!
//! The taxonomy separates what a malicious broker can cause (dropped
//! silently at the receive path, surfaced here only for logging) from
//! local failures (exhausted retries, exhausted reconnects, oversized
//! payloads) which are loud.

use tether_crypto::CryptoError;
use tether_transport::TransportError;
use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Frame parsing error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Header JSON encoding or decoding error
    #[error("header encoding error: {0}")]
    Header(#[from] serde_json::Error),

    /// Payload document encoding or decoding error
    #[error("payload codec error: {0}")]
    Codec(String),

    /// Broker handshake failure
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Broker did not answer the handshake in time
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A send was retried `MAX_SEND_RETRIES` times without an ack
    #[error("max send retries reached")]
    RetriesExhausted,

    /// The connection supervisor gave up reconnecting
    #[error("connection failed after {0} reconnect attempts")]
    ReconnectsExhausted(u32),

    /// Payload cannot be fragmented into at most 2^16 chunks
    #[error("payload of {0} bytes exceeds chunkable size")]
    PayloadTooLarge(usize),

    /// Compression flag byte is neither raw nor zlib
    #[error("unknown compression flag: 0x{0:02x}")]
    UnknownCompression(u8),

    /// Encoded token is malformed
    #[error("invalid token encoding: {0}")]
    InvalidToken(String),

    /// A route extension was requested on a chain that never reaches this session
    #[error("route does not traverse this session")]
    RouteNotExtendable,

    /// The session has no live connections to send through
    #[error("session has no connections")]
    NotConnected,

    /// The owning session was dropped while a channel or connection was in use
    #[error("session dropped")]
    SessionDropped,

    /// The channel inbox was torn down
    #[error("channel closed")]
    ChannelClosed,
}

/// Frame-level errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame too short to parse
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Declared region lengths exceed the received bytes
    #[error("declared lengths exceed frame size")]
    Truncated,

    /// Header JSON larger than the 2-byte length field allows
    #[error("header region exceeds 2-byte length")]
    HeaderOverflow,

    /// Payload region larger than the 3-byte length field allows
    #[error("payload region exceeds 3-byte length")]
    PayloadOverflow,

    /// An ack or resend frame without the 64-byte message id
    #[error("missing message id in payload region")]
    MissingMessageId,

    /// Chunk header shorter than `index || count || mid`
    #[error("chunk header too short")]
    ChunkHeader,
}

//! Connection configuration parameters.

use std::time::Duration;

/// Tunables for a broker connection and the channel send pipeline.
///
/// Defaults are the protocol's normative constants; tests shrink the
/// timeouts to keep fault-injection runs fast.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum encrypted chunk body per frame (bytes)
    pub max_payload_len: usize,
    /// Payloads below this length are zlib-compressed
    pub max_compression_len: usize,
    /// Suggested in-flight frames per connection during a channel send
    pub suggested_max_outbox: usize,
    /// How long to wait for an ack before resending
    pub resend_timeout: Duration,
    /// Transmission attempts per frame before the send fails
    pub max_send_retries: u32,
    /// Bound on each handshake recv
    pub handshake_timeout: Duration,
    /// Pause between reconnect attempts
    pub reconnect_backoff: Duration,
    /// Consecutive failed reconnects before the connection is declared dead
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_payload_len: crate::MAX_PAYLOAD_LEN,
            max_compression_len: crate::MAX_COMPRESSION_LEN,
            suggested_max_outbox: crate::SUGGESTED_MAX_OUTBOX,
            resend_timeout: Duration::from_secs(2),
            max_send_retries: 3,
            handshake_timeout: Duration::from_secs(15),
            reconnect_backoff: Duration::from_secs(1),
            max_reconnect_attempts: 11,
        }
    }
}

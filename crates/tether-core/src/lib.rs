//! # Tether Core
//!
//! Client-side core of the Tether transport: capability-secured,
//! end-to-end encrypted messaging between peer sessions over untrusted
//! relay brokers.
//!
//! This crate provides:
//! - **Wire framing**: signed, timestamped frames with JSON header pairs
//! - **Broker handshake**: challenge signing, clock-offset capture,
//!   state replay on reconnect
//! - **Send/ack/retry state machine**: insertion-ordered awaiting-ack
//!   queue with head-of-line pacing and bounded resends
//! - **Capability delegation**: signed token chains with bounded depth,
//!   verified offline by the owning session
//! - **Channel pipeline**: CBOR documents, zlib compression, chunking
//!   and per-chunk AEAD between channel key pairs
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                      Session                          │
//! │  identity, channel registry, token ledger, replay     │
//! ├───────────────────────────┬───────────────────────────┤
//! │         Channel           │        Connection         │
//! │  inbox, chunk pipeline,   │  handshake, ack pacing,   │
//! │  token-chain validation   │  resend, reconnect        │
//! ├───────────────────────────┴───────────────────────────┤
//! │                  Frames (tether-transport)            │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! The broker itself is out of scope: an untrusted store-and-forward
//! relay that sees routes and timestamps but never plaintext payloads.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
mod event;
pub mod frame;
pub mod header;
pub mod replay;
pub mod route;
pub mod session;
pub mod token;

pub use channel::Channel;
pub use codec::Document;
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use error::{Error, FrameError};
pub use frame::{Frame, FrameBuilder, FrameDisposition};
pub use header::{Header, ListenAnnounce};
pub use replay::ReplayGuard;
pub use route::{BrokerId, ChannelId, Route, SessionId};
pub use session::Session;
pub use token::{Token, TokenKind, TokenTarget};

/// Maximum encrypted chunk body per frame (bytes)
pub const MAX_PAYLOAD_LEN: usize = 1 << 19;

/// Payloads below this length are zlib-compressed
pub const MAX_COMPRESSION_LEN: usize = 1 << 19;

/// Suggested in-flight frames per connection during a channel send
pub const SUGGESTED_MAX_OUTBOX: usize = 16;

/// Seconds in the local clock's epoch representation.
pub(crate) fn unix_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// First characters of a serial, for log lines. Ids arriving off the
/// wire are attacker-controlled and need not be ASCII, so truncate on a
/// char boundary rather than a byte offset.
pub(crate) fn short_id(id: &str) -> &str {
    id.char_indices().nth(4).map_or(id, |(index, _)| &id[..index])
}

#[cfg(test)]
mod tests {
    use super::short_id;

    #[test]
    fn short_id_truncates_serials() {
        assert_eq!(short_id("AbCdEfGh"), "AbCd");
        assert_eq!(short_id("AbCd"), "AbCd");
        assert_eq!(short_id("Ab"), "Ab");
        assert_eq!(short_id(""), "");
    }

    #[test]
    fn short_id_respects_char_boundaries() {
        // Byte 4 falls inside the two-byte scalar; must not panic
        assert_eq!(short_id("aaaé"), "aaaé");
        assert_eq!(short_id("aaaéxyz"), "aaaé");
        assert_eq!(short_id("ééééé"), "éééé");
    }
}

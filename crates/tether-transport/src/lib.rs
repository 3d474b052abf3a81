//! # Tether Transport
//!
//! Reliable framed bidirectional byte streams for the Tether core.
//!
//! The core never touches a socket directly; it speaks to a
//! [`Dialer`] which produces split [`FrameSink`] / [`FrameSource`]
//! halves of an opaque-message stream. The default production
//! transport is a WebSocket client ([`websocket::WsDialer`]); an
//! in-process duplex ([`memory`]) backs unit and integration tests.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod memory;
pub mod transport;
pub mod websocket;

pub use error::TransportError;
pub use transport::{Dialer, FrameSink, FrameSource, FramedPair};

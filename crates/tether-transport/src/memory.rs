//! In-process duplex transport.
//!
//! Two unbounded channels glued back to back. Used by the test broker
//! fixture and by unit tests that need a transport without sockets.

use crate::transport::{Dialer, FrameSink, FrameSource, FramedPair};
use crate::TransportError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Create a connected duplex link, returning both endpoints.
#[must_use]
pub fn pair() -> (FramedPair, FramedPair) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let left: FramedPair = (
        Box::new(MemorySink { tx: Some(a_tx) }),
        Box::new(MemorySource { rx: b_rx }),
    );
    let right: FramedPair = (
        Box::new(MemorySink { tx: Some(b_tx) }),
        Box::new(MemorySource { rx: a_rx }),
    );
    (left, right)
}

/// Dialer that hands the far endpoint of every new link to an acceptor.
///
/// The acceptor side plays the broker: each `dial` produces a fresh
/// duplex link whose far half is queued on the acceptor channel.
pub struct MemoryDialer {
    acceptor: mpsc::UnboundedSender<FramedPair>,
}

impl MemoryDialer {
    /// Create a dialer feeding an existing acceptor, so several dialers
    /// can target the same broker.
    #[must_use]
    pub fn new(acceptor: mpsc::UnboundedSender<FramedPair>) -> Self {
        Self { acceptor }
    }

    /// Create a dialer/acceptor pair.
    #[must_use]
    pub fn acceptor() -> (Self, mpsc::UnboundedReceiver<FramedPair>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { acceptor: tx }, rx)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> Result<FramedPair, TransportError> {
        let (near, far) = pair();
        self.acceptor
            .send(far)
            .map_err(|_| TransportError::Connect("acceptor dropped".into()))?;
        Ok(near)
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next(&mut self) -> Result<Vec<u8>, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

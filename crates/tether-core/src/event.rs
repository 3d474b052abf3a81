//! Set/clear/wait event signal.
//!
//! The ack queue and connection state machines suspend on level-triggered
//! flags: a waiter passes as long as the flag is set, not only on an
//! edge. Built on `tokio::sync::watch` so clones observe the same flag.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub(crate) struct Event {
    tx: Arc<watch::Sender<bool>>,
}

impl Event {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn set(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the flag is set. Returns immediately if already set.
    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for cannot fail
        let _ = rx.wait_for(|set| *set).await;
    }
}

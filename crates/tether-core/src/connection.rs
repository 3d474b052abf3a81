//! One broker link: handshake, framed send/receive, ack pacing and
//! reconnect supervision.
//!
//! A connection owns a single supervisor task that dials, handshakes,
//! and reads frames until the transport fails, then backs off and
//! retries up to a bounded number of consecutive failures. Outbound
//! sends run as short tasks against the shared write half; the
//! insertion-ordered awaiting-ack queue gates retries so the head of
//! line drives resend pacing.

use crate::config::ConnectionConfig;
use crate::error::Error;
use crate::event::Event;
use crate::frame::{Frame, FrameBuilder, FrameDisposition, RETRY_ACK};
use crate::header::Header;
use crate::route::{BrokerId, SessionId};
use crate::session::Session;
use crate::unix_now;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tether_crypto::SIGNATURE_SIZE;
use tether_crypto::random::random_32;
use tether_crypto::signatures::{Signature, VerifyingKey};
use tether_transport::{Dialer, FrameSink, FrameSource};
use tokio::sync::Notify;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// No usable transport; a reconnect cycle is pending or running
    Down,
    /// Handshake complete, traffic flowing
    Up,
    /// Supervisor gave up; the connection is dead
    Failed,
}

type MessageId = [u8; SIGNATURE_SIZE];

/// One live broker link owned by a [`Session`].
pub struct Connection {
    session: Weak<Session>,
    dialer: Box<dyn Dialer>,
    config: ConnectionConfig,
    status: watch::Sender<Status>,
    t_offset: AtomicI64,
    broker_id: Mutex<Option<BrokerId>>,
    writer: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    awaiting_ack: Mutex<AckQueue>,
    restart: Notify,
    restart_epoch: AtomicU64,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Create a connection, register it with the session, and spawn its
    /// supervisor. Must be called inside a tokio runtime.
    ///
    /// The returned handle is live immediately; await [`Connection::ready`]
    /// before relying on the broker id or clock offset.
    pub fn connect(session: &Arc<Session>, dialer: Box<dyn Dialer>) -> Arc<Self> {
        let (status, _) = watch::channel(Status::Down);
        let connection = Arc::new(Self {
            session: Arc::downgrade(session),
            dialer,
            config: session.config().clone(),
            status,
            t_offset: AtomicI64::new(0),
            broker_id: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            awaiting_ack: Mutex::new(AckQueue::new()),
            restart: Notify::new(),
            restart_epoch: AtomicU64::new(0),
            supervisor: Mutex::new(None),
        });
        session.register_connection(connection.clone());

        let handle = tokio::spawn(connection.clone().run());
        *connection
            .supervisor
            .lock()
            .expect("supervisor lock poisoned") = Some(handle);
        connection
    }

    /// Wait for the current handshake to complete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReconnectsExhausted`] if the supervisor has
    /// already given up.
    pub async fn ready(&self) -> Result<(), Error> {
        self.wait_connected().await
    }

    /// Broker identity learned from the last completed handshake.
    #[must_use]
    pub fn broker_id(&self) -> Option<BrokerId> {
        self.broker_id
            .lock()
            .expect("broker id lock poisoned")
            .clone()
    }

    /// Broker-minus-local clock offset in seconds.
    #[must_use]
    pub fn t_offset(&self) -> i64 {
        self.t_offset.load(Ordering::Relaxed)
    }

    /// Tear down the current transport and block until the next
    /// handshake completes. Idempotent under concurrent callers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReconnectsExhausted`] if the supervisor gives up.
    pub async fn reconnect(&self) -> Result<(), Error> {
        if *self.status.borrow() == Status::Up {
            self.restart_epoch.fetch_add(1, Ordering::SeqCst);
            self.status.send_replace(Status::Down);
            *self.writer.lock().await = None;
            self.restart.notify_one();
        }
        self.wait_connected().await
    }

    /// Stop the supervisor and drop the transport.
    pub async fn close(&self) {
        self.status.send_replace(Status::Failed);
        if let Some(handle) = self
            .supervisor
            .lock()
            .expect("supervisor lock poisoned")
            .take()
        {
            handle.abort();
        }
        *self.writer.lock().await = None;
    }

    /// Purge every awaiting-ack entry recorded under `bundle_id`.
    pub(crate) fn clear(&self, bundle_id: [u8; 4]) {
        self.awaiting_ack
            .lock()
            .expect("ack queue lock poisoned")
            .clear_bundle(bundle_id);
    }

    fn session(&self) -> Result<Arc<Session>, Error> {
        self.session.upgrade().ok_or(Error::SessionDropped)
    }

    fn frame_timestamp(&self) -> u32 {
        let t = unix_now() - self.t_offset.load(Ordering::Relaxed) - 4;
        u32::try_from(t).unwrap_or(0)
    }

    async fn wait_connected(&self) -> Result<(), Error> {
        let mut rx = self.status.subscribe();
        let status = *rx
            .wait_for(|status| *status != Status::Down)
            .await
            .map_err(|_| Error::SessionDropped)?;
        match status {
            Status::Up => Ok(()),
            _ => Err(Error::ReconnectsExhausted(self.config.max_reconnect_attempts)),
        }
    }

    /// Encode, transmit and (for `send` headers) await the ack of one
    /// framed message, retrying with the original message id up to
    /// `max_send_retries` attempts.
    ///
    /// `ack_message_id` turns the frame into an ack for that signature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetriesExhausted`] when every attempt times out,
    /// [`Error::ReconnectsExhausted`] when the link is dead, or the
    /// first transport error for frames that expect no ack.
    pub(crate) async fn send(
        &self,
        headers: &[Header],
        payload: &[u8],
        bundle_id: Option<[u8; 4]>,
        ack_message_id: Option<MessageId>,
    ) -> Result<(), Error> {
        let session = self.session()?;
        for header in headers {
            if let Header::Send { destination, .. } = header {
                tracing::debug!(
                    session = crate::short_id(session.id()),
                    destination = crate::short_id(&destination.session),
                    payload_len = payload.len(),
                    is_ack = ack_message_id.is_some(),
                    "send"
                );
            }
        }

        let retry = if ack_message_id.is_some() { RETRY_ACK } else { 0 };
        let (signature, mut wire) = FrameBuilder::new()
            .headers(headers)
            .payload(payload)
            .retry(retry)
            .message_id(ack_message_id)
            .sign(session.signing_key(), self.frame_timestamp())?;
        let message_id = *signature.as_bytes();

        let expect_ack = ack_message_id.is_none()
            && headers
                .iter()
                .any(|header| matches!(header, Header::Send { .. }));
        let slot = if expect_ack {
            let destination = headers
                .iter()
                .find_map(|header| match header {
                    Header::Send { destination, .. } => Some(destination.session.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            Some(
                self.awaiting_ack
                    .lock()
                    .expect("ack queue lock poisoned")
                    .insert(message_id, destination, bundle_id),
            )
        } else {
            None
        };

        for attempt in 0..self.config.max_send_retries {
            match self.transmit(&wire).await {
                Ok(()) => {
                    let Some(slot) = &slot else {
                        return Ok(());
                    };
                    if self.expect_ack(&message_id, slot).await {
                        return Ok(());
                    }
                }
                Err(error @ Error::ReconnectsExhausted(_)) => {
                    self.fail_send(&message_id, bundle_id);
                    return Err(error);
                }
                Err(error) => {
                    if slot.is_none() {
                        return Err(error);
                    }
                    tracing::warn!(error = %error, "transmit failed, retrying");
                }
            }

            if attempt + 1 < self.config.max_send_retries {
                let retry_byte = u8::try_from(attempt + 1).unwrap_or(254).min(254);
                let (_, resend) = FrameBuilder::new()
                    .headers(headers)
                    .payload(payload)
                    .retry(retry_byte)
                    .message_id(Some(message_id))
                    .sign(session.signing_key(), self.frame_timestamp())?;
                wire = resend;
            }
        }

        self.fail_send(&message_id, bundle_id);
        Err(Error::RetriesExhausted)
    }

    /// Write one frame, waiting out reconnects when the transport is down.
    async fn transmit(&self, wire: &[u8]) -> Result<(), Error> {
        loop {
            if *self.status.borrow() == Status::Failed {
                return Err(Error::ReconnectsExhausted(self.config.max_reconnect_attempts));
            }
            {
                let mut guard = self.writer.lock().await;
                if let Some(sink) = guard.as_mut() {
                    return match sink.send(wire.to_vec()).await {
                        Ok(()) => Ok(()),
                        Err(error) => {
                            *guard = None;
                            Err(error.into())
                        }
                    };
                }
            }
            if *self.status.borrow() == Status::Up {
                self.reconnect().await?;
            } else {
                self.wait_connected().await?;
            }
        }
    }

    /// Wait for the head-of-line slot, then for this message's ack.
    /// Returns true once the entry has left the queue.
    async fn expect_ack(&self, message_id: &MessageId, slot: &Event) -> bool {
        slot.wait().await;
        if !self.contains_entry(message_id) {
            return true;
        }
        slot.clear();
        if timeout(self.config.resend_timeout, slot.wait()).await.is_err() {
            slot.set();
        }
        !self.contains_entry(message_id)
    }

    fn contains_entry(&self, message_id: &MessageId) -> bool {
        self.awaiting_ack
            .lock()
            .expect("ack queue lock poisoned")
            .contains(message_id)
    }

    fn fail_send(&self, message_id: &MessageId, bundle_id: Option<[u8; 4]>) {
        let mut queue = self.awaiting_ack.lock().expect("ack queue lock poisoned");
        queue.remove(message_id);
        if let Some(bundle) = bundle_id {
            queue.clear_bundle(bundle);
        }
    }

    fn ack(&self, source_id: &str, message_id: &MessageId) {
        let acked = self
            .awaiting_ack
            .lock()
            .expect("ack queue lock poisoned")
            .ack(message_id, source_id);
        if acked {
            tracing::trace!("ack accepted");
        } else {
            tracing::debug!("spurious ack dropped");
        }
    }

    /// Supervisor: dial, handshake, read frames; back off and retry on
    /// failure, up to `max_reconnect_attempts` consecutive failures.
    async fn run(self: Arc<Self>) {
        let mut consecutive = 0u32;
        loop {
            let mut clean_restart = false;
            match self.establish().await {
                Ok(mut source) => {
                    self.status.send_replace(Status::Up);
                    let epoch = self.restart_epoch.load(Ordering::SeqCst);
                    loop {
                        if self.restart_epoch.load(Ordering::SeqCst) != epoch {
                            clean_restart = true;
                            break;
                        }
                        tokio::select! {
                            _ = self.restart.notified() => {}
                            frame = source.next() => match frame {
                                Ok(raw) => {
                                    consecutive = 0;
                                    if let Err(error) = self.handle_frame(&raw).await {
                                        if matches!(error, Error::SessionDropped) {
                                            return;
                                        }
                                        tracing::debug!(error = %error, "frame dropped");
                                    }
                                }
                                Err(error) => {
                                    tracing::warn!(error = %error, "transport lost");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(Error::SessionDropped) => {
                    tracing::debug!("session dropped, supervisor exiting");
                    return;
                }
                Err(error) => {
                    tracing::warn!(error = %error, "broker connect failed");
                }
            }

            self.status.send_replace(Status::Down);
            *self.writer.lock().await = None;
            if clean_restart {
                continue;
            }

            tokio::time::sleep(self.config.reconnect_backoff).await;
            consecutive += 1;
            if consecutive >= self.config.max_reconnect_attempts {
                tracing::error!(
                    attempts = consecutive,
                    "max reconnect attempts reached, connection failed"
                );
                self.status.send_replace(Status::Failed);
                return;
            }
        }
    }

    /// Dial and run the client side of the broker handshake, then
    /// replay session state (issued tokens, channel listens).
    async fn establish(&self) -> Result<Box<dyn FrameSource>, Error> {
        *self.writer.lock().await = None;

        let (mut sink, mut source) = self.dialer.dial().await?;

        let challenge = timeout(self.config.handshake_timeout, source.next())
            .await
            .map_err(|_| Error::HandshakeTimeout)??;
        if challenge.len() < 4 {
            return Err(Error::Handshake("short challenge".into()));
        }
        let t_broker = u32::from_be_bytes(
            challenge[challenge.len() - 4..]
                .try_into()
                .map_err(|_| Error::Handshake("short challenge".into()))?,
        );
        self.t_offset
            .store(unix_now() - i64::from(t_broker), Ordering::Relaxed);

        let session = self.session()?;
        let signature = session.signing_key().sign(&challenge);
        let client_nonce = random_32()?;
        let mut reply = Vec::with_capacity(SIGNATURE_SIZE + 32 + 32);
        reply.extend_from_slice(signature.as_bytes());
        reply.extend_from_slice(&session.signing_key().verifying_key().to_bytes());
        reply.extend_from_slice(&client_nonce);
        sink.send(reply).await?;

        let broker_reply = timeout(self.config.handshake_timeout, source.next())
            .await
            .map_err(|_| Error::HandshakeTimeout)??;
        if broker_reply.len() < SIGNATURE_SIZE + 32 {
            return Err(Error::Handshake("short broker reply".into()));
        }
        let broker_signature = Signature::from_slice(&broker_reply[..SIGNATURE_SIZE])?;
        let broker_key_bytes: [u8; 32] = broker_reply[SIGNATURE_SIZE..SIGNATURE_SIZE + 32]
            .try_into()
            .map_err(|_| Error::Handshake("short broker reply".into()))?;
        let broker_key = VerifyingKey::from_bytes(&broker_key_bytes)?;
        broker_key.verify(&client_nonce, &broker_signature)?;

        let broker_id = broker_key.to_serial();
        tracing::debug!(
            session = crate::short_id(session.id()),
            broker = crate::short_id(&broker_id),
            "handshake complete"
        );
        *self
            .broker_id
            .lock()
            .expect("broker id lock poisoned") = Some(broker_id);
        *self.writer.lock().await = Some(sink);

        // Replay session state so brokers rebuild routing and token
        // knowledge on every reconnect
        let mut headers = Vec::new();
        for issued in session.issued_snapshot() {
            headers.push(Header::TokenIssue {
                token: issued.token.encode(),
                prev: issued.prev.as_ref().map(crate::token::Token::encode),
            });
        }
        for entry in session.channels.iter() {
            headers.push(Header::Listen(entry.value().listen_announce()));
        }
        self.send(&headers, b"", None, None).await?;

        Ok(source)
    }

    /// Verify, deduplicate and dispatch one received frame.
    ///
    /// Frames a malicious broker could forge are dropped here; the error
    /// is only surfaced for logging.
    async fn handle_frame(&self, raw: &[u8]) -> Result<(), Error> {
        let session = self.session()?;
        let frame = Frame::parse(raw)?;

        let signature = frame.signature();
        let timestamp = i64::from(frame.timestamp()) + self.t_offset.load(Ordering::Relaxed);
        if !session.check_no_repeat(signature, timestamp) {
            tracing::debug!("replayed or stale frame dropped");
            return Ok(());
        }

        for header in frame.headers()? {
            let Header::Send {
                source,
                destination,
            } = header
            else {
                continue;
            };

            let source_key = VerifyingKey::from_serial(&source.session)?;
            source_key.verify(frame.signed_region(), &Signature::from_bytes(signature))?;

            let Some(channel) = session.channel(&destination.channel) else {
                tracing::debug!(
                    channel = crate::short_id(&destination.channel),
                    "frame for unknown channel dropped"
                );
                continue;
            };
            tracing::debug!(
                session = crate::short_id(session.id()),
                source = crate::short_id(&source.session),
                payload_len = frame.body().len(),
                "received"
            );

            if frame.disposition() == FrameDisposition::Ack {
                self.ack(&source.session, &frame.ack_key());
                continue;
            }

            // Authorize before acking: a frame that fails the token
            // chain must never be acknowledged
            if !channel.validate_token_chain(&source.session, &destination.tokens) {
                tracing::debug!(
                    source = crate::short_id(&source.session),
                    "unauthorized frame dropped"
                );
                continue;
            }

            let reply = vec![Header::Send {
                source: destination.clone(),
                destination: source.clone(),
            }];
            self.send(&reply, b"", None, Some(frame.ack_key())).await?;

            channel.handle_message(&source, frame.body())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("status", &*self.status.borrow())
            .field("broker_id", &self.broker_id().map(|id| crate::short_id(&id).to_string()))
            .finish_non_exhaustive()
    }
}

/// Insertion-ordered awaiting-ack map.
///
/// Keys are original message signatures; the head entry's slot gates
/// resend pacing for everything behind it.
pub(crate) struct AckQueue {
    entries: Vec<AckEntry>,
}

struct AckEntry {
    message_id: MessageId,
    destination: SessionId,
    bundle_id: Option<[u8; 4]>,
    slot: Event,
}

impl AckQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert an entry; the slot starts released only for the head.
    pub(crate) fn insert(
        &mut self,
        message_id: MessageId,
        destination: SessionId,
        bundle_id: Option<[u8; 4]>,
    ) -> Event {
        let slot = Event::new();
        if self.entries.is_empty() {
            slot.set();
        }
        self.entries.push(AckEntry {
            message_id,
            destination,
            bundle_id,
            slot: slot.clone(),
        });
        slot
    }

    pub(crate) fn contains(&self, message_id: &MessageId) -> bool {
        self.entries
            .iter()
            .any(|entry| &entry.message_id == message_id)
    }

    /// Apply an ack from `source_id`. The recorded destination must
    /// match, otherwise the ack is spurious and ignored. Releases the
    /// acked slot and the new head's slot.
    pub(crate) fn ack(&mut self, message_id: &MessageId, source_id: &str) -> bool {
        let Some(position) = self
            .entries
            .iter()
            .position(|entry| &entry.message_id == message_id)
        else {
            return false;
        };
        if self.entries[position].destination != source_id {
            return false;
        }

        let entry = self.entries.remove(position);
        entry.slot.set();
        if let Some(head) = self.entries.first() {
            head.slot.set();
        }
        true
    }

    /// Drop an entry without an ack (exhausted retries).
    pub(crate) fn remove(&mut self, message_id: &MessageId) {
        self.entries.retain(|entry| &entry.message_id != message_id);
        if let Some(head) = self.entries.first() {
            head.slot.set();
        }
    }

    /// Purge every entry recorded under `bundle_id`, then release the
    /// surviving head so later sends cannot stall on a purged slot.
    pub(crate) fn clear_bundle(&mut self, bundle_id: [u8; 4]) {
        self.entries
            .retain(|entry| entry.bundle_id != Some(bundle_id));
        if let Some(head) = self.entries.first() {
            head.slot.set();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

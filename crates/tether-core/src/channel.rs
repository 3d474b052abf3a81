//! Channel: a per-endpoint key pair, inbox and payload pipeline.
//!
//! Outbound: encode the application document, compress, fragment,
//! encrypt each chunk under the channel-pair shared key, then fan the
//! chunks across every live connection with bounded parallelism. The
//! first frame of a send piggybacks any buffered control headers (the
//! freshly issued reply token, the listen declaration).
//!
//! Inbound: frames arrive already signature-verified and authorized;
//! chunks are decrypted, reassembled in any arrival order and decoded
//! into the FIFO inbox.

use crate::codec::{self, Document};
use crate::error::Error;
use crate::header::{Header, ListenAnnounce};
use crate::route::{ChannelId, Route};
use crate::session::Session;
use crate::token::Token;
use futures_util::TryStreamExt;
use futures_util::stream;
use rand_core::OsRng;
use std::sync::{Arc, Mutex, Weak};
use tether_crypto::exchange::{PrivateKey, PublicKey};
use tether_crypto::random::random_4;
use tether_crypto::shared::SharedKey;
use tokio::sync::mpsc;

/// A logical endpoint owned by one session.
pub struct Channel {
    session: Weak<Session>,
    channel_key: PrivateKey,
    id: ChannelId,
    is_public: bool,
    route: Mutex<Route>,
    header_buffer: Mutex<Vec<Header>>,
    reassembly: Mutex<codec::Reassembly>,
    inbox_tx: mpsc::UnboundedSender<(Route, Document)>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Route, Document)>>,
}

impl Channel {
    /// Create a channel with a fresh key pair and register it with the
    /// session. `is_public` bypasses token checks on receive.
    #[must_use]
    pub fn new(session: &Arc<Session>, is_public: bool) -> Arc<Self> {
        Self::with_key(session, PrivateKey::generate(&mut OsRng), is_public)
    }

    /// Create a channel from a persisted key.
    #[must_use]
    pub fn with_key(session: &Arc<Session>, channel_key: PrivateKey, is_public: bool) -> Arc<Self> {
        let id = channel_key.public_key().to_serial();
        let route = Route::new(session.broker_ids(), session.id().clone(), id.clone());
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let channel = Arc::new(Self {
            session: Arc::downgrade(session),
            channel_key,
            id,
            is_public,
            route: Mutex::new(route),
            header_buffer: Mutex::new(Vec::new()),
            reassembly: Mutex::new(codec::Reassembly::new()),
            inbox_tx,
            inbox: tokio::sync::Mutex::new(inbox_rx),
        });
        session
            .channels
            .insert(channel.id.clone(), channel.clone());
        channel
    }

    /// Channel public id.
    #[must_use]
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Whether token checks are bypassed.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.is_public
    }

    /// The channel's self-describing route.
    #[must_use]
    pub fn route(&self) -> Route {
        self.route.lock().expect("route lock poisoned").clone()
    }

    pub(crate) fn listen_announce(&self) -> ListenAnnounce {
        let route = self.route();
        ListenAnnounce {
            brokers: route.brokers,
            session: route.session,
            channel: route.channel,
            is_public: self.is_public,
        }
    }

    /// Buffer a listen declaration for the next flush or send.
    pub fn listen(&self) -> &Self {
        let announce = self.listen_announce();
        self.header_buffer
            .lock()
            .expect("header buffer lock poisoned")
            .push(Header::Listen(announce));
        self
    }

    /// Buffer a close declaration, deregister from the session, and
    /// flush any pending headers to the brokers.
    ///
    /// # Errors
    ///
    /// Propagates send failures; a session without connections closes
    /// locally without error.
    pub async fn close(&self) -> Result<(), Error> {
        let route = self.route();
        self.header_buffer
            .lock()
            .expect("header buffer lock poisoned")
            .push(Header::Close(route));
        if let Ok(session) = self.session() {
            session.channels.remove(&self.id);
        }
        match self.flush().await {
            Err(Error::NotConnected) => Ok(()),
            other => other,
        }
    }

    /// Flush buffered control headers as one framed message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without connections, or the
    /// first connection failure.
    pub async fn flush(&self) -> Result<(), Error> {
        self.execute(None, Vec::new(), None).await
    }

    /// Receive the next decoded message, FIFO.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the inbox is torn down.
    pub async fn recv(&self) -> Result<(Route, Document), Error> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ChannelClosed)
    }

    /// Encode, compress, fragment, encrypt and dispatch one application
    /// object to `destination`, extending the reply route toward the
    /// destination session on the way out.
    ///
    /// At-least-once: every chunk is retried by the connection layer;
    /// cancellation or failure purges the bundle from all connections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without live connections,
    /// [`Error::PayloadTooLarge`] past the chunk-count limit, and
    /// propagates codec, crypto and send failures.
    pub async fn send<T: serde::Serialize + ?Sized>(
        &self,
        destination: &Route,
        payload: &T,
    ) -> Result<(), Error> {
        let session = self.session()?;
        let connections = session.connection_count();
        if connections == 0 {
            return Err(Error::NotConnected);
        }
        let config = session.config().clone();

        // Grant the destination a reply capability and re-announce the
        // channel; both piggyback on this send's first frame
        let mut source_route = self.route();
        let token_header =
            session.extend_route(&mut source_route, destination.session.clone(), None)?;
        self.header_buffer
            .lock()
            .expect("header buffer lock poisoned")
            .push(token_header);
        self.listen();

        let encoded = codec::encode_document(payload)?;
        let flagged = codec::compress(&encoded, config.max_compression_len)?;
        let mid = random_4()?;
        let chunks = codec::split_chunks(&flagged, config.max_payload_len, mid)?;

        let shared = SharedKey::new(
            &self.channel_key,
            &PublicKey::from_serial(&destination.channel)?,
        )?;
        let limit = chunks.len().min(config.suggested_max_outbox * connections);
        let send_header = Header::Send {
            source: source_route,
            destination: destination.clone(),
        };
        tracing::debug!(
            channel = crate::short_id(&self.id),
            destination = crate::short_id(&destination.channel),
            chunks = chunks.len(),
            "channel send"
        );

        let guard = ClearOnDrop {
            session: session.clone(),
            mid,
            armed: true,
        };
        stream::iter(chunks.into_iter().map(Ok::<_, Error>))
            .try_for_each_concurrent(limit, |chunk| {
                let header = send_header.clone();
                let shared = &shared;
                async move {
                    let sealed = shared.seal(&chunk)?;
                    self.execute(Some(header), sealed, Some(mid)).await
                }
            })
            .await?;
        guard.disarm();
        Ok(())
    }

    /// Send buffered headers plus an optional send header and payload
    /// through every live connection. The buffer empties on the first
    /// frame of a fan-out.
    pub(crate) async fn execute(
        &self,
        header: Option<Header>,
        payload: Vec<u8>,
        bundle_id: Option<[u8; 4]>,
    ) -> Result<(), Error> {
        let session = self.session()?;
        let mut headers = {
            let mut buffer = self
                .header_buffer
                .lock()
                .expect("header buffer lock poisoned");
            std::mem::take(&mut *buffer)
        };
        if let Some(header) = header {
            headers.push(header);
        }
        session.send(headers, payload, bundle_id).await
    }

    /// Decrypt, reassemble and deliver one authorized payload.
    ///
    /// # Errors
    ///
    /// Decryption and codec failures surface here so the connection can
    /// log and drop; nothing is raised to the peer.
    pub(crate) fn handle_message(&self, source: &Route, body: &[u8]) -> Result<(), Error> {
        let shared = SharedKey::new(
            &self.channel_key,
            &PublicKey::from_serial(&source.channel)?,
        )?;
        let plain = shared.open(body)?;

        if plain.len() > 4 && plain[..4] == codec::SINGLE_CHUNK_SENTINEL {
            let document = codec::decode_body(&plain[4..])?;
            self.deliver(source.clone(), document);
        } else {
            let (chunk_header, chunk_body) = codec::parse_chunk(&plain)?;
            let assembled = self
                .reassembly
                .lock()
                .expect("reassembly lock poisoned")
                .insert(chunk_header, chunk_body.to_vec());
            if let Some(full) = assembled {
                let document = codec::decode_body(&full)?;
                self.deliver(source.clone(), document);
            }
        }
        Ok(())
    }

    fn deliver(&self, source: Route, document: Document) {
        // The receiving half lives in self, so this cannot fail while
        // the channel is alive
        let _ = self.inbox_tx.send((source, document));
    }

    /// Walk a delegation chain and decide whether `source_id` may reach
    /// this channel.
    ///
    /// Public channels and the owner short-circuit to accept. Otherwise
    /// every token must verify under its issuer, continue the chain
    /// (asset and issuer match), survive the owner-side revocation
    /// check, and respect the tightest ancestor `max_depth`.
    #[must_use]
    pub fn validate_token_chain(&self, source_id: &str, tokens: &[String]) -> bool {
        let Some(session) = self.session.upgrade() else {
            return false;
        };
        if self.is_public || source_id == session.id() {
            return true;
        }
        if tokens.is_empty() {
            return false;
        }

        let mut asset = self.id.clone();
        let mut last_receiver = session.id().clone();
        let mut max_depth: Option<usize> = None;

        for (depth, encoded) in tokens.iter().enumerate() {
            let Ok(token) = Token::decode(encoded) else {
                return false;
            };
            if token.asset() != asset || token.issuer() != &last_receiver {
                return false;
            }
            if token.issuer() == session.id() && !session.is_issued(&token.signature_serial()) {
                return false;
            }
            if let Some(bound) = token.max_depth() {
                let candidate = bound as usize + depth;
                if max_depth.is_none_or(|current| candidate < current) {
                    max_depth = Some(candidate);
                }
            }
            if max_depth.is_some_and(|bound| depth > bound) {
                return false;
            }

            last_receiver = token.receiver().clone();
            asset = token.signature_serial();
            if last_receiver == source_id {
                return true;
            }
        }
        false
    }

    fn session(&self) -> Result<Arc<Session>, Error> {
        self.session.upgrade().ok_or(Error::SessionDropped)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &crate::short_id(&self.id))
            .field("is_public", &self.is_public)
            .finish_non_exhaustive()
    }
}

/// Purges a send's bundle from every connection unless disarmed, so a
/// cancelled or failed channel send leaves no orphaned ack entries.
struct ClearOnDrop {
    session: Arc<Session>,
    mid: [u8; 4],
    armed: bool,
}

impl ClearOnDrop {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.session.clear(self.mid);
        }
    }
}

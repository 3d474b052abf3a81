//! Session: a long-lived identity owning channels and connections.
//!
//! The session is the single owner in the `Session <-> Channel <->
//! Connection` cycle; channels and connections hold weak back-references
//! and die with it. It keeps the issued-token ledger (the owner-side
//! source of truth for revocation), the anti-replay cache, and fans
//! sends and bundle purges across every live connection.

use crate::channel::Channel;
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::Error;
use crate::header::Header;
use crate::replay::ReplayGuard;
use crate::route::{BrokerId, ChannelId, Route, SessionId};
use crate::token::{Token, TokenKind, TokenTarget};
use crate::unix_now;
use dashmap::DashMap;
use rand_core::OsRng;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tether_crypto::SIGNATURE_SIZE;
use tether_crypto::signatures::SigningKey;

/// A ledger entry: the issued token plus, for extensions, the token it
/// extends (brokers need both to route).
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// The issued token
    pub token: Token,
    /// The extended token, for extensions
    pub prev: Option<Token>,
}

/// Per-process identity: session key, channel registry, connection set,
/// issued-token ledger and replay cache.
pub struct Session {
    session_key: SigningKey,
    id: SessionId,
    config: ConnectionConfig,
    pub(crate) channels: DashMap<ChannelId, Arc<Channel>>,
    pub(crate) connections: Mutex<Vec<Arc<Connection>>>,
    issued_tokens: DashMap<String, IssuedToken>,
    replay: Mutex<ReplayGuard>,
}

impl Session {
    /// Create a session with a fresh random identity.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_key(SigningKey::generate(&mut OsRng))
    }

    /// Create a session from a persisted signing key.
    #[must_use]
    pub fn with_key(session_key: SigningKey) -> Arc<Self> {
        Self::with_key_and_config(session_key, ConnectionConfig::default())
    }

    /// Create a session with explicit connection tunables.
    #[must_use]
    pub fn with_key_and_config(session_key: SigningKey, config: ConnectionConfig) -> Arc<Self> {
        let id = session_key.verifying_key().to_serial();
        Arc::new(Self {
            session_key,
            id,
            config,
            channels: DashMap::new(),
            connections: Mutex::new(Vec::new()),
            issued_tokens: DashMap::new(),
            replay: Mutex::new(ReplayGuard::new()),
        })
    }

    /// The session's public identity serial.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Connection tunables shared by this session's connections.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.session_key
    }

    /// Consult the anti-replay cache; inserts on acceptance.
    pub fn check_no_repeat(&self, signature: [u8; SIGNATURE_SIZE], timestamp: i64) -> bool {
        self.replay
            .lock()
            .expect("replay cache lock poisoned")
            .check(signature, timestamp, unix_now())
    }

    /// Broker ids of every connection with a completed handshake,
    /// deduplicated and sorted.
    #[must_use]
    pub fn broker_ids(&self) -> Vec<BrokerId> {
        let connections = self
            .connections
            .lock()
            .expect("connection set lock poisoned");
        let brokers: BTreeSet<BrokerId> = connections
            .iter()
            .filter_map(|connection| connection.broker_id())
            .collect();
        brokers.into_iter().collect()
    }

    /// Issue a capability token and record it in the ledger.
    ///
    /// Returns the `token issue` header to piggyback on the next send.
    pub fn issue_token(
        &self,
        target: TokenTarget,
        receiver: SessionId,
        max_depth: Option<u32>,
    ) -> Header {
        let (asset, kind, prev) = match target {
            TokenTarget::Channel(channel) => (channel, TokenKind::Root, None),
            TokenTarget::Extension(prev_token) => (
                prev_token.signature_serial(),
                TokenKind::Extension,
                Some(prev_token),
            ),
        };
        let token = Token::issue(
            &self.session_key,
            self.broker_ids(),
            receiver,
            asset,
            kind,
            max_depth,
        );

        let header = Header::TokenIssue {
            token: token.encode(),
            prev: prev.as_ref().map(Token::encode),
        };
        self.issued_tokens
            .insert(token.signature_serial(), IssuedToken { token, prev });
        header
    }

    /// Drop a token from the ledger; chains traversing it are rejected
    /// from now on. Returns the `token revoke` header for brokers.
    pub fn revoke_token(&self, signature_serial: &str) -> Header {
        self.issued_tokens.remove(signature_serial);
        Header::TokenRevoke {
            signature: signature_serial.to_string(),
        }
    }

    /// Owner-side revocation check used during chain validation.
    pub(crate) fn is_issued(&self, signature_serial: &str) -> bool {
        self.issued_tokens.contains_key(signature_serial)
    }

    /// Snapshot of the ledger for handshake state replay.
    pub(crate) fn issued_snapshot(&self) -> Vec<IssuedToken> {
        self.issued_tokens
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Extend `route` so that `receiver` may use it.
    ///
    /// For a locally owned route a fresh root token replaces the chain.
    /// Otherwise the chain is truncated after the latest token this
    /// session received, and an extension is appended.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RouteNotExtendable`] when the chain never
    /// reaches this session, and [`Error::InvalidToken`] when the tail
    /// token does not parse.
    pub fn extend_route(
        &self,
        route: &mut Route,
        receiver: SessionId,
        max_depth: Option<u32>,
    ) -> Result<Header, Error> {
        if route.is_owned_by(&self.id) {
            let header = self.issue_token(
                TokenTarget::Channel(route.channel.clone()),
                receiver,
                max_depth,
            );
            if let Header::TokenIssue { token, .. } = &header {
                route.tokens = vec![token.clone()];
            }
            return Ok(header);
        }

        let mut last_received = None;
        for (index, encoded) in route.tokens.iter().enumerate() {
            let token = Token::decode_unverified(encoded)?;
            if token.receiver() == &self.id {
                last_received = Some(index);
            }
        }
        let Some(index) = last_received else {
            return Err(Error::RouteNotExtendable);
        };
        route.tokens.truncate(index + 1);

        let tail = Token::decode_unverified(&route.tokens[index])?;
        let header = self.issue_token(TokenTarget::Extension(tail), receiver, max_depth);
        if let Header::TokenIssue { token, .. } = &header {
            route.tokens.push(token.clone());
        }
        Ok(header)
    }

    /// Purge every awaiting-ack entry of `bundle_id` on all connections.
    pub fn clear(&self, bundle_id: [u8; 4]) {
        let connections = self
            .connections
            .lock()
            .expect("connection set lock poisoned")
            .clone();
        for connection in connections {
            connection.clear(bundle_id);
        }
    }

    /// Send one framed message through every live connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] when the session has no
    /// connections, or the first connection-level failure.
    pub async fn send(
        &self,
        headers: Vec<Header>,
        payload: Vec<u8>,
        bundle_id: Option<[u8; 4]>,
    ) -> Result<(), Error> {
        let connections = self
            .connections
            .lock()
            .expect("connection set lock poisoned")
            .clone();
        if connections.is_empty() {
            return Err(Error::NotConnected);
        }
        for connection in connections {
            connection.send(&headers, &payload, bundle_id, None).await?;
        }
        Ok(())
    }

    /// Look up a local channel by id.
    #[must_use]
    pub fn channel(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.get(id).map(|entry| entry.value().clone())
    }

    pub(crate) fn register_connection(&self, connection: Arc<Connection>) {
        self.connections
            .lock()
            .expect("connection set lock poisoned")
            .push(connection);
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("connection set lock poisoned")
            .len()
    }

    /// Shut down every connection's supervisor.
    pub async fn close(&self) {
        let connections = self
            .connections
            .lock()
            .expect("connection set lock poisoned")
            .clone();
        for connection in connections {
            connection.close().await;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &crate::short_id(&self.id))
            .field("channels", &self.channels.len())
            .field("issued_tokens", &self.issued_tokens.len())
            .finish_non_exhaustive()
    }
}

//! Routes: addressing plus capability.
//!
//! A route names a channel (`brokers`, `session`, `channel`) and carries
//! the token chain that authorizes the bearer to reach it. Its JSON form
//! is the `RouteDict` of the wire header schema.

use serde::{Deserialize, Serialize};

/// Base64url serial of a session's Ed25519 public key
pub type SessionId = String;

/// Base64url serial of a channel's X25519 public key
pub type ChannelId = String;

/// Base64url serial of a broker's Ed25519 public key
pub type BrokerId = String;

/// Addressing record for one channel.
///
/// A route with an empty token chain addresses the owner's own channel;
/// otherwise `tokens` is a delegation chain ending at the current bearer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Brokers through which the channel is reachable
    pub brokers: Vec<BrokerId>,
    /// Owning session
    pub session: SessionId,
    /// Channel public id
    pub channel: ChannelId,
    /// Delegation chain (encoded tokens, root first)
    #[serde(default)]
    pub tokens: Vec<String>,
}

impl Route {
    /// Create a route with an empty token chain.
    #[must_use]
    pub fn new(brokers: Vec<BrokerId>, session: SessionId, channel: ChannelId) -> Self {
        Self {
            brokers,
            session,
            channel,
            tokens: Vec::new(),
        }
    }

    /// Whether the route addresses a channel owned by `session_id`.
    #[must_use]
    pub fn is_owned_by(&self, session_id: &str) -> bool {
        self.session == session_id
    }
}

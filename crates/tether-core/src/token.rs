//! Capability tokens.
//!
//! A token is a signed certificate binding an *asset* to a *receiver*. A
//! root token's asset is a channel id; an extension token's asset is the
//! signature serial of the token it extends, so chains are linked by
//! content address. Tokens are verifiable offline: the signature covers
//! the canonical JSON payload and must verify under the issuer's key.

use crate::error::Error;
use crate::route::{BrokerId, ChannelId, SessionId};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use tether_crypto::SIGNATURE_SIZE;
use tether_crypto::signatures::{Signature, SigningKey, VerifyingKey};

/// Whether a token roots a chain at a channel or extends a prior token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Asset is a channel id; only the channel owner issues these
    Root,
    /// Asset is the signature serial of the extended token
    Extension,
}

/// What a new token grants access to
#[derive(Debug, Clone)]
pub enum TokenTarget {
    /// Issue a root token for a locally owned channel
    Channel(ChannelId),
    /// Issue an extension of a previously received token
    Extension(Token),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TokenPayload {
    issuer: SessionId,
    brokers: Vec<BrokerId>,
    receiver: SessionId,
    asset: String,
    kind: TokenKind,
    max_depth: Option<u32>,
}

/// A signed capability certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    payload: TokenPayload,
    signature: Signature,
}

impl Token {
    /// Issue and sign a new token.
    ///
    /// `key` must be the issuer's session key; the issuer field is
    /// derived from it, so a token can never claim a foreign issuer.
    #[must_use]
    pub fn issue(
        key: &SigningKey,
        brokers: Vec<BrokerId>,
        receiver: SessionId,
        asset: String,
        kind: TokenKind,
        max_depth: Option<u32>,
    ) -> Self {
        let payload = TokenPayload {
            issuer: key.verifying_key().to_serial(),
            brokers,
            receiver,
            asset,
            kind,
            max_depth,
        };
        let signature = key.sign(&payload.canonical_bytes());
        Self { payload, signature }
    }

    /// Issuer session id
    #[must_use]
    pub fn issuer(&self) -> &SessionId {
        &self.payload.issuer
    }

    /// Receiver session id
    #[must_use]
    pub fn receiver(&self) -> &SessionId {
        &self.payload.receiver
    }

    /// Channel id (root) or extended token's signature serial (extension)
    #[must_use]
    pub fn asset(&self) -> &str {
        &self.payload.asset
    }

    /// Root or extension
    #[must_use]
    pub fn kind(&self) -> TokenKind {
        self.payload.kind
    }

    /// Optional bound on total chain depth contributed by this token
    #[must_use]
    pub fn max_depth(&self) -> Option<u32> {
        self.payload.max_depth
    }

    /// The token's signature
    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Base64url signature serial; tokens are content-addressed by this.
    #[must_use]
    pub fn signature_serial(&self) -> String {
        self.signature.to_serial()
    }

    /// Encode to the wire string carried in routes and token headers:
    /// base64url of `signature || canonical JSON payload`.
    #[must_use]
    pub fn encode(&self) -> String {
        let payload = self.payload.canonical_bytes();
        let mut raw = Vec::with_capacity(SIGNATURE_SIZE + payload.len());
        raw.extend_from_slice(self.signature.as_bytes());
        raw.extend_from_slice(&payload);
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Decode and verify an encoded token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToken`] on malformed input and
    /// [`Error::Crypto`] when the signature does not verify under the
    /// claimed issuer.
    pub fn decode(encoded: &str) -> Result<Self, Error> {
        let token = Self::decode_unverified(encoded)?;
        token.verify()?;
        Ok(token)
    }

    /// Decode without checking the signature.
    ///
    /// Used when re-encoding a tail token to extend a chain; validation
    /// paths must use [`Token::decode`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToken`] on malformed input.
    pub fn decode_unverified(encoded: &str) -> Result<Self, Error> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| Error::InvalidToken(e.to_string()))?;
        if raw.len() <= SIGNATURE_SIZE {
            return Err(Error::InvalidToken("shorter than a signature".into()));
        }
        let signature = Signature::from_slice(&raw[..SIGNATURE_SIZE])
            .map_err(|_| Error::InvalidToken("bad signature bytes".into()))?;
        let payload: TokenPayload = serde_json::from_slice(&raw[SIGNATURE_SIZE..])
            .map_err(|e| Error::InvalidToken(e.to_string()))?;
        Ok(Self { payload, signature })
    }

    /// Verify the signature under the claimed issuer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] on an invalid issuer serial or a
    /// signature mismatch.
    pub fn verify(&self) -> Result<(), Error> {
        let issuer = VerifyingKey::from_serial(&self.payload.issuer)?;
        issuer.verify(&self.payload.canonical_bytes(), &self.signature)?;
        Ok(())
    }
}

impl TokenPayload {
    /// Canonical signing bytes: the fields as a JSON array, fixed order.
    fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&(
            &self.issuer,
            &self.brokers,
            &self.receiver,
            &self.asset,
            &self.kind,
            &self.max_depth,
        ))
        .unwrap_or_default()
    }
}

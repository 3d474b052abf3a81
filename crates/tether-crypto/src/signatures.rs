//! Ed25519 signing keys for session identities.
//!
//! A session is identified by its Ed25519 public key. The same key signs
//! wire frames, handshake challenges, and capability tokens. Serials
//! (base64url, no padding) are the JSON-facing form of a public key.

use crate::CryptoError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signer, Verifier};
use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Create a signature from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Create a signature from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the slice is not exactly 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != 64 {
            return Err(CryptoError::InvalidSignature);
        }
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Get the raw signature bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Base64url encoding, used to content-address tokens and messages
    #[must_use]
    pub fn to_serial(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    fn to_dalek(self) -> ed25519_dalek::Signature {
        ed25519_dalek::Signature::from_bytes(&self.0)
    }
}

/// Ed25519 signing key (private half of a session identity)
///
/// Zeroized on drop to prevent key material from lingering in memory.
#[derive(ZeroizeOnDrop)]
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl SigningKey {
    /// Generate a new random signing key
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(rng),
        }
    }

    /// Create from a raw 32-byte seed
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    /// Sign a message, returning a 64-byte Ed25519 signature
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.inner.sign(message);
        Signature(sig.to_bytes())
    }

    /// Get the corresponding verifying key (public identity)
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Export the raw seed bytes (use with extreme caution)
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }
}

/// Ed25519 verifying key (public session identity)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl VerifyingKey {
    /// Create from a raw 32-byte public key
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes do not
    /// represent a valid Ed25519 point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { inner })
    }

    /// Parse a base64url serial back into a verifying key
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSerial`] on malformed base64 or wrong
    /// length, [`CryptoError::InvalidPublicKey`] on an invalid point.
    pub fn from_serial(serial: &str) -> Result<Self, CryptoError> {
        let decoded = URL_SAFE_NO_PAD
            .decode(serial)
            .map_err(|_| CryptoError::InvalidSerial)?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| CryptoError::InvalidSerial)?;
        Self::from_bytes(&bytes)
    }

    /// Get the raw public key bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Base64url serial, the JSON-facing session identifier
    #[must_use]
    pub fn to_serial(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.inner.to_bytes())
    }

    /// Verify a signature on a message
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the signature is invalid,
    /// malformed, or does not authenticate the message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        self.inner
            .verify(message, &signature.to_dalek())
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn sign_verify_roundtrip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let message = b"authenticate this message";
        let signature = signing_key.sign(message);

        assert!(verifying_key.verify(message, &signature).is_ok());
    }

    #[test]
    fn tampered_message_fails_verification() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let signature = signing_key.sign(b"original message");

        assert!(verifying_key.verify(b"tampered message", &signature).is_err());
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let message = b"test message";
        let signature = signing_key.sign(message);

        let mut tampered = *signature.as_bytes();
        tampered[0] ^= 0xFF;

        assert!(
            verifying_key
                .verify(message, &Signature::from_bytes(tampered))
                .is_err()
        );
    }

    #[test]
    fn wrong_key_fails_verification() {
        let key1 = SigningKey::generate(&mut OsRng);
        let key2 = SigningKey::generate(&mut OsRng);

        let signature = key1.sign(b"test");

        assert!(key2.verifying_key().verify(b"test", &signature).is_err());
    }

    #[test]
    fn serial_roundtrip() {
        let verifying_key = SigningKey::generate(&mut OsRng).verifying_key();
        let serial = verifying_key.to_serial();

        // 32 bytes of base64url without padding
        assert_eq!(serial.len(), 43);
        assert_eq!(VerifyingKey::from_serial(&serial).unwrap(), verifying_key);
    }

    #[test]
    fn bad_serial_rejected() {
        assert!(VerifyingKey::from_serial("not base64!!").is_err());
        assert!(VerifyingKey::from_serial("AAAA").is_err());
    }

    #[test]
    fn signature_from_slice_wrong_size() {
        assert!(Signature::from_slice(&[0u8; 32]).is_err());
        assert!(Signature::from_slice(&[0u8; 128]).is_err());
    }

    #[test]
    fn signing_key_from_bytes_roundtrip() {
        let original = SigningKey::generate(&mut OsRng);
        let recovered = SigningKey::from_bytes(&original.to_bytes());

        let message = b"test message";
        assert_eq!(original.sign(message), recovered.sign(message));
    }
}

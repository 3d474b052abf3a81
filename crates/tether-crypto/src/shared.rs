//! Channel-pair shared-key AEAD.
//!
//! `SharedKey` binds a local X25519 private key to a remote channel's
//! public key: X25519 agreement, BLAKE3 `derive_key`, then
//! XChaCha20-Poly1305 with a random 24-byte nonce per chunk. The wire
//! form of a chunk is `nonce || ciphertext`.

use crate::exchange::{PrivateKey, PublicKey};
use crate::random::fill_random;
use crate::{CryptoError, NONCE_SIZE};
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit},
};

const KDF_CONTEXT: &str = "tether channel shared key v1";

/// Symmetric cipher derived from a channel key pair
pub struct SharedKey {
    cipher: XChaCha20Poly1305,
}

impl SharedKey {
    /// Derive the shared cipher for a local/remote channel-key pair.
    ///
    /// Both ends derive the same key: `DH(a, B) == DH(b, A)`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::LowOrderPoint`] if the peer key is a
    /// low-order point.
    pub fn new(local: &PrivateKey, remote: &PublicKey) -> Result<Self, CryptoError> {
        let secret = local.exchange(remote).ok_or(CryptoError::LowOrderPoint)?;
        let key = blake3::derive_key(KDF_CONTEXT, secret.as_bytes());
        Ok(Self {
            cipher: XChaCha20Poly1305::new(&key.into()),
        })
    }

    /// Encrypt plaintext with the given nonce
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the AEAD rejects the input.
    pub fn encrypt(&self, plaintext: &[u8], nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(nonce.into(), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt ciphertext with the given nonce
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on authentication failure.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(nonce.into(), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Encrypt with a fresh random nonce, returning `nonce || ciphertext`
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if nonce generation fails,
    /// or [`CryptoError::EncryptionFailed`] from the AEAD.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        fill_random(&mut nonce)?;
        let mut out = Vec::with_capacity(NONCE_SIZE + plaintext.len() + 16);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&self.encrypt(plaintext, &nonce)?);
        Ok(out)
    }

    /// Decrypt a `nonce || ciphertext` wire chunk
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if the chunk is shorter
    /// than a nonce or fails authentication.
    pub fn open(&self, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if wire.len() < NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&wire[..NONCE_SIZE]);
        self.decrypt(&wire[NONCE_SIZE..], &nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn pair() -> (SharedKey, SharedKey) {
        let a = PrivateKey::generate(&mut OsRng);
        let b = PrivateKey::generate(&mut OsRng);
        let a_pub = a.public_key();
        let b_pub = b.public_key();
        (
            SharedKey::new(&a, &b_pub).unwrap(),
            SharedKey::new(&b, &a_pub).unwrap(),
        )
    }

    #[test]
    fn seal_open_roundtrip() {
        let (ours, theirs) = pair();

        let wire = ours.seal(b"chunk of payload").unwrap();
        assert_eq!(theirs.open(&wire).unwrap(), b"chunk of payload");
    }

    #[test]
    fn nonces_are_fresh() {
        let (ours, _) = pair();

        let first = ours.seal(b"same input").unwrap();
        let second = ours.seal(b"same input").unwrap();

        assert_ne!(first[..NONCE_SIZE], second[..NONCE_SIZE]);
        assert_ne!(first, second);
    }

    #[test]
    fn tamper_detection() {
        let (ours, theirs) = pair();

        let mut wire = ours.seal(b"chunk of payload").unwrap();
        wire[NONCE_SIZE] ^= 0xFF;

        assert!(theirs.open(&wire).is_err());
    }

    #[test]
    fn truncated_chunk_rejected() {
        let (_, theirs) = pair();
        assert!(theirs.open(&[0u8; 5]).is_err());
    }

    #[test]
    fn wrong_pair_cannot_open() {
        let (ours, _) = pair();
        let (_, other) = pair();

        let wire = ours.seal(b"secret").unwrap();
        assert!(other.open(&wire).is_err());
    }

    #[test]
    fn low_order_remote_rejected() {
        let local = PrivateKey::generate(&mut OsRng);
        let zero = PublicKey::from_bytes([0u8; 32]);

        assert!(SharedKey::new(&local, &zero).is_err());
    }
}

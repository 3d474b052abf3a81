//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Signature is malformed or does not authenticate the message
    #[error("invalid signature")]
    InvalidSignature,

    /// Bytes do not represent a valid public key point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Serial string is not valid base64url or has the wrong length
    #[error("invalid key serial")]
    InvalidSerial,

    /// Peer public key is a low-order point
    #[error("low-order public key rejected")]
    LowOrderPoint,

    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure or truncated input)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}

//! # Tether Crypto
//!
//! Cryptographic primitives for the Tether transport.
//!
//! This crate provides:
//! - Ed25519 session identities and frame/token signatures
//! - X25519 channel key pairs
//! - Channel-pair shared-key AEAD (X25519 ECDH, BLAKE3 KDF, `XChaCha20-Poly1305`)
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Identities / signatures | Ed25519 |
//! | Channel key exchange | X25519 |
//! | KDF | BLAKE3 `derive_key` |
//! | AEAD | XChaCha20-Poly1305 |
//!
//! Public keys travel as base64url (no padding) *serials* inside JSON
//! headers and as raw 32-byte strings on binary wire segments.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod exchange;
pub mod random;
pub mod shared;
pub mod signatures;

pub use error::CryptoError;

/// Ed25519 / X25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// XChaCha20-Poly1305 nonce size
pub const NONCE_SIZE: usize = 24;

/// XChaCha20-Poly1305 key size
pub const SHARED_KEY_SIZE: usize = 32;

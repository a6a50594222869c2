//! Archipel Core - identity and session cryptography
//!
//! This crate provides the security primitives for archipel nodes:
//! - Node identity derived from a long-term Ed25519 public key file
//! - Ephemeral X25519 key exchange for forward-secret session keys
//! - HKDF-SHA256 session key derivation
//! - ChaCha20-Poly1305 AEAD encryption of application messages

pub mod crypto;
pub mod error;
pub mod identity;

pub use crypto::{decrypt, encrypt, EncryptedMessage, SessionKey, SessionKeyExchange};
pub use error::{Error, Result};
pub use identity::{IdentityKeyPair, NodeIdentity};

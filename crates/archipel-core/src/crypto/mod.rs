//! Cryptographic primitives for archipel
//!
//! This module provides:
//! - `keys`: Ephemeral X25519 key pairs and the per-connection key exchange
//! - `kdf`: Session key derivation
//! - `aead`: Authenticated encryption (ChaCha20-Poly1305)

pub mod aead;
pub mod kdf;
pub mod keys;

pub use aead::{decrypt, encrypt, EncryptedMessage};
pub use kdf::{derive_key, derive_session_key, SessionKey};
pub use keys::{EphemeralKeyPair, SessionKeyExchange, SharedSecret};

//! Error types for archipel core

use thiserror::Error;

/// Core error type for identity, key agreement and encryption
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Tag verification failed. Never carries partial plaintext.
    #[error("Authentication failed")]
    Authentication,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for archipel core operations
pub type Result<T> = std::result::Result<T, Error>;

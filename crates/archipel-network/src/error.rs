//! Network error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, reported before any socket is opened
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bind, multicast join or socket setup failure
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected to peer: {0}")]
    NotConnected(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Untrusted input that does not match the expected schema
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] archipel_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

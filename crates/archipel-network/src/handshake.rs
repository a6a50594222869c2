//! Session key exchange over an open stream
//!
//! Both sides run the same steps: send the 32 raw bytes of a fresh
//! ephemeral public key, read the peer's 32 bytes, derive the session key.
//! No application frame is read or written before this completes.

use std::time::Duration;

use archipel_core::crypto::keys::X25519_PUBLIC_KEY_SIZE;
use archipel_core::{SessionKey, SessionKeyExchange};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Run the key exchange on `stream`, bounded by `timeout`.
///
/// A short read, a malformed key or the deadline passing all fail with
/// [`Error::Handshake`]; the caller must then drop the stream.
pub async fn perform_handshake<S>(stream: &mut S, timeout: Duration) -> Result<SessionKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, exchange(stream))
        .await
        .map_err(|_| Error::Handshake("timed out waiting for peer key".to_string()))?
}

async fn exchange<S>(stream: &mut S) -> Result<SessionKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = SessionKeyExchange::new();

    stream
        .write_all(&exchange.public_key_bytes())
        .await
        .map_err(|e| Error::Handshake(format!("failed to send public key: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| Error::Handshake(format!("failed to send public key: {}", e)))?;

    let mut peer_public = [0u8; X25519_PUBLIC_KEY_SIZE];
    stream
        .read_exact(&mut peer_public)
        .await
        .map_err(|e| Error::Handshake(format!("failed to read peer public key: {}", e)))?;

    exchange
        .complete(&peer_public)
        .map_err(|e| Error::Handshake(e.to_string()))
}

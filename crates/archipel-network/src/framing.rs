//! Stream framing for the TCP application channel
//!
//! After the handshake every message on the stream is one frame:
//!
//! ```text
//! nonce (12 bytes) || ciphertext length (u32, big-endian) || ciphertext
//! ```

use archipel_core::crypto::aead::{NONCE_SIZE, TAG_SIZE};
use archipel_core::EncryptedMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Largest ciphertext accepted in one frame
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Write one encrypted frame
pub async fn write_frame<W>(writer: &mut W, message: &EncryptedMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if message.ciphertext.len() > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Frame too large ({} > {} bytes)",
            message.ciphertext.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut buf = Vec::with_capacity(NONCE_SIZE + 4 + message.ciphertext.len());
    buf.extend_from_slice(&message.nonce);
    buf.extend_from_slice(&(message.ciphertext.len() as u32).to_be_bytes());
    buf.extend_from_slice(&message.ciphertext);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one encrypted frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between
/// frames. EOF inside a frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<EncryptedMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut nonce = [0u8; NONCE_SIZE];
    let first = reader.read(&mut nonce).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut nonce[first..]).await?;

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Frame too large ({} > {} bytes)",
            len, MAX_FRAME_SIZE
        )));
    }
    if len < TAG_SIZE {
        return Err(Error::Protocol(format!("Frame too short ({} bytes)", len)));
    }

    let mut ciphertext = vec![0u8; len];
    reader.read_exact(&mut ciphertext).await?;

    Ok(Some(EncryptedMessage { nonce, ciphertext }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_layout() {
        let message = EncryptedMessage {
            nonce: [9u8; NONCE_SIZE],
            ciphertext: vec![1u8; TAG_SIZE + 3],
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &message).await.unwrap();

        assert_eq!(buf.len(), NONCE_SIZE + 4 + TAG_SIZE + 3);
        assert_eq!(&buf[..NONCE_SIZE], &[9u8; NONCE_SIZE]);
        assert_eq!(&buf[NONCE_SIZE..NONCE_SIZE + 4], &19u32.to_be_bytes());

        let mut reader = buf.as_slice();
        let decoded = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let messages: Vec<EncryptedMessage> = (0..3u8)
            .map(|i| EncryptedMessage {
                nonce: [i; NONCE_SIZE],
                ciphertext: vec![i; TAG_SIZE + i as usize],
            })
            .collect();

        for message in &messages {
            write_frame(&mut client, message).await.unwrap();
        }
        drop(client);

        for message in &messages {
            assert_eq!(read_frame(&mut server).await.unwrap().as_ref(), Some(message));
        }
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let data = [7u8; NONCE_SIZE + 2];
        let mut reader = &data[..];
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let mut data = vec![0u8; NONCE_SIZE];
        data.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut reader = data.as_slice();
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(Error::Protocol(_))
        ));
    }
}

//! Authenticated Encryption with Associated Data (AEAD)
//!
//! Implements ChaCha20-Poly1305 for session message encryption.
//! Every call to [`encrypt`] draws a fresh random nonce from the thread-local CSPRNG.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

use crate::error::{Error, Result};

/// Size of the encryption key in bytes
pub const KEY_SIZE: usize = 32;
/// Size of the nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of the authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// A sealed message: nonce plus ciphertext with the tag appended
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedMessage {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

/// Encrypt a message using ChaCha20-Poly1305
///
/// # Arguments
/// * `key` - exactly 32 bytes; any other length fails with `InvalidKeyLength`
/// * `plaintext` - Message to encrypt
/// * `associated_data` - Optional data to authenticate (not encrypted)
pub fn encrypt(
    key: &[u8],
    plaintext: &[u8],
    associated_data: Option<&[u8]>,
) -> Result<EncryptedMessage> {
    let cipher = cipher_for(key)?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: associated_data.unwrap_or_default(),
            },
        )
        .map_err(|e| Error::Encryption(e.to_string()))?;

    Ok(EncryptedMessage { nonce, ciphertext })
}

/// Decrypt a message using ChaCha20-Poly1305
///
/// Fails with [`Error::Authentication`] on any tag mismatch: tampering,
/// wrong key, wrong associated data or truncation. No plaintext is
/// returned in that case.
pub fn decrypt(
    key: &[u8],
    message: &EncryptedMessage,
    associated_data: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;

    if message.ciphertext.len() < TAG_SIZE {
        return Err(Error::Authentication);
    }

    cipher
        .decrypt(
            Nonce::from_slice(&message.nonce),
            Payload {
                msg: &message.ciphertext,
                aad: associated_data.unwrap_or_default(),
            },
        )
        .map_err(|_| Error::Authentication)
}

fn cipher_for(key: &[u8]) -> Result<ChaCha20Poly1305> {
    if key.len() != KEY_SIZE {
        return Err(Error::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: key.len(),
        });
    }
    ChaCha20Poly1305::new_from_slice(key).map_err(|e| Error::Encryption(e.to_string()))
}

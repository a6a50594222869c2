//! Key Derivation Functions
//!
//! Session keys are derived from the raw X25519 output with HKDF-SHA256.
//! The raw shared secret is never used as an encryption key directly.

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::keys::SharedSecret;
use crate::error::{Error, Result};

/// Context label bound into every session key
pub const SESSION_INFO: &[u8] = b"session-v1";

/// Size of a session key in bytes
pub const SESSION_KEY_SIZE: usize = 32;

/// Derive `output_len` bytes from input key material using HKDF-SHA256
pub fn derive_key(
    input_key_material: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output_len: usize,
) -> Result<Vec<u8>> {
    let hkdf = Hkdf::<Sha256>::new(salt, input_key_material);
    let mut output = vec![0u8; output_len];

    hkdf.expand(info, &mut output)
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;

    Ok(output)
}

/// Derive the 32-byte session key for one connection.
///
/// No salt, info `session-v1`. Both ends of a completed exchange derive
/// the same key.
pub fn derive_session_key(shared_secret: &SharedSecret) -> Result<SessionKey> {
    let mut okm = derive_key(
        shared_secret.as_bytes(),
        None,
        SESSION_INFO,
        SESSION_KEY_SIZE,
    )?;
    let key = SessionKey::from_slice(&okm);
    okm.zeroize();
    key
}

/// Symmetric key for one connection. Held in memory only and wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Build a session key from exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; SESSION_KEY_SIZE] =
            bytes.try_into().map_err(|_| Error::InvalidKeyLength {
                expected: SESSION_KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

//! Ephemeral key management and session key exchange
//!
//! Every connection runs one exchange:
//! - each side generates a fresh X25519 key pair
//! - the public halves are swapped over the stream
//! - each side computes DH(own secret, peer public) and feeds it to the KDF
//!
//! The secret half is consumed by the DH step, so a key pair cannot be
//! reused for a second session.

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::kdf::{derive_session_key, SessionKey};
use crate::error::{Error, Result};

/// Size of X25519 public key in bytes
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;
/// Size of the raw Diffie-Hellman output in bytes
pub const SHARED_SECRET_SIZE: usize = 32;

/// One-shot X25519 key pair for a single handshake
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: X25519PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a new ephemeral key pair
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the public key
    pub fn public_key(&self) -> X25519PublicKey {
        self.public
    }

    /// Compute the shared secret with a peer, consuming the secret key.
    ///
    /// Low-order peer keys produce an all-zero output; those are rejected.
    pub fn diffie_hellman(self, peer_public: &X25519PublicKey) -> Result<SharedSecret> {
        let shared = self.secret.diffie_hellman(peer_public);
        if !shared.was_contributory() {
            return Err(Error::Handshake(
                "Peer public key is a low-order point".to_string(),
            ));
        }
        Ok(SharedSecret::from_bytes(shared.to_bytes()))
    }
}

/// Raw Diffie-Hellman output. Only ever fed to the KDF.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_SIZE]);

impl SharedSecret {
    pub(crate) fn from_bytes(bytes: [u8; SHARED_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.0
    }
}

/// Parse a peer's public key as received off the wire
pub fn parse_public_key(bytes: &[u8]) -> Result<X25519PublicKey> {
    let key: [u8; X25519_PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
        Error::Handshake(format!(
            "Invalid public key length: expected {}, got {}",
            X25519_PUBLIC_KEY_SIZE,
            bytes.len()
        ))
    })?;
    Ok(X25519PublicKey::from(key))
}

/// State of one side of the session key exchange
pub struct SessionKeyExchange {
    keypair: EphemeralKeyPair,
}

impl SessionKeyExchange {
    /// Start an exchange with a freshly generated ephemeral key pair
    pub fn new() -> Self {
        Self {
            keypair: EphemeralKeyPair::generate(),
        }
    }

    /// Bytes to transmit to the peer
    pub fn public_key_bytes(&self) -> [u8; X25519_PUBLIC_KEY_SIZE] {
        self.keypair.public_key().to_bytes()
    }

    /// Finish the exchange with the peer's public key bytes.
    ///
    /// Any malformed peer key fails the whole exchange; there is no
    /// fallback key.
    pub fn complete(self, peer_public: &[u8]) -> Result<SessionKey> {
        let peer_public = parse_public_key(peer_public)?;
        let shared = self.keypair.diffie_hellman(&peer_public)?;
        derive_session_key(&shared)
    }
}

impl Default for SessionKeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_same_key() {
        for _ in 0..16 {
            let alice = SessionKeyExchange::new();
            let bob = SessionKeyExchange::new();

            let alice_pub = alice.public_key_bytes();
            let bob_pub = bob.public_key_bytes();

            let alice_key = alice.complete(&bob_pub).unwrap();
            let bob_key = bob.complete(&alice_pub).unwrap();

            assert_eq!(alice_key, bob_key);
        }
    }

    #[test]
    fn test_shared_secrets_match() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        let a_pub = a.public_key();
        let b_pub = b.public_key();

        let s1 = a.diffie_hellman(&b_pub).unwrap();
        let s2 = b.diffie_hellman(&a_pub).unwrap();

        assert_eq!(s1.as_bytes(), s2.as_bytes());
    }

    #[test]
    fn test_independent_sessions_get_different_keys() {
        let run = || {
            let a = SessionKeyExchange::new();
            let b = SessionKeyExchange::new();
            let b_pub = b.public_key_bytes();
            a.complete(&b_pub).unwrap()
        };

        assert_ne!(run(), run());
    }

    #[test]
    fn test_ephemeral_public_keys_are_fresh() {
        let a = SessionKeyExchange::new();
        let b = SessionKeyExchange::new();
        assert_ne!(a.public_key_bytes(), b.public_key_bytes());
    }

    #[test]
    fn test_wrong_length_public_key_rejected() {
        let exchange = SessionKeyExchange::new();
        let result = exchange.complete(&[1u8; 31]);
        assert!(matches!(result, Err(Error::Handshake(_))));

        let exchange = SessionKeyExchange::new();
        let result = exchange.complete(&[1u8; 33]);
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[test]
    fn test_low_order_public_key_rejected() {
        let exchange = SessionKeyExchange::new();
        let result = exchange.complete(&[0u8; 32]);
        assert!(matches!(result, Err(Error::Handshake(_))));
    }
}

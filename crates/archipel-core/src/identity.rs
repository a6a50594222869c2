//! Long-term node identity
//!
//! A node is identified by the SHA-256 digest of its public key file. The
//! key pair is Ed25519 and is stored as PEM next to the binary's working
//! directory by default (`keys/node_ed25519_public.pem`). The identity is
//! self-asserted: nothing here is signed by a third party.

use std::fmt;
use std::path::{Path, PathBuf};

use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Default directory holding the node key files
pub const DEFAULT_KEY_DIR: &str = "keys";
/// File name of the public key inside the key directory
pub const PUBLIC_KEY_FILE: &str = "node_ed25519_public.pem";
/// File name of the private key inside the key directory
pub const PRIVATE_KEY_FILE: &str = "node_ed25519_private.pem";

/// Size of a node identity in bytes
pub const NODE_ID_SIZE: usize = 32;

/// Stable identifier of a node, derived from its public key material
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIdentity([u8; NODE_ID_SIZE]);

impl NodeIdentity {
    /// Hash public key material into an identity
    pub fn from_public_key_bytes(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut id = [0u8; NODE_ID_SIZE];
        id.copy_from_slice(&digest);
        Self(id)
    }

    /// Load the identity from a public key file.
    ///
    /// A missing or unreadable file is an error; callers treat it as fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            Error::Identity(format!(
                "Cannot read public key file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::from_public_key_bytes(&data))
    }

    /// Load the identity from `<dir>/node_ed25519_public.pem`
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load(&dir.join(PUBLIC_KEY_FILE))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// Full lowercase hex form, used on the wire and in logs
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIdentity({})", &self.to_hex()[..16])
    }
}

/// Long-term Ed25519 key pair backing a [`NodeIdentity`]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// SubjectPublicKeyInfo PEM of the public key
    pub fn public_key_pem(&self) -> Result<String> {
        self.signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Identity(format!("Failed to encode public key: {}", e)))
    }

    /// PKCS#8 PEM of the private key
    pub fn private_key_pem(&self) -> Result<String> {
        let pem = self
            .signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::Identity(format!("Failed to encode private key: {}", e)))?;
        Ok(pem.as_str().to_owned())
    }

    /// Identity this key pair yields once its public key file is written
    pub fn node_identity(&self) -> Result<NodeIdentity> {
        Ok(NodeIdentity::from_public_key_bytes(
            self.public_key_pem()?.as_bytes(),
        ))
    }

    /// Write both key files into `dir`, creating it if needed.
    ///
    /// Returns `(public_key_path, private_key_path)`.
    pub fn write_pem(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let public_path = dir.join(PUBLIC_KEY_FILE);
        let private_path = dir.join(PRIVATE_KEY_FILE);
        std::fs::write(&public_path, self.public_key_pem()?)?;
        std::fs::write(&private_path, self.private_key_pem()?)?;
        Ok((public_path, private_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_material_same_identity() {
        let a = NodeIdentity::from_public_key_bytes(b"public key material");
        let b = NodeIdentity::from_public_key_bytes(b"public key material");
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_material_different_identity() {
        let a = NodeIdentity::from_public_key_bytes(b"public key one");
        let b = NodeIdentity::from_public_key_bytes(b"public key two");
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_is_sha256_sized() {
        let id = NodeIdentity::from_public_key_bytes(b"abc");
        assert_eq!(id.as_bytes().len(), 32);
        assert_eq!(id.to_hex().len(), 64);
        assert_eq!(
            id.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_generated_keys_give_distinct_identities() {
        let tmp = tempfile::TempDir::new().unwrap();

        let first = IdentityKeyPair::generate();
        first.write_pem(tmp.path()).unwrap();
        let id1 = NodeIdentity::load_from_dir(tmp.path()).unwrap();

        let second = IdentityKeyPair::generate();
        second.write_pem(tmp.path()).unwrap();
        let id2 = NodeIdentity::load_from_dir(tmp.path()).unwrap();

        assert_ne!(id1, id2);
        assert_eq!(id2, second.node_identity().unwrap());
    }

    #[test]
    fn test_reload_is_stable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let keys = IdentityKeyPair::generate();
        let (public_path, private_path) = keys.write_pem(tmp.path()).unwrap();

        assert!(private_path.exists());
        let pem = std::fs::read_to_string(&public_path).unwrap();
        assert!(pem.contains("BEGIN PUBLIC KEY"));

        let id1 = NodeIdentity::load(&public_path).unwrap();
        let id2 = NodeIdentity::load(&public_path).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let result = NodeIdentity::load_from_dir(tmp.path());
        assert!(matches!(result, Err(Error::Identity(_))));
    }
}

//! Node identity keys
//!
//! Every node owns a long-term Ed25519 signing key. Its public half is the
//! node's identity on the discovery network and the key that the secret
//! connection handshake binds to the remote end.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Length of an Ed25519 signature
pub const SIGNATURE_LEN: usize = 64;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A 32-byte Ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PubKey(pub [u8; 32]);

impl PubKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(PubKey(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidPublicKey)?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Verify an Ed25519 signature made by this key
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(sig) else {
            return false;
        };
        key.verify(msg, &Signature::from_bytes(&sig_bytes)).is_ok()
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PubKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// The long-term signing key of this node
#[derive(Clone)]
pub struct NodeKey {
    signing_key: SigningKey,
}

impl NodeKey {
    /// Generate a new random node key
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create a node key from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Create a node key from a hex-encoded 32-byte seed
    pub fn from_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| KeyError::InvalidPrivateKey)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// Resolve the configured node key.
    ///
    /// `spec` is either an inline hex seed or a path to a file holding one.
    /// When it names a file that does not exist yet a fresh key is generated
    /// and written there.
    pub fn load_or_generate(spec: &str, default_path: &Path) -> Result<Self, KeyError> {
        let spec = spec.trim();
        if !spec.is_empty() {
            if let Ok(key) = Self::from_hex(spec) {
                return Ok(key);
            }
        }
        let path = if spec.is_empty() {
            default_path.to_path_buf()
        } else {
            Path::new(spec).to_path_buf()
        };

        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            return Self::from_hex(&contents);
        }

        let key = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        crate::storage::write_atomic(&path, key.seed_hex().as_bytes())?;
        log::info!("Generated new node key at {}", path.display());
        Ok(key)
    }

    /// Hex encoding of the secret seed
    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn pub_key(&self) -> PubKey {
        PubKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(msg).to_bytes()
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKey")
            .field("pub_key", &self.pub_key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = NodeKey::generate();
        let sig = key.sign(b"challenge");
        assert!(key.pub_key().verify(b"challenge", &sig));
        assert!(!key.pub_key().verify(b"other", &sig));
        assert!(!key.pub_key().verify(b"challenge", &sig[..10]));
    }

    #[test]
    fn test_hex_roundtrip() {
        let key = NodeKey::generate();
        let restored = NodeKey::from_hex(&key.seed_hex()).unwrap();
        assert_eq!(key.pub_key(), restored.pub_key());
        assert!(NodeKey::from_hex("zz").is_err());
    }

    #[test]
    fn test_pubkey_serde() {
        let pk = NodeKey::generate().pub_key();
        let json = serde_json::to_string(&pk).unwrap();
        let back: PubKey = serde_json::from_str(&json).unwrap();
        assert_eq!(pk, back);
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node_key.txt");
        let first = NodeKey::load_or_generate("", &path).unwrap();
        assert!(path.exists());
        let second = NodeKey::load_or_generate("", &path).unwrap();
        assert_eq!(first.pub_key(), second.pub_key());

        let inline = NodeKey::load_or_generate(&first.seed_hex(), &path).unwrap();
        assert_eq!(inline.pub_key(), first.pub_key());
    }
}

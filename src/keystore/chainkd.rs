//! Chain-key-derivation extended keys
//!
//! An [`XPrv`] is a 32-byte Ed25519 scalar followed by a 32-byte chain code;
//! the matching [`XPub`] is the compressed public point followed by the same
//! chain code. Both support child derivation and the private key signs with
//! plain Ed25519 so any verifier can check the result against the xpub.

use crate::keystore::KeyStoreError;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::hazmat::{raw_sign, ExpandedSecretKey};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha512;
use std::fmt;

type HmacSha512 = Hmac<Sha512>;

/// Byte length of both extended key kinds
pub const EXTENDED_KEY_LEN: usize = 64;

fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> [u8; 64] {
    let mut mac = HmacSha512::new_from_slice(key).expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

fn prune_root_scalar(s: &mut [u8]) {
    s[0] &= 248;
    s[31] &= 31;
    s[31] |= 64;
}

fn prune_intermediate_scalar(f: &mut [u8]) {
    f[0] &= 248;
    f[29] &= 1;
    f[30] = 0;
    f[31] = 0;
}

fn scalar_of(bytes: &[u8]) -> Scalar {
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&bytes[..32]);
    Scalar::from_bytes_mod_order(buf)
}

/// Extended private key
#[derive(Clone, PartialEq, Eq)]
pub struct XPrv(pub [u8; EXTENDED_KEY_LEN]);

/// Extended public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct XPub(pub [u8; EXTENDED_KEY_LEN]);

impl XPrv {
    /// Derive a root key from seed material
    pub fn root(seed: &[u8]) -> Self {
        let mut h = hmac_sha512(b"Root", &[seed]);
        prune_root_scalar(&mut h[..32]);
        XPrv(h)
    }

    /// Generate a fresh random root key
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::root(&seed)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyStoreError> {
        let arr: [u8; EXTENDED_KEY_LEN] =
            bytes.try_into().map_err(|_| KeyStoreError::InvalidKeyLength)?;
        Ok(XPrv(arr))
    }

    pub fn as_bytes(&self) -> &[u8; EXTENDED_KEY_LEN] {
        &self.0
    }

    pub fn chain_code(&self) -> &[u8] {
        &self.0[32..]
    }

    /// The matching extended public key
    pub fn xpub(&self) -> XPub {
        let point = EdwardsPoint::mul_base(&scalar_of(&self.0)).compress();
        let mut out = [0u8; EXTENDED_KEY_LEN];
        out[..32].copy_from_slice(point.as_bytes());
        out[32..].copy_from_slice(self.chain_code());
        XPub(out)
    }

    /// Derive a child key. Hardened children cannot be derived from the xpub.
    pub fn child(&self, sel: &[u8], hardened: bool) -> XPrv {
        if hardened {
            let mut h = hmac_sha512(self.chain_code(), &[b"H", &self.0[..32], sel]);
            prune_root_scalar(&mut h[..32]);
            return XPrv(h);
        }

        let xpub = self.xpub();
        let mut h = hmac_sha512(self.chain_code(), &[b"N", &xpub.0[..32], sel]);
        prune_intermediate_scalar(&mut h[..32]);

        // 256-bit little-endian addition of the parent scalar
        let mut carry = 0u16;
        for i in 0..32 {
            let sum = self.0[i] as u16 + h[i] as u16 + carry;
            h[i] = sum as u8;
            carry = sum >> 8;
        }
        XPrv(h)
    }

    /// Derive along a path of non-hardened selectors
    pub fn derive_path(&self, path: &[Vec<u8>]) -> XPrv {
        path.iter()
            .fold(self.clone(), |key, sel| key.child(sel, false))
    }

    /// Sign a message with Ed25519 using the expanded form of this key
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        let expand = hmac_sha512(b"Expand", &[&self.0]);
        let mut hash_prefix = [0u8; 32];
        hash_prefix.copy_from_slice(&expand[32..]);
        let esk = ExpandedSecretKey {
            scalar: scalar_of(&self.0),
            hash_prefix,
        };
        let verifying_key = VerifyingKey::from(&esk);
        raw_sign::<Sha512>(&esk, msg, &verifying_key).to_bytes()
    }
}

impl fmt::Debug for XPrv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("XPrv(..)")
    }
}

impl XPub {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyStoreError> {
        let arr: [u8; EXTENDED_KEY_LEN] = bytes.try_into().map_err(|_| KeyStoreError::XPubFormat)?;
        Ok(XPub(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyStoreError> {
        let bytes = hex::decode(s).map_err(|_| KeyStoreError::XPubFormat)?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The 32-byte Ed25519 public key
    pub fn public_key(&self) -> [u8; 32] {
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&self.0[..32]);
        pk
    }

    pub fn chain_code(&self) -> &[u8] {
        &self.0[32..]
    }

    /// Derive a non-hardened child public key
    pub fn child(&self, sel: &[u8]) -> Result<XPub, KeyStoreError> {
        let mut h = hmac_sha512(self.chain_code(), &[b"N", &self.0[..32], sel]);
        prune_intermediate_scalar(&mut h[..32]);

        let offset = EdwardsPoint::mul_base(&scalar_of(&h));
        let parent = CompressedEdwardsY(self.public_key())
            .decompress()
            .ok_or(KeyStoreError::XPubFormat)?;
        let child = (parent + offset).compress();

        h[..32].copy_from_slice(child.as_bytes());
        Ok(XPub(h))
    }

    pub fn derive_path(&self, path: &[Vec<u8>]) -> Result<XPub, KeyStoreError> {
        path.iter().try_fold(*self, |key, sel| key.child(sel))
    }

    /// Verify a signature produced by [`XPrv::sign`]
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.public_key()) else {
            return false;
        };
        let Ok(sig) = <[u8; 64]>::try_from(sig) else {
            return false;
        };
        key.verify(msg, &Signature::from_bytes(&sig)).is_ok()
    }
}

impl fmt::Debug for XPub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XPub({})", self.to_hex())
    }
}

impl fmt::Display for XPub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for XPub {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for XPub {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        XPub::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_deterministic() {
        let a = XPrv::root(b"seed");
        let b = XPrv::root(b"seed");
        assert_eq!(a, b);
        assert_eq!(a.xpub(), b.xpub());
        assert_ne!(XPrv::root(b"other").xpub(), a.xpub());
    }

    #[test]
    fn test_root_scalar_is_pruned() {
        let key = XPrv::generate();
        assert_eq!(key.0[0] & 7, 0);
        assert_eq!(key.0[31] & 0xC0, 64);
    }

    #[test]
    fn test_sign_verify() {
        let key = XPrv::generate();
        let sig = key.sign(b"message");
        assert!(key.xpub().verify(b"message", &sig));
        assert!(!key.xpub().verify(b"tampered", &sig));
    }

    #[test]
    fn test_public_derivation_matches_private() {
        let root = XPrv::root(b"derivation");
        let path = vec![b"account".to_vec(), 7u64.to_le_bytes().to_vec()];

        let child_prv = root.derive_path(&path);
        let child_pub = root.xpub().derive_path(&path).unwrap();
        assert_eq!(child_prv.xpub(), child_pub);

        let sig = child_prv.sign(b"payload");
        assert!(child_pub.verify(b"payload", &sig));
    }

    #[test]
    fn test_hardened_child_differs() {
        let root = XPrv::root(b"hardened");
        let hard = root.child(b"0", true);
        let soft = root.child(b"0", false);
        assert_ne!(hard.xpub(), soft.xpub());
    }

    #[test]
    fn test_xpub_hex() {
        let xpub = XPrv::generate().xpub();
        assert_eq!(XPub::from_hex(&xpub.to_hex()).unwrap(), xpub);
        assert!(matches!(
            XPub::from_hex("abcd"),
            Err(KeyStoreError::XPubFormat)
        ));
    }
}

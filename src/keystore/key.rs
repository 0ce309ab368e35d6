//! Passphrase-encrypted keyfiles
//!
//! The on-disk format is a JSON document carrying the xpub in clear and the
//! xprv inside a crypto envelope: a scrypt or pbkdf2 derived key, AES-128-CTR
//! ciphertext and a SHA-256 MAC over the second half of the derived key and
//! the ciphertext.

use crate::crypto::sha256_concat;
use crate::keystore::chainkd::{XPrv, XPub};
use crate::keystore::KeyStoreError;
use aes::Aes128;
use chrono::Utc;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Type tag written into every keyfile
pub const KEY_TYPE: &str = "bytom_kd";

/// Keyfile format version
pub const KEY_VERSION: u32 = 1;

/// Standard scrypt cost (memory ~256MB)
pub const STANDARD_SCRYPT_N: u32 = 1 << 18;
pub const STANDARD_SCRYPT_P: u32 = 1;

/// Light scrypt cost for constrained devices and tests
pub const LIGHT_SCRYPT_N: u32 = 1 << 12;
pub const LIGHT_SCRYPT_P: u32 = 6;

const SCRYPT_R: u32 = 8;
const SCRYPT_DKLEN: usize = 32;
const CIPHER_NAME: &str = "aes-128-ctr";
const PBKDF2_PRF: &str = "hmac-sha256";

/// scrypt parameters as stored in `kdfparams`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScryptParams {
    pub n: u32,
    pub r: u32,
    pub p: u32,
    pub dklen: usize,
    pub salt: String,
}

/// pbkdf2 parameters as stored in `kdfparams`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pbkdf2Params {
    pub c: u32,
    pub prf: String,
    pub dklen: usize,
    pub salt: String,
}

/// Key derivation function and its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KdfParams {
    Scrypt(ScryptParams),
    Pbkdf2(Pbkdf2Params),
}

impl KdfParams {
    /// scrypt with a fresh random salt
    pub fn scrypt(n: u32, p: u32) -> Self {
        KdfParams::Scrypt(ScryptParams {
            n,
            r: SCRYPT_R,
            p,
            dklen: SCRYPT_DKLEN,
            salt: hex::encode(random_bytes::<32>()),
        })
    }

    /// pbkdf2-hmac-sha256 with a fresh random salt
    pub fn pbkdf2(c: u32) -> Self {
        KdfParams::Pbkdf2(Pbkdf2Params {
            c,
            prf: PBKDF2_PRF.to_string(),
            dklen: SCRYPT_DKLEN,
            salt: hex::encode(random_bytes::<32>()),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            KdfParams::Scrypt(_) => "scrypt",
            KdfParams::Pbkdf2(_) => "pbkdf2",
        }
    }

    fn parse(kdf: &str, params: &serde_json::Value) -> Result<Self, KeyStoreError> {
        match kdf {
            "scrypt" => Ok(KdfParams::Scrypt(serde_json::from_value(params.clone())?)),
            "pbkdf2" => {
                let params: Pbkdf2Params = serde_json::from_value(params.clone())?;
                if params.prf != PBKDF2_PRF {
                    return Err(KeyStoreError::InvalidKdf(format!(
                        "unsupported PBKDF2 PRF: {}",
                        params.prf
                    )));
                }
                Ok(KdfParams::Pbkdf2(params))
            }
            other => Err(KeyStoreError::InvalidKdf(format!("unsupported KDF: {}", other))),
        }
    }

    fn to_value(&self) -> Result<serde_json::Value, KeyStoreError> {
        Ok(match self {
            KdfParams::Scrypt(p) => serde_json::to_value(p)?,
            KdfParams::Pbkdf2(p) => serde_json::to_value(p)?,
        })
    }

    /// Derive the 32-byte key material from a passphrase
    pub fn derive(&self, auth: &str) -> Result<Vec<u8>, KeyStoreError> {
        match self {
            KdfParams::Scrypt(p) => {
                let salt = hex::decode(&p.salt)
                    .map_err(|_| KeyStoreError::InvalidKdf("salt is not hex".to_string()))?;
                if p.n < 2 || !p.n.is_power_of_two() {
                    return Err(KeyStoreError::InvalidKdf(format!(
                        "scrypt n must be a power of two, got {}",
                        p.n
                    )));
                }
                let log_n = p.n.trailing_zeros() as u8;
                let params = scrypt::Params::new(log_n, p.r, p.p, p.dklen)
                    .map_err(|e| KeyStoreError::InvalidKdf(e.to_string()))?;
                let mut out = vec![0u8; p.dklen];
                scrypt::scrypt(auth.as_bytes(), &salt, &params, &mut out)
                    .map_err(|e| KeyStoreError::InvalidKdf(e.to_string()))?;
                Ok(out)
            }
            KdfParams::Pbkdf2(p) => {
                let salt = hex::decode(&p.salt)
                    .map_err(|_| KeyStoreError::InvalidKdf("salt is not hex".to_string()))?;
                let mut out = vec![0u8; p.dklen];
                pbkdf2::pbkdf2_hmac::<Sha256>(auth.as_bytes(), &salt, p.c, &mut out);
                Ok(out)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherParamsJson {
    pub iv: String,
}

/// The `crypto` envelope of a keyfile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoJson {
    pub cipher: String,
    pub cipherparams: CipherParamsJson,
    pub ciphertext: String,
    pub kdf: String,
    pub kdfparams: serde_json::Value,
    pub mac: String,
}

/// A keyfile as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKeyJson {
    pub alias: String,
    /// Legacy keyfiles are indexed by a mined address instead of the xpub
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub crypto: CryptoJson,
    pub id: String,
    #[serde(rename = "type")]
    pub key_type: String,
    pub version: u32,
    pub xpub: String,
}

/// Decrypted key material
#[derive(Debug, Clone)]
pub struct XKey {
    pub id: String,
    pub key_type: String,
    pub alias: String,
    pub xprv: XPrv,
    pub xpub: XPub,
}

impl XKey {
    /// Create a key with a fresh random xprv
    pub fn generate(alias: &str) -> Self {
        Self::from_xprv(alias, XPrv::generate())
    }

    pub fn from_xprv(alias: &str, xprv: XPrv) -> Self {
        let xpub = xprv.xpub();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key_type: KEY_TYPE.to_string(),
            alias: alias.to_string(),
            xprv,
            xpub,
        }
    }
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

fn aes_ctr(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), KeyStoreError> {
    let mut cipher = Aes128Ctr::new_from_slices(key, iv)
        .map_err(|_| KeyStoreError::InvalidKdf("bad cipher key or iv length".to_string()))?;
    cipher.apply_keystream(data);
    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Encrypt a key with the given KDF parameters
pub fn encrypt_key_with(
    key: &XKey,
    auth: &str,
    kdf: KdfParams,
) -> Result<EncryptedKeyJson, KeyStoreError> {
    let derived = kdf.derive(auth)?;
    if derived.len() < 32 {
        return Err(KeyStoreError::InvalidKdf("dklen must be at least 32".to_string()));
    }
    let iv = random_bytes::<16>();
    let mut ciphertext = key.xprv.as_bytes().to_vec();
    aes_ctr(&derived[..16], &iv, &mut ciphertext)?;
    let mac = sha256_concat(&[&derived[16..32], &ciphertext]);

    Ok(EncryptedKeyJson {
        alias: key.alias.clone(),
        address: None,
        crypto: CryptoJson {
            cipher: CIPHER_NAME.to_string(),
            cipherparams: CipherParamsJson {
                iv: hex::encode(iv),
            },
            ciphertext: hex::encode(&ciphertext),
            kdf: kdf.name().to_string(),
            kdfparams: kdf.to_value()?,
            mac: hex::encode(mac),
        },
        id: key.id.clone(),
        key_type: key.key_type.clone(),
        version: KEY_VERSION,
        xpub: key.xpub.to_hex(),
    })
}

/// Encrypt a key with scrypt cost parameters `n` and `p`
pub fn encrypt_key(key: &XKey, auth: &str, scrypt_n: u32, scrypt_p: u32) -> Result<Vec<u8>, KeyStoreError> {
    let json = encrypt_key_with(key, auth, KdfParams::scrypt(scrypt_n, scrypt_p))?;
    Ok(serde_json::to_vec(&json)?)
}

/// Decrypt a parsed keyfile
pub fn decrypt_key_json(json: &EncryptedKeyJson, auth: &str) -> Result<XKey, KeyStoreError> {
    if json.key_type != KEY_TYPE {
        return Err(KeyStoreError::InvalidKeyType(json.key_type.clone()));
    }
    if json.version != KEY_VERSION {
        return Err(KeyStoreError::VersionUnsupported(json.version));
    }
    if json.crypto.cipher != CIPHER_NAME {
        return Err(KeyStoreError::InvalidKdf(format!(
            "unsupported cipher: {}",
            json.crypto.cipher
        )));
    }
    let xpub = XPub::from_hex(&json.xpub)?;

    let kdf = KdfParams::parse(&json.crypto.kdf, &json.crypto.kdfparams)?;
    let derived = kdf.derive(auth)?;
    if derived.len() < 32 {
        return Err(KeyStoreError::InvalidKdf("dklen must be at least 32".to_string()));
    }

    let mut data = hex::decode(&json.crypto.ciphertext).map_err(|_| KeyStoreError::Decrypt)?;
    let mac = hex::decode(&json.crypto.mac).map_err(|_| KeyStoreError::Decrypt)?;
    let iv = hex::decode(&json.crypto.cipherparams.iv).map_err(|_| KeyStoreError::Decrypt)?;

    let expected = sha256_concat(&[&derived[16..32], &data]);
    if !constant_time_eq(&expected, &mac) {
        return Err(KeyStoreError::Decrypt);
    }

    aes_ctr(&derived[..16], &iv, &mut data)?;
    let xprv = XPrv::from_slice(&data).map_err(|_| KeyStoreError::Decrypt)?;
    if xprv.xpub() != xpub {
        return Err(KeyStoreError::Decrypt);
    }

    Ok(XKey {
        id: json.id.clone(),
        key_type: json.key_type.clone(),
        alias: json.alias.clone(),
        xprv,
        xpub,
    })
}

/// Decrypt a keyfile from its raw JSON bytes
pub fn decrypt_key(data: &[u8], auth: &str) -> Result<XKey, KeyStoreError> {
    let json: EncryptedKeyJson = serde_json::from_slice(data)?;
    decrypt_key_json(&json, auth)
}

/// File name for a new keyfile: `UTC--<timestamp>--<alias>`
pub fn key_file_name(alias: &str) -> String {
    format!(
        "UTC--{}--{}",
        Utc::now().format("%Y-%m-%dT%H-%M-%S%.9fZ"),
        alias
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vector() -> (XKey, EncryptedKeyJson) {
        let key = XKey::from_xprv("testkey", XPrv::root(b"bytom test vector"));
        let kdf = KdfParams::Scrypt(ScryptParams {
            n: 2,
            r: 8,
            p: 1,
            dklen: 32,
            salt: "ea3a5a4f4dc1b30ad34c4b89c4b00eb1a5b4f3a4b4e5b5e3f08a9c6e3c50d4ed".to_string(),
        });
        let json = encrypt_key_with(&key, "bytomtest", kdf).unwrap();
        (key, json)
    }

    const FIXED_XPRV: &str = "50b2760fa7cb765c553c6c236469c4aed37f09f5cec47739d5e773a58b76fa4c\
                              ea2752372338699cdcc49c30613e6315db22fec76a8cd9ac832b8025b12c2d01";

    const FIXED_KEYFILE: &str = r#"{
        "alias": "testkey",
        "crypto": {
            "cipher": "aes-128-ctr",
            "cipherparams": { "iv": "3d4e8b1f0a6c2e5d7f9b1a3c5e7d9f0b" },
            "ciphertext": "39c5d4ca008ad8810f5505ce179f00c2ec5fdb9df432e7ea6b3acdfd2c0ce978246f820bfaa248fee57e99d5866c2684a5bd6f2db85aba328e2a260b8e3a274f",
            "kdf": "scrypt",
            "kdfparams": {
                "n": 2,
                "r": 8,
                "p": 1,
                "dklen": 32,
                "salt": "ea3a5a4f4dc1b30ad34c4b89c4b00eb1a5b4f3a4b4e5b5e3f08a9c6e3c50d4ed"
            },
            "mac": "352ed4fc427e74f53a4170d0fb19c0b43f09df7e297a0cf9e87c0898f6acb8ad"
        },
        "id": "1f6a7b3c-2d4e-4f50-8a61-7b8c9d0e1f2a",
        "type": "bytom_kd",
        "version": 1,
        "xpub": "c6124675f83cc501f02f19aa51f7c7ba6f843af4d01a2fff4cecb6bd7545af96ea2752372338699cdcc49c30613e6315db22fec76a8cd9ac832b8025b12c2d01"
    }"#;

    #[test]
    fn test_fixed_keyfile_decrypts() {
        let key = decrypt_key(FIXED_KEYFILE.as_bytes(), "bytomtest").unwrap();
        assert_eq!(hex::encode(key.xprv.as_bytes()), FIXED_XPRV);
        assert_eq!(key.alias, "testkey");
        assert_eq!(key.id, "1f6a7b3c-2d4e-4f50-8a61-7b8c9d0e1f2a");
        assert_eq!(key.xprv, XPrv::root(b"bytom test vector"));
    }

    #[test]
    fn test_fixed_keyfile_wrong_passphrase() {
        assert!(matches!(
            decrypt_key(FIXED_KEYFILE.as_bytes(), "bytomtestbad"),
            Err(KeyStoreError::Decrypt)
        ));
    }

    #[test]
    fn test_scrypt_roundtrip() {
        let (key, json) = test_vector();
        let decrypted = decrypt_key_json(&json, "bytomtest").unwrap();
        assert_eq!(decrypted.xprv, key.xprv);
        assert_eq!(decrypted.xpub, key.xpub);
        assert_eq!(decrypted.alias, "testkey");
    }

    #[test]
    fn test_wrong_passphrase_is_decrypt_error() {
        let (_, json) = test_vector();
        assert!(matches!(
            decrypt_key_json(&json, "bytomtestbad"),
            Err(KeyStoreError::Decrypt)
        ));
    }

    #[test]
    fn test_reencrypt_differs_but_roundtrips() {
        let (key, json) = test_vector();
        let again = encrypt_key_with(&key, "bytomtest", KdfParams::scrypt(2, 1)).unwrap();
        assert_ne!(again.crypto.ciphertext, json.crypto.ciphertext);
        assert_eq!(decrypt_key_json(&again, "bytomtest").unwrap().xprv, key.xprv);
    }

    #[test]
    fn test_pbkdf2_roundtrip() {
        let key = XKey::generate("pb");
        let json = encrypt_key_with(&key, "secret", KdfParams::pbkdf2(1024)).unwrap();
        assert_eq!(json.crypto.kdf, "pbkdf2");
        assert_eq!(json.crypto.kdfparams["prf"], "hmac-sha256");
        assert_eq!(decrypt_key_json(&json, "secret").unwrap().xprv, key.xprv);
    }

    #[test]
    fn test_unknown_kdf_field_rejected() {
        let (_, mut json) = test_vector();
        json.crypto.kdfparams["extra"] = serde_json::json!(1);
        assert!(decrypt_key_json(&json, "bytomtest").is_err());
    }

    #[test]
    fn test_wrong_type_and_version() {
        let (_, json) = test_vector();
        let mut bad_type = json.clone();
        bad_type.key_type = "other".to_string();
        assert!(matches!(
            decrypt_key_json(&bad_type, "bytomtest"),
            Err(KeyStoreError::InvalidKeyType(_))
        ));

        let mut bad_version = json;
        bad_version.version = 3;
        assert!(matches!(
            decrypt_key_json(&bad_version, "bytomtest"),
            Err(KeyStoreError::VersionUnsupported(3))
        ));
    }

    #[test]
    fn test_key_file_name_format() {
        let name = key_file_name("alice");
        assert!(name.starts_with("UTC--"));
        assert!(name.ends_with("Z--alice"));
    }

    #[test]
    fn test_json_field_names() {
        let (_, json) = test_vector();
        let value = serde_json::to_value(&json).unwrap();
        assert_eq!(value["type"], "bytom_kd");
        assert_eq!(value["version"], 1);
        assert_eq!(value["crypto"]["cipher"], "aes-128-ctr");
        assert_eq!(value["crypto"]["kdfparams"]["n"], 2);
        assert!(value.get("address").is_none());
    }
}

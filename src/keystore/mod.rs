//! Pseudo-HSM key store
//!
//! Extended private keys are kept on disk as passphrase-encrypted keyfiles
//! under one directory. The [`Hsm`] creates, lists, signs with, re-encrypts
//! and deletes them; a [`KeyCache`] indexes the directory by xpub.

pub mod cache;
pub mod chainkd;
pub mod key;
pub mod watch;

pub use cache::{KeyCache, KeyIdentity, KeyQuery, KeyRecord, LegacyAddress, MIN_RELOAD_INTERVAL};
pub use chainkd::{XPrv, XPub};
pub use key::{
    decrypt_key, encrypt_key, key_file_name, KdfParams, XKey, LIGHT_SCRYPT_N, LIGHT_SCRYPT_P,
    STANDARD_SCRYPT_N, STANDARD_SCRYPT_P,
};

use crate::storage::write_atomic;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Key store errors
#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("no key for given address or file")]
    NoKey,
    #[error("multiple keys match identity {identity}: {matches:?}")]
    AmbiguousKey {
        identity: String,
        matches: Vec<PathBuf>,
    },
    #[error("duplicate key alias")]
    DuplicateAlias,
    #[error("could not decrypt key with given passphrase")]
    Decrypt,
    #[error("xpub format error")]
    XPubFormat,
    #[error("key type stored invalid: {0}")]
    InvalidKeyType(String),
    #[error("version not supported: {0}")]
    VersionUnsupported(u32),
    #[error("invalid key alias")]
    InvalidAlias,
    #[error("invalid key derivation: {0}")]
    InvalidKdf(String),
    #[error("invalid extended key length")]
    InvalidKeyLength,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Public view of a stored key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct XPubInfo {
    pub alias: String,
    pub xpub: XPub,
    pub file: PathBuf,
}

impl From<KeyRecord<XPub>> for XPubInfo {
    fn from(record: KeyRecord<XPub>) -> Self {
        Self {
            alias: record.alias,
            xpub: record.identity,
            file: record.file,
        }
    }
}

/// Pseudo hardware security module backed by a keyfile directory
pub struct Hsm {
    key_dir: PathBuf,
    cache: KeyCache<XPub>,
    scrypt_n: u32,
    scrypt_p: u32,
    write_lock: Mutex<()>,
}

impl Hsm {
    /// Open a key store with standard scrypt parameters
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self::with_scrypt(key_dir, STANDARD_SCRYPT_N, STANDARD_SCRYPT_P)
    }

    /// Open a key store with light scrypt parameters
    pub fn new_light(key_dir: impl Into<PathBuf>) -> Self {
        Self::with_scrypt(key_dir, LIGHT_SCRYPT_N, LIGHT_SCRYPT_P)
    }

    pub fn with_scrypt(key_dir: impl Into<PathBuf>, scrypt_n: u32, scrypt_p: u32) -> Self {
        let key_dir = key_dir.into();
        Self {
            cache: KeyCache::new(key_dir.clone()),
            key_dir,
            scrypt_n,
            scrypt_p,
            write_lock: Mutex::new(()),
        }
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    pub fn cache(&self) -> &KeyCache<XPub> {
        &self.cache
    }

    fn normalize_alias(alias: &str) -> Result<String, KeyStoreError> {
        let alias = alias.trim().to_lowercase();
        if alias.is_empty() || alias.contains(['/', '\\']) {
            return Err(KeyStoreError::InvalidAlias);
        }
        Ok(alias)
    }

    /// Create a new random key under `alias`
    pub fn xcreate(&self, alias: &str, auth: &str) -> Result<XPubInfo, KeyStoreError> {
        let alias = Self::normalize_alias(alias)?;
        self.store_new_key(XKey::generate(&alias), auth)
    }

    /// Import an existing xprv under `alias`
    pub fn import_key(&self, alias: &str, xprv: XPrv, auth: &str) -> Result<XPubInfo, KeyStoreError> {
        let alias = Self::normalize_alias(alias)?;
        if self.has_key(&xprv.xpub()) {
            return Err(KeyStoreError::DuplicateAlias);
        }
        self.store_new_key(XKey::from_xprv(&alias, xprv), auth)
    }

    fn store_new_key(&self, key: XKey, auth: &str) -> Result<XPubInfo, KeyStoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if self.has_alias(&key.alias) {
            return Err(KeyStoreError::DuplicateAlias);
        }

        let file = self.key_dir.join(key_file_name(&key.alias));
        self.store_key(&file, &key, auth)?;

        let record = KeyRecord {
            identity: key.xpub,
            alias: key.alias.clone(),
            file,
        };
        self.cache.add(record.clone());
        log::info!("Created key {} ({})", key.alias, key.xpub);
        Ok(record.into())
    }

    fn store_key(&self, file: &Path, key: &XKey, auth: &str) -> Result<(), KeyStoreError> {
        let data = encrypt_key(key, auth, self.scrypt_n, self.scrypt_p)?;
        write_atomic(file, &data)?;
        Ok(())
    }

    /// All stored keys sorted by file path
    pub fn list_keys(&self) -> Vec<XPubInfo> {
        self.cache.list().into_iter().map(Into::into).collect()
    }

    pub fn has_alias(&self, alias: &str) -> bool {
        let alias = alias.trim().to_lowercase();
        self.cache.list().iter().any(|r| r.alias == alias)
    }

    pub fn has_key(&self, xpub: &XPub) -> bool {
        self.cache.has(xpub)
    }

    /// Decrypt the key stored for `xpub`
    pub fn load_key(&self, xpub: &XPub, auth: &str) -> Result<XKey, KeyStoreError> {
        let record = self.cache.find(&KeyQuery::by_identity(*xpub))?;
        let data = fs::read(&record.file)?;
        let key = decrypt_key(&data, auth)?;
        if key.xpub != *xpub {
            return Err(KeyStoreError::NoKey);
        }
        Ok(key)
    }

    /// Sign `msg` with the key for `xpub`, derived along `path`
    pub fn xsign(
        &self,
        xpub: &XPub,
        path: &[Vec<u8>],
        msg: &[u8],
        auth: &str,
    ) -> Result<[u8; 64], KeyStoreError> {
        let key = self.load_key(xpub, auth)?;
        let signer = if path.is_empty() {
            key.xprv
        } else {
            key.xprv.derive_path(path)
        };
        Ok(signer.sign(msg))
    }

    /// Delete the key for `xpub` after verifying the passphrase
    pub fn xdelete(&self, xpub: &XPub, auth: &str) -> Result<(), KeyStoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let record = self.cache.find(&KeyQuery::by_identity(*xpub))?;
        let data = fs::read(&record.file)?;
        decrypt_key(&data, auth)?;

        fs::remove_file(&record.file)?;
        self.cache.delete(&record);
        log::info!("Deleted key {} ({})", record.alias, xpub);
        Ok(())
    }

    /// Re-encrypt the key for `xpub` under a new passphrase
    pub fn reset_password(&self, xpub: &XPub, old_auth: &str, new_auth: &str) -> Result<(), KeyStoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let record = self.cache.find(&KeyQuery::by_identity(*xpub))?;
        let data = fs::read(&record.file)?;
        let key = decrypt_key(&data, old_auth)?;
        self.store_key(&record.file, &key, new_auth)
    }

    /// Stop watching the key directory
    pub fn close(&self) {
        self.cache.close();
    }
}

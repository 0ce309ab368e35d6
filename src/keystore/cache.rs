//! In-memory index of the keyfiles in a key directory
//!
//! The cache is generic over its identity column: current keyfiles are
//! indexed by xpub, legacy ones by a mined address. It keeps a list sorted by
//! file path for stable iteration plus an identity map that permits
//! duplicates, and stays fresh through directory notifications or, when
//! those are unavailable, through throttled rescans.

use crate::keystore::chainkd::XPub;
use crate::keystore::watch::KeyDirWatcher;
use crate::keystore::KeyStoreError;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

/// Minimum interval between two rescans when no watcher is running
pub const MIN_RELOAD_INTERVAL: Duration = Duration::from_secs(2);

/// The fields of a keyfile the cache needs; the envelope is not parsed
#[derive(Debug, Deserialize)]
pub struct KeyFileHeader {
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub xpub: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// The identity column a cache is indexed by
pub trait KeyIdentity: Clone + Eq + Hash + Ord + fmt::Display + Send + Sync + 'static {
    fn from_header(header: &KeyFileHeader) -> Option<Self>;
}

impl KeyIdentity for XPub {
    fn from_header(header: &KeyFileHeader) -> Option<Self> {
        header.xpub.as_deref().and_then(|s| XPub::from_hex(s).ok())
    }
}

/// Legacy keyfiles carry a mined address instead of an xpub
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LegacyAddress(pub String);

impl fmt::Display for LegacyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl KeyIdentity for LegacyAddress {
    fn from_header(header: &KeyFileHeader) -> Option<Self> {
        header
            .address
            .as_ref()
            .filter(|a| !a.is_empty())
            .map(|a| LegacyAddress(a.clone()))
    }
}

/// One cached keyfile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord<I> {
    pub identity: I,
    pub alias: String,
    pub file: PathBuf,
}

/// A `find` query; at least one of the fields should be set
#[derive(Debug, Clone)]
pub struct KeyQuery<I> {
    pub identity: Option<I>,
    pub file: Option<PathBuf>,
}

impl<I> KeyQuery<I> {
    pub fn by_identity(identity: I) -> Self {
        Self {
            identity: Some(identity),
            file: None,
        }
    }

    pub fn by_file(file: impl Into<PathBuf>) -> Self {
        Self {
            identity: None,
            file: Some(file.into()),
        }
    }
}

struct CacheInner<I> {
    all: Vec<KeyRecord<I>>,
    by_identity: HashMap<I, Vec<KeyRecord<I>>>,
    watcher: Option<KeyDirWatcher>,
    next_reload: Option<Instant>,
    closed: bool,
}

impl<I: KeyIdentity> CacheInner<I> {
    fn replace_all(&mut self, records: Vec<KeyRecord<I>>) {
        self.all.clear();
        self.by_identity.clear();
        for record in records {
            self.insert(record);
        }
    }

    fn insert(&mut self, record: KeyRecord<I>) {
        let pos = self.all.partition_point(|r| r.file < record.file);
        if self.all[pos..]
            .iter()
            .take_while(|r| r.file == record.file)
            .any(|r| r.identity == record.identity)
        {
            return;
        }
        self.all.insert(pos, record.clone());
        self.by_identity
            .entry(record.identity.clone())
            .or_default()
            .push(record);
    }

    fn remove(&mut self, record: &KeyRecord<I>) {
        self.all
            .retain(|r| !(r.file == record.file && r.identity == record.identity));
        if let Some(list) = self.by_identity.get_mut(&record.identity) {
            list.retain(|r| r.file != record.file);
            if list.is_empty() {
                self.by_identity.remove(&record.identity);
            }
        }
    }
}

/// Cache of the keyfiles in one directory
pub struct KeyCache<I: KeyIdentity> {
    key_dir: PathBuf,
    reload_interval: Duration,
    use_watcher: bool,
    inner: Arc<Mutex<CacheInner<I>>>,
}

impl<I: KeyIdentity> KeyCache<I> {
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self::with_options(key_dir, MIN_RELOAD_INTERVAL, true)
    }

    /// Build a cache with explicit reload policy. With `use_watcher` false
    /// freshness relies only on rescans every `reload_interval`.
    pub fn with_options(key_dir: impl Into<PathBuf>, reload_interval: Duration, use_watcher: bool) -> Self {
        Self {
            key_dir: key_dir.into(),
            reload_interval,
            use_watcher,
            inner: Arc::new(Mutex::new(CacheInner {
                all: Vec::new(),
                by_identity: HashMap::new(),
                watcher: None,
                next_reload: None,
                closed: false,
            })),
        }
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<I>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether any keyfile carries `identity`
    pub fn has(&self, identity: &I) -> bool {
        self.maybe_reload();
        self.lock().by_identity.contains_key(identity)
    }

    /// Insert a record, ignoring exact duplicates
    pub fn add(&self, record: KeyRecord<I>) {
        self.lock().insert(record);
    }

    /// Remove a record from the list and the identity map
    pub fn delete(&self, record: &KeyRecord<I>) {
        self.lock().remove(record);
    }

    /// Snapshot of all records sorted by file path
    pub fn list(&self) -> Vec<KeyRecord<I>> {
        self.maybe_reload();
        self.lock().all.clone()
    }

    /// Resolve a query to exactly one record
    pub fn find(&self, query: &KeyQuery<I>) -> Result<KeyRecord<I>, KeyStoreError> {
        let file = query.file.as_ref().map(|f| {
            if f.parent().map_or(true, |p| p.as_os_str().is_empty()) {
                self.key_dir.join(f)
            } else {
                f.clone()
            }
        });

        let inner = self.lock();
        let candidates: Vec<KeyRecord<I>> = match &query.identity {
            Some(identity) => inner
                .by_identity
                .get(identity)
                .cloned()
                .unwrap_or_default(),
            None => inner.all.clone(),
        };
        drop(inner);

        if let Some(file) = file {
            return candidates
                .into_iter()
                .find(|r| r.file == file)
                .ok_or(KeyStoreError::NoKey);
        }

        match candidates.len() {
            0 => Err(KeyStoreError::NoKey),
            1 => Ok(candidates.into_iter().next().ok_or(KeyStoreError::NoKey)?),
            _ => Err(KeyStoreError::AmbiguousKey {
                identity: query
                    .identity
                    .as_ref()
                    .map(|i| i.to_string())
                    .unwrap_or_default(),
                matches: candidates.into_iter().map(|r| r.file).collect(),
            }),
        }
    }

    /// Rescan unless a watcher keeps the cache current or a rescan happened
    /// within the reload interval.
    pub fn maybe_reload(&self) {
        let mut inner = self.lock();
        if inner.closed || inner.watcher.is_some() {
            return;
        }
        if let Some(next) = inner.next_reload {
            if Instant::now() < next {
                return;
            }
        }

        if self.use_watcher {
            let weak = Arc::downgrade(&self.inner);
            let dir = self.key_dir.clone();
            match KeyDirWatcher::start(&self.key_dir, move || Self::reload_weak(&weak, &dir)) {
                Ok(watcher) => inner.watcher = Some(watcher),
                Err(e) => log::debug!("Key directory watcher unavailable: {}", e),
            }
        }

        let records = scan_key_dir::<I>(&self.key_dir);
        inner.replace_all(records);
        inner.next_reload = Some(Instant::now() + self.reload_interval);
    }

    fn reload_weak(weak: &Weak<Mutex<CacheInner<I>>>, dir: &Path) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let records = scan_key_dir::<I>(dir);
        let mut inner = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !inner.closed {
            inner.replace_all(records);
        }
    }

    /// Unconditionally rescan the key directory
    pub fn reload(&self) {
        let records = scan_key_dir::<I>(&self.key_dir);
        let mut inner = self.lock();
        inner.replace_all(records);
        inner.next_reload = Some(Instant::now() + self.reload_interval);
    }

    /// Whether a directory watcher is currently running
    pub fn watching(&self) -> bool {
        self.lock().watcher.is_some()
    }

    /// Stop the watcher and drop all records
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.watcher = None;
        inner.closed = true;
        inner.all.clear();
        inner.by_identity.clear();
    }
}

/// Read every keyfile in `dir`. Unreadable or unparsable files are skipped.
pub fn scan_key_dir<I: KeyIdentity>(dir: &Path) -> Vec<KeyRecord<I>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to read key directory {}: {}", dir.display(), e);
            }
            return Vec::new();
        }
    };

    let mut records = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name.ends_with('~') {
            continue;
        }
        let path = entry.path();
        match entry.metadata() {
            Ok(meta) if meta.is_file() => {}
            _ => continue,
        }

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                log::debug!("Skipping keyfile {}: {}", path.display(), e);
                continue;
            }
        };
        let header: KeyFileHeader = match serde_json::from_slice(&data) {
            Ok(header) => header,
            Err(e) => {
                log::debug!("Skipping keyfile {}: {}", path.display(), e);
                continue;
            }
        };
        match I::from_header(&header) {
            Some(identity) => records.push(KeyRecord {
                identity,
                alias: header.alias,
                file: path,
            }),
            None => log::debug!("Skipping keyfile {}: no identity", path.display()),
        }
    }

    records.sort_by(|a, b| a.file.cmp(&b.file));
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::chainkd::XPrv;

    fn write_keyfile(dir: &Path, name: &str, alias: &str, xpub: &XPub) {
        let body = serde_json::json!({
            "alias": alias,
            "xpub": xpub.to_hex(),
            "type": "bytom_kd",
            "version": 1,
        });
        fs::write(dir.join(name), serde_json::to_vec(&body).unwrap()).unwrap();
    }

    fn record(dir: &Path, name: &str, xpub: XPub) -> KeyRecord<XPub> {
        KeyRecord {
            identity: xpub,
            alias: name.to_string(),
            file: dir.join(name),
        }
    }

    #[test]
    fn test_add_delete_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let cache: KeyCache<XPub> = KeyCache::with_options(dir.path(), MIN_RELOAD_INTERVAL, false);
        let a = record(dir.path(), "a", XPrv::generate().xpub());
        cache.add(a.clone());
        let before = cache.lock().all.clone();

        let b = record(dir.path(), "b", XPrv::generate().xpub());
        cache.add(b.clone());
        cache.add(b.clone());
        assert_eq!(cache.lock().all.len(), 2);
        cache.delete(&b);

        let inner = cache.lock();
        assert_eq!(inner.all, before);
        assert!(!inner.by_identity.contains_key(&b.identity));
        assert!(inner.by_identity.contains_key(&a.identity));
    }

    #[test]
    fn test_list_sorted_by_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache: KeyCache<XPub> = KeyCache::with_options(dir.path(), MIN_RELOAD_INTERVAL, false);
        for name in ["c", "a", "b"] {
            cache.add(record(dir.path(), name, XPrv::generate().xpub()));
        }
        let files: Vec<_> = cache.lock().all.iter().map(|r| r.alias.clone()).collect();
        assert_eq!(files, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_find_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let cache: KeyCache<XPub> = KeyCache::with_options(dir.path(), MIN_RELOAD_INTERVAL, false);
        let shared = XPrv::generate().xpub();
        let unique = XPrv::generate().xpub();
        cache.add(record(dir.path(), "dup1", shared));
        cache.add(record(dir.path(), "dup2", shared));
        cache.add(record(dir.path(), "one", unique));

        let found = cache.find(&KeyQuery::by_identity(unique)).unwrap();
        assert_eq!(found.alias, "one");

        match cache.find(&KeyQuery::by_identity(shared)) {
            Err(KeyStoreError::AmbiguousKey { matches, .. }) => assert_eq!(matches.len(), 2),
            other => panic!("expected ambiguous key, got {:?}", other),
        }

        let query = KeyQuery {
            identity: Some(shared),
            file: Some(PathBuf::from("dup2")),
        };
        assert_eq!(cache.find(&query).unwrap().alias, "dup2");

        let missing = KeyQuery::by_file("nothing");
        assert!(matches!(cache.find(&missing), Err(KeyStoreError::NoKey)));

        let absent = KeyQuery::by_identity(XPrv::generate().xpub());
        assert!(matches!(cache.find(&absent), Err(KeyStoreError::NoKey)));
    }

    #[test]
    fn test_scan_skips_hidden_backup_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let good = XPrv::generate().xpub();
        write_keyfile(dir.path(), "UTC--good--k", "k", &good);
        write_keyfile(dir.path(), ".hidden", "h", &XPrv::generate().xpub());
        write_keyfile(dir.path(), "backup~", "b", &XPrv::generate().xpub());
        fs::write(dir.path().join("garbage"), b"not json").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let records = scan_key_dir::<XPub>(dir.path());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identity, good);
    }

    #[test]
    fn test_throttled_reload() {
        let dir = tempfile::tempdir().unwrap();
        let cache: KeyCache<XPub> =
            KeyCache::with_options(dir.path(), Duration::from_millis(100), false);
        let xpub = XPrv::generate().xpub();

        assert!(!cache.has(&xpub));
        write_keyfile(dir.path(), "UTC--late--k", "k", &xpub);
        // Suppressed by the throttle window
        assert!(!cache.has(&xpub));

        std::thread::sleep(Duration::from_millis(150));
        assert!(cache.has(&xpub));
    }

    #[test]
    fn test_legacy_address_identity() {
        let dir = tempfile::tempdir().unwrap();
        let body = serde_json::json!({ "alias": "old", "address": "bm1qlegacy" });
        fs::write(dir.path().join("legacy"), serde_json::to_vec(&body).unwrap()).unwrap();
        write_keyfile(dir.path(), "modern", "new", &XPrv::generate().xpub());

        let cache: KeyCache<LegacyAddress> =
            KeyCache::with_options(dir.path(), MIN_RELOAD_INTERVAL, false);
        assert!(cache.has(&LegacyAddress("bm1qlegacy".to_string())));
        assert_eq!(cache.list().len(), 1);
    }

    #[test]
    fn test_close_clears() {
        let dir = tempfile::tempdir().unwrap();
        write_keyfile(dir.path(), "k", "k", &XPrv::generate().xpub());
        let cache: KeyCache<XPub> = KeyCache::with_options(dir.path(), MIN_RELOAD_INTERVAL, false);
        assert_eq!(cache.list().len(), 1);
        cache.close();
        assert!(cache.list().is_empty());
    }
}

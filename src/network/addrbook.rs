//! Address book for peer selection
//!
//! Bitcoin-style address manager that classifies addresses as:
//! - New: heard about from other peers but never connected
//! - Old (tried): connected to successfully at least once
//!
//! Bucket placement hashes the network group of the address and of the peer
//! that told us about it with a secret key, so an attacker controlling a few
//! networks can only fill a few buckets.

use crate::crypto::double_sha256;
use crate::network::known_address::{BucketType, KnownAddress};
use crate::network::netaddress::NetAddress;
use crate::storage::{JsonFile, StorageError};
use rand::seq::{IteratorRandom, SliceRandom};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

// =============================================================================
// Constants
// =============================================================================

/// Number of buckets for new addresses
pub const NEW_BUCKET_COUNT: usize = 256;

/// Number of entries per new bucket
pub const NEW_BUCKET_SIZE: usize = 64;

/// Number of buckets for tried addresses
pub const OLD_BUCKET_COUNT: usize = 64;

/// Number of entries per tried bucket
pub const OLD_BUCKET_SIZE: usize = 64;

/// New buckets a single source group can spread addresses over
const NEW_BUCKETS_PER_GROUP: u64 = 32;

/// Tried buckets a single address group can land in
const OLD_BUCKETS_PER_GROUP: u64 = 4;

/// Maximum number of new buckets holding the same address
pub const MAX_NEW_BUCKETS_PER_ADDRESS: usize = 4;

/// Below this size the book asks peers for more addresses
pub const NEED_ADDRESS_THRESHOLD: usize = 1000;

/// Share of the book returned by [`AddrBook::get_selection`]
const GET_SELECTION_PERCENT: usize = 23;
const MIN_GET_SELECTION: usize = 32;
pub const MAX_GET_SELECTION: usize = 250;

/// How often the saver persists the book
pub const DUMP_ADDRESS_INTERVAL: Duration = Duration::from_secs(2 * 60);

const KEY_LEN: usize = 24;

// =============================================================================
// Errors
// =============================================================================

/// Address book errors
#[derive(Error, Debug)]
pub enum AddrBookError {
    #[error("cannot add non-routable address {0}")]
    NotRoutable(NetAddress),
    #[error("cannot add ourselves with address {0}")]
    AddSelf(NetAddress),
    #[error("cannot add nil address")]
    NilAddress,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<StorageError> for AddrBookError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::IoError(e) => AddrBookError::IoError(e),
            StorageError::SerializationError(e) => AddrBookError::SerializationError(e),
        }
    }
}

/// On-disk form of the book
#[derive(Debug, Serialize, Deserialize)]
struct AddrBookJson {
    key: String,
    addrs: Vec<KnownAddress>,
}

// =============================================================================
// Address Book
// =============================================================================

/// Shared handle used by the switch and the PEX reactor
pub type SharedAddrBook = Arc<RwLock<AddrBook>>;

/// Bucketed address book
#[derive(Debug)]
pub struct AddrBook {
    file: JsonFile,
    /// Hex of the random secret mixed into bucket hashes
    key: String,
    routability_strict: bool,
    our_addrs: HashSet<NetAddress>,
    addr_lookup: HashMap<NetAddress, KnownAddress>,
    buckets_new: Vec<HashSet<NetAddress>>,
    buckets_old: Vec<HashSet<NetAddress>>,
    n_old: usize,
    n_new: usize,
}

impl AddrBook {
    /// Create an empty book persisted at `file_path`
    pub fn new(file_path: impl Into<PathBuf>, routability_strict: bool) -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self {
            file: JsonFile::new(file_path),
            key: hex::encode(key),
            routability_strict,
            our_addrs: HashSet::new(),
            addr_lookup: HashMap::new(),
            buckets_new: vec![HashSet::new(); NEW_BUCKET_COUNT],
            buckets_old: vec![HashSet::new(); OLD_BUCKET_COUNT],
            n_old: 0,
            n_new: 0,
        }
    }

    /// Create a book and load any state saved at `file_path`
    pub fn open(file_path: impl Into<PathBuf>, routability_strict: bool) -> Result<Self, AddrBookError> {
        let mut book = Self::new(file_path, routability_strict);
        book.load()?;
        Ok(book)
    }

    pub fn into_shared(self) -> SharedAddrBook {
        Arc::new(RwLock::new(self))
    }

    /// Register one of our own addresses so it is never added
    pub fn add_our_address(&mut self, addr: NetAddress) {
        log::info!("Add our address to book: {}", addr);
        self.our_addrs.insert(addr);
    }

    pub fn our_addresses(&self) -> Vec<NetAddress> {
        self.our_addrs.iter().copied().collect()
    }

    pub fn is_our_address(&self, addr: &NetAddress) -> bool {
        self.our_addrs.contains(addr)
    }

    /// Add an address heard from `src`
    pub fn add_address(&mut self, addr: NetAddress, src: NetAddress) -> Result<(), AddrBookError> {
        if addr.is_nil() || src.is_nil() {
            return Err(AddrBookError::NilAddress);
        }
        if self.routability_strict && !addr.is_routable() {
            return Err(AddrBookError::NotRoutable(addr));
        }
        if self.our_addrs.contains(&addr) {
            return Err(AddrBookError::AddSelf(addr));
        }

        let ka = match self.addr_lookup.get(&addr) {
            Some(existing) => {
                if existing.is_old() || existing.buckets.len() >= MAX_NEW_BUCKETS_PER_ADDRESS {
                    return Ok(());
                }
                // The more buckets already hold it, the less likely we add more
                let factor = 2 * existing.buckets.len().max(1);
                if rand::thread_rng().gen_range(0..factor) != 0 {
                    return Ok(());
                }
                existing.clone()
            }
            None => KnownAddress::new(addr, src),
        };

        let bucket = self.calc_new_bucket(&addr, &src);
        self.add_to_new_bucket(ka, bucket);
        Ok(())
    }

    /// Remove an address from every bucket
    pub fn remove_address(&mut self, addr: &NetAddress) {
        if let Some(ka) = self.addr_lookup.get(addr).cloned() {
            log::debug!("Remove address from book: {}", addr);
            self.remove_from_all_buckets(&ka);
        }
    }

    /// Record a successful connection, promoting the address to tried
    pub fn mark_good(&mut self, addr: &NetAddress) {
        let Some(ka) = self.addr_lookup.get_mut(addr) else {
            return;
        };
        ka.mark_good();
        if ka.is_new() {
            self.move_to_old(addr);
        }
    }

    /// Record a connection attempt
    pub fn mark_attempt(&mut self, addr: &NetAddress) {
        if let Some(ka) = self.addr_lookup.get_mut(addr) {
            ka.mark_attempt();
        }
    }

    /// Drop an address that misbehaved
    pub fn mark_bad(&mut self, addr: &NetAddress) {
        self.remove_address(addr);
    }

    pub fn lookup(&self, addr: &NetAddress) -> Option<&KnownAddress> {
        self.addr_lookup.get(addr)
    }

    pub fn has_address(&self, addr: &NetAddress) -> bool {
        self.addr_lookup.contains_key(addr)
    }

    pub fn size(&self) -> usize {
        self.addr_lookup.len()
    }

    pub fn new_count(&self) -> usize {
        self.n_new
    }

    pub fn old_count(&self) -> usize {
        self.n_old
    }

    pub fn need_more_addrs(&self) -> bool {
        self.size() < NEED_ADDRESS_THRESHOLD
    }

    /// Pick an address to dial
    ///
    /// `bias` in 0..=100 weights the choice toward new (100) or tried (0)
    /// addresses, scaled by the square root of each table's size.
    pub fn pick_address(&self, bias: u32) -> Option<NetAddress> {
        if self.size() == 0 {
            return None;
        }
        let bias = bias.min(100) as f64;
        let mut rng = rand::thread_rng();

        let old_correlation = (self.n_old as f64).sqrt() * (100.0 - bias);
        let new_correlation = (self.n_new as f64).sqrt() * bias;
        let mut pick_old = (old_correlation + new_correlation) * rng.gen::<f64>() < old_correlation;
        if pick_old && self.n_old == 0 {
            pick_old = false;
        } else if !pick_old && self.n_new == 0 {
            pick_old = true;
        }

        let buckets = if pick_old { &self.buckets_old } else { &self.buckets_new };
        let bucket = buckets.iter().filter(|b| !b.is_empty()).choose(&mut rng)?;
        bucket.iter().choose(&mut rng).copied()
    }

    /// A random sample of the book for peer exchange
    pub fn get_selection(&self) -> Vec<NetAddress> {
        let mut all: Vec<NetAddress> = self.addr_lookup.keys().copied().collect();
        let total = all.len();
        let count = (total * GET_SELECTION_PERCENT / 100)
            .max(MIN_GET_SELECTION.min(total))
            .min(MAX_GET_SELECTION);

        all.shuffle(&mut rand::thread_rng());
        all.truncate(count);
        all
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    pub fn file_path(&self) -> &std::path::Path {
        self.file.path()
    }

    /// Write the book to its file
    pub fn save(&self) -> Result<(), AddrBookError> {
        let json = AddrBookJson {
            key: self.key.clone(),
            addrs: self.addr_lookup.values().cloned().collect(),
        };
        self.file.save(&json)?;
        log::debug!("Saved {} addresses to {}", json.addrs.len(), self.file.path().display());
        Ok(())
    }

    /// Replace the in-memory state with the saved file, if one exists
    pub fn load(&mut self) -> Result<bool, AddrBookError> {
        let Some(json) = self.file.load::<AddrBookJson>()? else {
            return Ok(false);
        };

        self.key = json.key;
        self.addr_lookup.clear();
        self.buckets_new.iter_mut().for_each(HashSet::clear);
        self.buckets_old.iter_mut().for_each(HashSet::clear);
        self.n_new = 0;
        self.n_old = 0;

        for mut ka in json.addrs {
            let bucket_count = match ka.bucket_type {
                BucketType::New => NEW_BUCKET_COUNT,
                BucketType::Old => OLD_BUCKET_COUNT,
            };
            ka.buckets.retain(|&idx| idx < bucket_count);
            if ka.buckets.is_empty() {
                continue;
            }
            for &idx in &ka.buckets {
                self.bucket_mut(ka.bucket_type, idx).insert(ka.addr);
            }
            match ka.bucket_type {
                BucketType::New => self.n_new += 1,
                BucketType::Old => self.n_old += 1,
            }
            self.addr_lookup.insert(ka.addr, ka);
        }

        log::info!("Loaded {} addresses from {}", self.size(), self.file.path().display());
        Ok(true)
    }

    // =========================================================================
    // Private helpers
    // =========================================================================

    fn bucket_mut(&mut self, bucket_type: BucketType, idx: usize) -> &mut HashSet<NetAddress> {
        match bucket_type {
            BucketType::New => &mut self.buckets_new[idx],
            BucketType::Old => &mut self.buckets_old[idx],
        }
    }

    fn hash_u64(&self, parts: &[&[u8]]) -> u64 {
        let mut data = Vec::new();
        data.extend_from_slice(self.key.as_bytes());
        for part in parts {
            data.extend_from_slice(part);
        }
        let hash = double_sha256(&data);
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash[..8]);
        u64::from_be_bytes(head)
    }

    /// Bucket for an address in the new table
    pub fn calc_new_bucket(&self, addr: &NetAddress, src: &NetAddress) -> usize {
        let addr_group = addr.group_key(self.routability_strict);
        let src_group = src.group_key(self.routability_strict);

        let h1 = self.hash_u64(&[addr_group.as_bytes(), src_group.as_bytes()]) % NEW_BUCKETS_PER_GROUP;
        let h2 = self.hash_u64(&[src_group.as_bytes(), &h1.to_be_bytes()]);
        (h2 % NEW_BUCKET_COUNT as u64) as usize
    }

    /// Bucket for an address in the tried table
    pub fn calc_old_bucket(&self, addr: &NetAddress) -> usize {
        let addr_group = addr.group_key(self.routability_strict);

        let h1 = self.hash_u64(&[addr.to_string().as_bytes()]) % OLD_BUCKETS_PER_GROUP;
        let h2 = self.hash_u64(&[addr_group.as_bytes(), &h1.to_be_bytes()]);
        (h2 % OLD_BUCKET_COUNT as u64) as usize
    }

    fn add_to_new_bucket(&mut self, mut ka: KnownAddress, bucket_idx: usize) {
        if ka.is_old() {
            log::warn!("Refusing to put tried address {} into a new bucket", ka.addr);
            return;
        }
        let addr = ka.addr;
        if self.buckets_new[bucket_idx].contains(&addr) {
            return;
        }
        if self.buckets_new[bucket_idx].len() >= NEW_BUCKET_SIZE {
            self.expire_new(bucket_idx);
        }

        self.buckets_new[bucket_idx].insert(addr);
        if ka.add_bucket_ref(bucket_idx) == 1 {
            self.n_new += 1;
        }
        self.addr_lookup.insert(addr, ka);
    }

    fn add_to_old_bucket(&mut self, addr: &NetAddress, bucket_idx: usize) -> bool {
        if self.buckets_old[bucket_idx].contains(addr) {
            return true;
        }
        if self.buckets_old[bucket_idx].len() >= OLD_BUCKET_SIZE {
            return false;
        }
        let Some(ka) = self.addr_lookup.get_mut(addr) else {
            return false;
        };
        if !ka.is_old() {
            return false;
        }

        self.buckets_old[bucket_idx].insert(*addr);
        if ka.add_bucket_ref(bucket_idx) == 1 {
            self.n_old += 1;
        }
        true
    }

    fn remove_from_bucket(&mut self, addr: &NetAddress, bucket_type: BucketType, bucket_idx: usize) {
        self.bucket_mut(bucket_type, bucket_idx).remove(addr);
        let Some(ka) = self.addr_lookup.get_mut(addr) else {
            return;
        };
        if ka.remove_bucket_ref(bucket_idx) == 0 {
            match bucket_type {
                BucketType::New => self.n_new -= 1,
                BucketType::Old => self.n_old -= 1,
            }
            self.addr_lookup.remove(addr);
        }
    }

    fn remove_from_all_buckets(&mut self, ka: &KnownAddress) {
        for &idx in &ka.buckets {
            self.bucket_mut(ka.bucket_type, idx).remove(&ka.addr);
        }
        if self.addr_lookup.remove(&ka.addr).is_some() {
            match ka.bucket_type {
                BucketType::New => self.n_new -= 1,
                BucketType::Old => self.n_old -= 1,
            }
        }
    }

    /// Oldest entry of a bucket by last attempt
    fn pick_oldest(&self, bucket_type: BucketType, bucket_idx: usize) -> Option<NetAddress> {
        let bucket = match bucket_type {
            BucketType::New => &self.buckets_new[bucket_idx],
            BucketType::Old => &self.buckets_old[bucket_idx],
        };
        bucket
            .iter()
            .filter_map(|addr| self.addr_lookup.get(addr))
            .min_by_key(|ka| ka.last_attempt)
            .map(|ka| ka.addr)
    }

    /// Make room in a full new bucket: drop a bad entry, else the oldest
    fn expire_new(&mut self, bucket_idx: usize) {
        let bad = self.buckets_new[bucket_idx]
            .iter()
            .find(|addr| self.addr_lookup.get(*addr).map_or(false, KnownAddress::is_bad))
            .copied();
        if let Some(addr) = bad {
            log::debug!("Expiring bad address {}", addr);
            self.remove_from_bucket(&addr, BucketType::New, bucket_idx);
            return;
        }
        if let Some(oldest) = self.pick_oldest(BucketType::New, bucket_idx) {
            self.remove_from_bucket(&oldest, BucketType::New, bucket_idx);
        }
    }

    /// Promote a new address to the tried table
    fn move_to_old(&mut self, addr: &NetAddress) {
        let Some(ka) = self.addr_lookup.get(addr).cloned() else {
            return;
        };
        if ka.is_old() || ka.buckets.is_empty() {
            return;
        }

        self.remove_from_all_buckets(&ka);
        let mut ka = ka;
        ka.buckets.clear();
        ka.bucket_type = BucketType::Old;
        self.addr_lookup.insert(*addr, ka);

        let old_idx = self.calc_old_bucket(addr);
        if self.add_to_old_bucket(addr, old_idx) {
            return;
        }

        // The tried bucket is full: demote its oldest entry to make room
        let demoted = self
            .pick_oldest(BucketType::Old, old_idx)
            .and_then(|oldest| self.addr_lookup.get(&oldest).cloned());
        if let Some(mut demoted) = demoted {
            self.remove_from_bucket(&demoted.addr, BucketType::Old, old_idx);
            demoted.buckets.clear();
            demoted.bucket_type = BucketType::New;
            let new_idx = self.calc_new_bucket(&demoted.addr, &demoted.src);
            log::debug!("Demoting {} from tried bucket {}", demoted.addr, old_idx);
            self.add_to_new_bucket(demoted, new_idx);
        }

        if !self.add_to_old_bucket(addr, old_idx) {
            log::error!("Could not promote {} to tried bucket {}", addr, old_idx);
            self.addr_lookup.remove(addr);
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let mut n_new = 0;
        let mut n_old = 0;
        for (addr, ka) in &self.addr_lookup {
            assert!(!ka.buckets.is_empty(), "{} has no bucket", addr);
            let buckets = match ka.bucket_type {
                BucketType::New => {
                    n_new += 1;
                    assert!(ka.buckets.len() <= MAX_NEW_BUCKETS_PER_ADDRESS);
                    &self.buckets_new
                }
                BucketType::Old => {
                    n_old += 1;
                    assert_eq!(ka.buckets.len(), 1);
                    &self.buckets_old
                }
            };
            for (idx, bucket) in buckets.iter().enumerate() {
                assert_eq!(bucket.contains(addr), ka.buckets.contains(&idx));
            }
        }
        assert_eq!(n_new, self.n_new);
        assert_eq!(n_old, self.n_old);
        let in_buckets: usize = self.buckets_new.iter().chain(&self.buckets_old).map(HashSet::len).sum();
        let refs: usize = self.addr_lookup.values().map(|ka| ka.buckets.len()).sum();
        assert_eq!(in_buckets, refs);
    }
}

// =============================================================================
// Saver
// =============================================================================

/// Periodically persist the book until `shutdown` flips to true, then save
/// once more. Save errors are logged and retried on the next tick.
pub fn spawn_saver(book: SharedAddrBook, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DUMP_ADDRESS_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = book.read().await.save() {
                        log::warn!("Failed to save address book: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = book.read().await.save() {
            log::warn!("Failed to save address book on stop: {}", e);
        }
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NetAddress {
        s.parse().unwrap()
    }

    fn book() -> (tempfile::TempDir, AddrBook) {
        let dir = tempfile::tempdir().unwrap();
        let book = AddrBook::new(dir.path().join("addrbook.json"), true);
        (dir, book)
    }

    #[test]
    fn test_add_and_lookup() {
        let (_dir, mut book) = book();
        let a = addr("1.2.3.4:46656");
        let src = addr("5.6.7.8:46656");
        book.add_address(a, src).unwrap();

        let ka = book.lookup(&a).unwrap();
        assert_eq!(ka.addr, a);
        assert_eq!(ka.src, src);
        assert!(book.lookup(&addr("9.9.9.9:46656")).is_none());
        book.check_invariants();
    }

    #[test]
    fn test_duplicate_add_keeps_size() {
        let (_dir, mut book) = book();
        let a = addr("1.2.3.4:46656");
        book.add_address(a, addr("5.6.7.8:46656")).unwrap();
        let buckets = book.lookup(&a).unwrap().buckets.clone();

        book.add_address(a, addr("5.6.7.8:46656")).unwrap();
        assert_eq!(book.size(), 1);
        assert_eq!(book.lookup(&a).unwrap().buckets, buckets);

        book.add_address(a, addr("7.7.7.7:46656")).unwrap();
        assert_eq!(book.size(), 1);
        book.check_invariants();
    }

    #[test]
    fn test_rejections() {
        let (dir, mut book) = book();
        let src = addr("5.6.7.8:46656");
        assert!(matches!(
            book.add_address(addr("127.0.0.1:46656"), src),
            Err(AddrBookError::NotRoutable(_))
        ));
        assert!(matches!(
            book.add_address(addr("0.0.0.0:0"), src),
            Err(AddrBookError::NilAddress)
        ));

        let ours = addr("8.8.4.4:46656");
        book.add_our_address(ours);
        assert!(matches!(book.add_address(ours, src), Err(AddrBookError::AddSelf(_))));
        assert_eq!(book.size(), 0);

        let mut lax = AddrBook::new(dir.path().join("lax.json"), false);
        lax.add_address(addr("127.0.0.1:46656"), src).unwrap();
        assert_eq!(lax.size(), 1);
    }

    #[test]
    fn test_new_buckets_per_address_capped() {
        let (_dir, mut book) = book();
        let a = addr("1.2.3.4:46656");
        for i in 0..200u32 {
            let src = NetAddress::new(std::net::Ipv4Addr::from(0x0b00_0000 + (i << 16)).into(), 1);
            book.add_address(a, src).unwrap();
        }
        assert!(book.lookup(&a).unwrap().buckets.len() <= MAX_NEW_BUCKETS_PER_ADDRESS);
        book.check_invariants();
    }

    #[test]
    fn test_mark_good_promotes() {
        let (_dir, mut book) = book();
        let a = addr("1.2.3.4:46656");
        book.add_address(a, addr("5.6.7.8:46656")).unwrap();
        book.mark_attempt(&a);
        book.mark_good(&a);

        let ka = book.lookup(&a).unwrap();
        assert!(ka.is_old());
        assert_eq!(ka.buckets, vec![book.calc_old_bucket(&a)]);
        assert_eq!(book.new_count(), 0);
        assert_eq!(book.old_count(), 1);

        // tried addresses are not re-added as new
        book.add_address(a, addr("9.9.9.9:46656")).unwrap();
        assert!(book.lookup(&a).unwrap().is_old());
        book.check_invariants();
    }

    #[test]
    fn test_mark_bad_removes() {
        let (_dir, mut book) = book();
        let a = addr("1.2.3.4:46656");
        book.add_address(a, addr("5.6.7.8:46656")).unwrap();
        book.mark_bad(&a);
        assert_eq!(book.size(), 0);
        assert_eq!(book.new_count(), 0);
        book.check_invariants();
    }

    #[test]
    fn test_full_new_bucket_evicts() {
        let (_dir, mut book) = book();
        let src = addr("5.6.7.8:46656");
        // addresses of one group from one source share a small set of buckets
        for i in 0..(NEW_BUCKETS_PER_GROUP as u32 * NEW_BUCKET_SIZE as u32 + 500) {
            let ip = std::net::Ipv4Addr::from(0x0101_0000 + i);
            book.add_address(NetAddress::new(ip.into(), 46656), src).unwrap();
        }
        assert!(book.buckets_new.iter().all(|b| b.len() <= NEW_BUCKET_SIZE));
        assert!(book.size() <= NEW_BUCKETS_PER_GROUP as usize * NEW_BUCKET_SIZE);
        book.check_invariants();
    }

    #[test]
    fn test_full_old_bucket_demotes_oldest() {
        let (_dir, mut book) = book();
        let src = addr("5.6.7.8:46656");
        let mut promoted = 0;
        for i in 0..2000u32 {
            let ip = std::net::Ipv4Addr::from(0x0202_0000 + i);
            let a = NetAddress::new(ip.into(), 46656);
            book.add_address(a, src).unwrap();
            if book.has_address(&a) {
                book.mark_good(&a);
                promoted += 1;
            }
        }
        assert!(promoted > OLD_BUCKET_SIZE);
        assert!(book.buckets_old.iter().all(|b| b.len() <= OLD_BUCKET_SIZE));
        book.check_invariants();
    }

    #[test]
    fn test_pick_address() {
        let (_dir, mut book) = book();
        assert!(book.pick_address(50).is_none());

        let a = addr("1.2.3.4:46656");
        let b = addr("8.8.8.8:46656");
        book.add_address(a, addr("5.6.7.8:46656")).unwrap();
        book.add_address(b, addr("5.6.7.8:46656")).unwrap();
        book.mark_good(&b);

        for _ in 0..20 {
            assert_eq!(book.pick_address(100), Some(a));
            assert_eq!(book.pick_address(0), Some(b));
        }
    }

    #[test]
    fn test_get_selection() {
        let (_dir, mut book) = book();
        for i in 0..1000u32 {
            let ip = std::net::Ipv4Addr::from(0x0300_0000 + (i << 8));
            book.add_address(NetAddress::new(ip.into(), 46656), addr("5.6.7.8:46656")).unwrap();
        }
        let size = book.size();
        let selection = book.get_selection();
        let expected = (size * GET_SELECTION_PERCENT / 100).max(MIN_GET_SELECTION.min(size)).min(MAX_GET_SELECTION);
        assert_eq!(selection.len(), expected);
        let unique: HashSet<_> = selection.iter().collect();
        assert_eq!(unique.len(), selection.len());
        assert!(book.need_more_addrs());
    }

    #[test]
    fn test_save_load() {
        let (dir, mut book) = book();
        let a = addr("1.2.3.4:46656");
        let b = addr("8.8.8.8:46656");
        book.add_address(a, addr("5.6.7.8:46656")).unwrap();
        book.add_address(b, addr("5.6.7.8:46656")).unwrap();
        book.mark_good(&b);
        book.save().unwrap();

        let loaded = AddrBook::open(dir.path().join("addrbook.json"), true).unwrap();
        assert_eq!(loaded.key, book.key);
        assert_eq!(loaded.size(), 2);
        assert_eq!(loaded.lookup(&a), book.lookup(&a));
        assert!(loaded.lookup(&b).unwrap().is_old());
        loaded.check_invariants();
    }

    #[tokio::test]
    async fn test_saver_saves_on_shutdown() {
        let (dir, mut book) = book();
        book.add_address(addr("1.2.3.4:46656"), addr("5.6.7.8:46656")).unwrap();
        let shared = book.into_shared();

        let (tx, rx) = watch::channel(false);
        let handle = spawn_saver(shared.clone(), rx);
        tx.send(true).unwrap();
        handle.await.unwrap();

        let loaded = AddrBook::open(dir.path().join("addrbook.json"), true).unwrap();
        assert_eq!(loaded.size(), 1);
    }
}

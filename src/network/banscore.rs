//! Misbehaviour scoring and IP bans
//!
//! A [`DynamicBanScore`] has a persistent part that only grows and a
//! transient part that halves every minute. When the sum crosses the
//! configured threshold the switch bans the offending IP through the
//! persisted [`BanList`].

use crate::storage::{JsonFile, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Constants
// =============================================================================

/// Seconds for the transient score to halve
pub const HALF_LIFE_SECS: u64 = 60;

/// Transient score older than this has fully decayed
pub const MAX_LIFETIME_SECS: u64 = 1800;

/// Decay factors for the first seconds, computed lazily beyond this
const PRECOMPUTED_LEN: usize = 64;

pub const DEFAULT_BAN_THRESHOLD: u32 = 100;
pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(60 * 60);

/// File the ban list is kept in, under the data directory
pub const BAN_LIST_FILE: &str = "banned_peers.json";

fn decay_factor(secs: u64) -> f64 {
    static FACTORS: std::sync::OnceLock<[f64; PRECOMPUTED_LEN]> = std::sync::OnceLock::new();
    let lambda = std::f64::consts::LN_2 / HALF_LIFE_SECS as f64;
    if (secs as usize) < PRECOMPUTED_LEN {
        let factors = FACTORS.get_or_init(|| {
            let mut f = [0.0; PRECOMPUTED_LEN];
            for (i, slot) in f.iter_mut().enumerate() {
                *slot = (-(i as f64) * lambda).exp();
            }
            f
        });
        return factors[secs as usize];
    }
    (-(secs as f64) * lambda).exp()
}

// =============================================================================
// Dynamic Ban Score
// =============================================================================

/// Ban score thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanScoreConfig {
    /// Score at which a peer is banned
    pub threshold: u32,
    #[serde(with = "crate::config::duration_secs")]
    pub ban_duration: Duration,
}

impl Default for BanScoreConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_BAN_THRESHOLD,
            ban_duration: DEFAULT_BAN_DURATION,
        }
    }
}

impl BanScoreConfig {
    /// Score at which a warning is logged
    pub fn warn_threshold(&self) -> u32 {
        self.threshold / 2
    }
}

/// Persistent plus decaying transient misbehaviour score
#[derive(Debug, Clone, Default)]
pub struct DynamicBanScore {
    persistent: u32,
    transient: f64,
    /// Unix seconds of the last transient update
    last_unix: i64,
}

impl DynamicBanScore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current score
    pub fn int(&self) -> u32 {
        self.int_at(Utc::now().timestamp())
    }

    pub fn int_at(&self, now_unix: i64) -> u32 {
        let total = self.persistent as f64 + self.decayed_transient(now_unix);
        total.round().min(u32::MAX as f64) as u32
    }

    /// Add to both parts and return the new score
    pub fn increase(&mut self, persistent: u32, transient: u32) -> u32 {
        self.increase_at(persistent, transient, Utc::now().timestamp())
    }

    pub fn increase_at(&mut self, persistent: u32, transient: u32, now_unix: i64) -> u32 {
        self.persistent = self.persistent.saturating_add(persistent);
        if transient > 0 {
            self.transient = self.decayed_transient(now_unix) + transient as f64;
            self.last_unix = now_unix;
        }
        self.int_at(now_unix)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn decayed_transient(&self, now_unix: i64) -> f64 {
        let elapsed = now_unix.saturating_sub(self.last_unix).max(0) as u64;
        if elapsed > MAX_LIFETIME_SECS {
            return 0.0;
        }
        self.transient * decay_factor(elapsed)
    }
}

// =============================================================================
// Ban List
// =============================================================================

/// Banned IPs with their ban expiry, persisted as JSON
#[derive(Debug)]
pub struct BanList {
    file: JsonFile,
    banned: HashMap<IpAddr, DateTime<Utc>>,
}

impl BanList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::new(path),
            banned: HashMap::new(),
        }
    }

    /// Load the list from disk, dropping expired entries
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let mut list = Self::new(path);
        if let Some(entries) = list.file.load::<HashMap<IpAddr, DateTime<Utc>>>()? {
            let now = Utc::now();
            list.banned = entries.into_iter().filter(|(_, until)| *until > now).collect();
            log::info!("Loaded {} banned peers from {}", list.banned.len(), list.file.path().display());
        }
        Ok(list)
    }

    pub fn save(&self) -> Result<(), StorageError> {
        self.file.save(&self.banned)
    }

    /// Ban `ip` for `duration` and persist the list
    pub fn ban(&mut self, ip: IpAddr, duration: Duration) -> Result<(), StorageError> {
        let until = Utc::now() + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::hours(1));
        log::warn!("Banning {} until {}", ip, until);
        self.banned.insert(ip, until);
        self.save()
    }

    /// Whether `ip` is banned now; expired bans are forgotten
    pub fn is_banned(&mut self, ip: &IpAddr) -> bool {
        match self.banned.get(ip) {
            Some(until) if *until > Utc::now() => true,
            Some(_) => {
                self.banned.remove(ip);
                if let Err(e) = self.save() {
                    log::warn!("Failed to save ban list: {}", e);
                }
                false
            }
            None => false,
        }
    }

    pub fn unban(&mut self, ip: &IpAddr) -> Result<(), StorageError> {
        if self.banned.remove(ip).is_some() {
            self.save()?;
        }
        Ok(())
    }

    pub fn banned_until(&self, ip: &IpAddr) -> Option<DateTime<Utc>> {
        self.banned.get(ip).copied()
    }

    pub fn len(&self) -> usize {
        self.banned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.banned.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_halves_each_minute() {
        let mut score = DynamicBanScore::new();
        assert_eq!(score.increase_at(0, 100, 1000), 100);
        assert_eq!(score.int_at(1000 + 60), 50);
        assert_eq!(score.int_at(1000 + 120), 25);
        assert_eq!(score.int_at(1000 + MAX_LIFETIME_SECS as i64 + 1), 0);
    }

    #[test]
    fn test_persistent_does_not_decay() {
        let mut score = DynamicBanScore::new();
        score.increase_at(10, 20, 0);
        assert_eq!(score.int_at(10_000), 10);
        assert_eq!(score.increase_at(5, 0, 10_000), 15);
        score.reset();
        assert_eq!(score.int_at(10_000), 0);
    }

    #[test]
    fn test_increase_accumulates_decayed_value() {
        let mut score = DynamicBanScore::new();
        score.increase_at(0, 80, 0);
        // 80 halves to 40, plus 40
        assert_eq!(score.increase_at(0, 40, 60), 80);
    }

    #[test]
    fn test_persistent_saturates() {
        let mut score = DynamicBanScore::new();
        score.increase_at(u32::MAX, 0, 0);
        assert_eq!(score.increase_at(10, 10, 0), u32::MAX);
    }

    #[test]
    fn test_decay_factor_continuity() {
        let a = decay_factor(PRECOMPUTED_LEN as u64 - 1);
        let b = decay_factor(PRECOMPUTED_LEN as u64);
        assert!(a > b);
        assert!((decay_factor(HALF_LIFE_SECS) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_ban_list_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BAN_LIST_FILE);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        let mut list = BanList::new(&path);
        assert!(!list.is_banned(&ip));
        list.ban(ip, Duration::from_secs(3600)).unwrap();
        assert!(list.is_banned(&ip));

        let mut reopened = BanList::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.is_banned(&ip));
        reopened.unban(&ip).unwrap();
        assert!(BanList::open(&path).unwrap().is_empty());
    }

    #[test]
    fn test_expired_ban_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        let mut list = BanList::new(dir.path().join(BAN_LIST_FILE));
        list.ban(ip, Duration::ZERO).unwrap();
        assert!(!list.is_banned(&ip));
        assert!(list.is_empty());
    }
}

//! Address book entries

use crate::network::netaddress::NetAddress;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Consecutive failures after which a never-reached address is bad
pub const NUM_RETRIES: u32 = 3;

/// Days without an attempt after which an address is bad
pub const NUM_MISSING_DAYS: i64 = 30;

/// Failures after which an address without recent success is bad
pub const MAX_FAILURES: u32 = 10;

/// Days since the last success considered "recent"
pub const MIN_BAD_DAYS: i64 = 7;

/// Which table an address lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketType {
    /// Unvetted, heard about from other peers
    New,
    /// Vetted, we have connected to it before
    Old,
}

/// Tracking information for one known peer address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownAddress {
    /// The peer address
    pub addr: NetAddress,
    /// Who told us about it
    pub src: NetAddress,
    /// Consecutive failed attempts since the last success
    pub attempts: u32,
    pub last_attempt: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub bucket_type: BucketType,
    /// Indices of the buckets holding this entry
    pub buckets: Vec<usize>,
}

impl KnownAddress {
    pub fn new(addr: NetAddress, src: NetAddress) -> Self {
        Self {
            addr,
            src,
            attempts: 0,
            last_attempt: Utc::now(),
            last_success: None,
            bucket_type: BucketType::New,
            buckets: Vec::new(),
        }
    }

    pub fn is_old(&self) -> bool {
        self.bucket_type == BucketType::Old
    }

    pub fn is_new(&self) -> bool {
        self.bucket_type == BucketType::New
    }

    /// Record a connection attempt
    pub fn mark_attempt(&mut self) {
        self.last_attempt = Utc::now();
        self.attempts += 1;
    }

    /// Record a successful connection
    pub fn mark_good(&mut self) {
        let now = Utc::now();
        self.last_attempt = now;
        self.attempts = 0;
        self.last_success = Some(now);
    }

    /// Add a bucket reference, returning the new reference count
    pub fn add_bucket_ref(&mut self, bucket_idx: usize) -> usize {
        if !self.buckets.contains(&bucket_idx) {
            self.buckets.push(bucket_idx);
        }
        self.buckets.len()
    }

    /// Remove a bucket reference, returning the remaining count
    pub fn remove_bucket_ref(&mut self, bucket_idx: usize) -> usize {
        self.buckets.retain(|&b| b != bucket_idx);
        self.buckets.len()
    }

    /// Whether this entry should be evicted first when its bucket is full
    ///
    /// Vetted entries are never bad. A new entry is bad when its latest
    /// attempt just failed, when it has not been tried for a month, when it
    /// never succeeded after a few retries, or when it keeps failing and has
    /// not succeeded for a week.
    pub fn is_bad(&self) -> bool {
        self.is_bad_at(Utc::now())
    }

    pub fn is_bad_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_old() {
            return false;
        }

        if self.last_attempt > now - Duration::minutes(1) {
            return self.attempts > 0;
        }

        if self.last_attempt < now - Duration::days(NUM_MISSING_DAYS) {
            return true;
        }

        match self.last_success {
            None => self.attempts >= NUM_RETRIES,
            Some(success) => {
                success < now - Duration::days(MIN_BAD_DAYS) && self.attempts >= MAX_FAILURES
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> KnownAddress {
        KnownAddress::new(
            "1.2.3.4:46656".parse().unwrap(),
            "5.6.7.8:46656".parse().unwrap(),
        )
    }

    #[test]
    fn test_bucket_refs() {
        let mut ka = entry();
        assert_eq!(ka.add_bucket_ref(3), 1);
        assert_eq!(ka.add_bucket_ref(3), 1);
        assert_eq!(ka.add_bucket_ref(9), 2);
        assert_eq!(ka.remove_bucket_ref(3), 1);
        assert_eq!(ka.buckets, vec![9]);
    }

    #[test]
    fn test_fresh_entry_is_not_bad() {
        assert!(!entry().is_bad());
    }

    #[test]
    fn test_recent_failure_is_bad() {
        let mut ka = entry();
        ka.mark_attempt();
        assert!(ka.is_bad());
        ka.mark_good();
        assert!(!ka.is_bad());
    }

    #[test]
    fn test_stale_and_retried_entries_are_bad() {
        let now = Utc::now();

        let mut stale = entry();
        stale.last_attempt = now - Duration::days(31);
        assert!(stale.is_bad_at(now));

        let mut retried = entry();
        retried.attempts = NUM_RETRIES;
        retried.last_attempt = now - Duration::hours(1);
        assert!(retried.is_bad_at(now));

        let mut failing = entry();
        failing.attempts = MAX_FAILURES;
        failing.last_attempt = now - Duration::hours(1);
        failing.last_success = Some(now - Duration::days(8));
        assert!(failing.is_bad_at(now));
        failing.last_success = Some(now - Duration::days(2));
        assert!(!failing.is_bad_at(now));
    }

    #[test]
    fn test_old_entry_is_never_bad() {
        let mut ka = entry();
        ka.bucket_type = BucketType::Old;
        ka.attempts = 100;
        ka.last_attempt = Utc::now() - Duration::days(365);
        assert!(!ka.is_bad());
    }
}

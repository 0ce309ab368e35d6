//! Topic advertisement
//!
//! The issuer side of topic registration: nodes ask for a ticket in a ping,
//! wait the period the pong tells them, then redeem the ticket with a
//! `topic_register` packet. Registrations are answered to `topic_query`.

use crate::network::discover::node::{log_dist, Hash, Node, NodeId, HASH_BITS};
use crate::network::discover::DiscoverError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

// =============================================================================
// Constants
// =============================================================================

pub const MAX_ENTRIES_PER_TOPIC: usize = 50;
pub const MAX_ENTRIES: usize = 10000;

/// Lifetime of a registration
pub const REG_EXPIRY_SECS: u64 = 3600;

/// How far off the ticket's registration time a redemption may land
pub const REG_WINDOW_SECS: u64 = 10;

pub const MIN_WAIT_SECS: f64 = 60.0;
pub const MAX_WAIT_SECS: f64 = 3600.0;

/// Registration interval the wait control steers each topic towards
const TARGET_REG_INTERVAL_SECS: f64 = REG_EXPIRY_SECS as f64 / MAX_ENTRIES_PER_TOPIC as f64;

/// Gain of the wait control loop, per registration
const WCL_GAIN: f64 = 0.1;

// =============================================================================
// Topic
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(pub String);

impl Topic {
    /// Position of the topic on the distance ring
    pub fn hash(&self) -> Hash {
        Hash::of(self.0.as_bytes())
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Topic(s.to_string())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Commitment to a list of topics, carried in pongs
pub fn topics_hash(topics: &[Topic]) -> Hash {
    let mut buf = Vec::new();
    for t in topics {
        buf.extend_from_slice(&(t.0.len() as u32).to_be_bytes());
        buf.extend_from_slice(t.0.as_bytes());
    }
    Hash::of(&buf)
}

// =============================================================================
// Wait control
// =============================================================================

/// Steers the ticket wait period of one topic so that registrations arrive
/// about once per target interval. Works on the log of the wait period.
#[derive(Debug, Clone)]
struct WaitControl {
    log_wait: f64,
    last_reg: Option<u64>,
}

impl WaitControl {
    fn new(min_wait: f64) -> Self {
        Self {
            log_wait: min_wait.ln(),
            last_reg: None,
        }
    }

    fn registered(&mut self, now: u64, min_wait: f64) {
        if let Some(last) = self.last_reg {
            let dt = now.saturating_sub(last) as f64;
            let err = (TARGET_REG_INTERVAL_SECS - dt) / TARGET_REG_INTERVAL_SECS;
            self.log_wait = (self.log_wait + WCL_GAIN * err).clamp(min_wait.ln(), MAX_WAIT_SECS.ln());
        }
        self.last_reg = Some(now);
    }

    fn wait_period(&self) -> u32 {
        self.log_wait.exp().round() as u32
    }
}

// =============================================================================
// Topic table
// =============================================================================

#[derive(Debug, Clone)]
struct Registration {
    node: Node,
    expires: u64,
}

#[derive(Debug)]
struct TopicInfo {
    /// Oldest first
    entries: VecDeque<Registration>,
    wcl: WaitControl,
}

#[derive(Debug, Default, Clone, Copy)]
struct TicketSerials {
    last_issued: u32,
    last_used: u32,
}

/// Registrations held by this node on behalf of others
#[derive(Debug)]
pub struct TopicTable {
    topics: HashMap<Topic, TopicInfo>,
    serials: HashMap<NodeId, TicketSerials>,
    total: usize,
    /// Shortest wait handed out in a ticket, in seconds
    min_wait: f64,
}

impl Default for TopicTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicTable {
    pub fn new() -> Self {
        Self::with_min_wait(MIN_WAIT_SECS)
    }

    /// A table whose tickets wait at least `min_wait` seconds (at least one)
    pub fn with_min_wait(min_wait: f64) -> Self {
        Self {
            topics: HashMap::new(),
            serials: HashMap::new(),
            total: 0,
            min_wait: min_wait.clamp(1.0, MAX_WAIT_SECS),
        }
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Wait period in seconds for each topic of a ticket
    pub fn wait_periods(&self, topics: &[Topic]) -> Vec<u32> {
        topics
            .iter()
            .map(|t| match self.topics.get(t) {
                Some(info) => info.wcl.wait_period(),
                None => self.min_wait.round() as u32,
            })
            .collect()
    }

    /// Issue a ticket to `node` for `topics`; returns its serial and wait periods
    pub fn issue_ticket(&mut self, node: &NodeId, topics: &[Topic]) -> (u32, Vec<u32>) {
        let serials = self.serials.entry(*node).or_default();
        serials.last_issued = serials.last_issued.wrapping_add(1).max(1);
        (serials.last_issued, self.wait_periods(topics))
    }

    /// Redeem a ticket issued at `issue_time` and register `topics[idx]`
    pub fn use_ticket(
        &mut self,
        node: &Node,
        serial: u32,
        topics: &[Topic],
        idx: usize,
        issue_time: u64,
        wait_periods: &[u32],
        now: u64,
    ) -> Result<(), DiscoverError> {
        let serials = self
            .serials
            .get_mut(&node.id)
            .ok_or_else(|| DiscoverError::InvalidTicket("no ticket issued".to_string()))?;
        if serial == 0 || serial > serials.last_issued || serial <= serials.last_used {
            return Err(DiscoverError::InvalidTicket(format!("stale serial {}", serial)));
        }
        let (topic, wait) = match (topics.get(idx), wait_periods.get(idx)) {
            (Some(t), Some(w)) => (t, *w),
            _ => return Err(DiscoverError::InvalidTicket(format!("topic index {} out of range", idx))),
        };
        let reg_time = issue_time + u64::from(wait);
        if now + REG_WINDOW_SECS < reg_time || now > reg_time + REG_WINDOW_SECS {
            return Err(DiscoverError::InvalidTicket(format!(
                "registration at {} outside window around {}",
                now, reg_time
            )));
        }

        // Remaining indices of the same ticket stay redeemable
        if idx + 1 == topics.len() {
            serials.last_used = serial;
        }
        self.add_entry(node.clone(), topic.clone(), now);
        Ok(())
    }

    fn add_entry(&mut self, node: Node, topic: Topic, now: u64) {
        let expires = now + REG_EXPIRY_SECS;
        let min_wait = self.min_wait;
        let info = self.topics.entry(topic.clone()).or_insert_with(|| TopicInfo {
            entries: VecDeque::new(),
            wcl: WaitControl::new(min_wait),
        });
        info.wcl.registered(now, min_wait);

        if let Some(pos) = info.entries.iter().position(|r| r.node.id == node.id) {
            info.entries.remove(pos);
            info.entries.push_back(Registration { node, expires });
            return;
        }
        if info.entries.len() >= MAX_ENTRIES_PER_TOPIC {
            info.entries.pop_front();
            self.total -= 1;
        }
        info.entries.push_back(Registration { node, expires });
        self.total += 1;

        if self.total > MAX_ENTRIES {
            self.drop_oldest();
        }
    }

    fn drop_oldest(&mut self) {
        let oldest = self
            .topics
            .iter()
            .filter_map(|(t, info)| info.entries.front().map(|r| (r.expires, t.clone())))
            .min();
        if let Some((_, topic)) = oldest {
            if let Some(info) = self.topics.get_mut(&topic) {
                info.entries.pop_front();
                self.total -= 1;
            }
        }
    }

    /// Live registrations for `topic`, newest first
    pub fn get_entries(&self, topic: &Topic, now: u64) -> Vec<Node> {
        match self.topics.get(topic) {
            Some(info) => info
                .entries
                .iter()
                .rev()
                .filter(|r| r.expires > now)
                .map(|r| r.node.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drop expired registrations and idle topics
    pub fn expire(&mut self, now: u64) {
        let mut removed = 0;
        self.topics.retain(|_, info| {
            let before = info.entries.len();
            info.entries.retain(|r| r.expires > now);
            removed += before - info.entries.len();
            !info.entries.is_empty() || info.wcl.last_reg.map_or(false, |t| t + REG_EXPIRY_SECS > now)
        });
        self.total -= removed;
    }
}

// =============================================================================
// Search radius
// =============================================================================

/// Estimate of how close to a topic hash its registrations live. Starts at
/// the whole ring and narrows as queried nodes report registrations.
#[derive(Debug, Clone)]
pub struct TopicRadius {
    topic_hash: Hash,
    estimate: f64,
}

impl TopicRadius {
    const SMOOTHING: f64 = 0.2;

    pub fn new(topic: &Topic) -> Self {
        Self {
            topic_hash: topic.hash(),
            estimate: HASH_BITS as f64,
        }
    }

    /// Log distance around the topic hash worth querying
    pub fn radius(&self) -> usize {
        (self.estimate.ceil() as usize + 1).min(HASH_BITS)
    }

    pub fn in_radius(&self, node: &Node) -> bool {
        log_dist(&self.topic_hash, &node.sha) <= self.radius()
    }

    /// Record the outcome of a query to `node`
    pub fn add_sample(&mut self, node: &Node, found: bool) {
        let dist = log_dist(&self.topic_hash, &node.sha) as f64;
        if found {
            self.estimate = self.estimate * (1.0 - Self::SMOOTHING) + dist * Self::SMOOTHING;
        } else if dist >= self.estimate {
            self.estimate = (self.estimate + 1.0).min(HASH_BITS as f64);
        }
    }
}

//! Ticket store
//!
//! Holds the tickets this node received in pongs while registering topics,
//! keyed by the issuing node, and hands them out one at a time in order of
//! registration time.

use crate::network::discover::node::{Node, NodeId};
use crate::network::discover::topic::{Topic, REG_WINDOW_SECS};
use std::collections::{BTreeSet, HashMap};

/// A ticket issued by a remote node
#[derive(Debug, Clone)]
pub struct Ticket {
    pub node: Node,
    pub topics: Vec<Topic>,
    pub serial: u32,
    /// Unix time at which each topic may be registered
    pub reg_times: Vec<u64>,
    /// The signed pong that carried the ticket
    pub pong: Vec<u8>,
    /// Indices not yet redeemed
    pending: Vec<usize>,
}

impl Ticket {
    pub fn new(node: Node, topics: Vec<Topic>, serial: u32, issue_time: u64, wait_periods: &[u32], pong: Vec<u8>) -> Self {
        let reg_times: Vec<u64> = wait_periods.iter().map(|w| issue_time + u64::from(*w)).collect();
        let pending = (0..topics.len().min(reg_times.len())).collect();
        Self {
            node,
            topics,
            serial,
            reg_times,
            pong,
            pending,
        }
    }
}

/// A topic of a ticket that is due for registration
#[derive(Debug, Clone)]
pub struct DueTicket {
    pub ticket: Ticket,
    pub idx: usize,
}

#[derive(Debug, Default)]
pub struct TicketStore {
    registering: BTreeSet<Topic>,
    tickets: HashMap<NodeId, Ticket>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_topic(&mut self, topic: Topic) -> bool {
        self.registering.insert(topic)
    }

    /// Stop registering `topic` and forget tickets that only served it
    pub fn remove_topic(&mut self, topic: &Topic) -> bool {
        if !self.registering.remove(topic) {
            return false;
        }
        let registering = &self.registering;
        self.tickets.retain(|_, t| {
            t.pending.retain(|i| registering.contains(&t.topics[*i]));
            !t.pending.is_empty()
        });
        true
    }

    /// Topics currently being registered, in a stable order
    pub fn topics(&self) -> Vec<Topic> {
        self.registering.iter().cloned().collect()
    }

    pub fn is_registering(&self) -> bool {
        !self.registering.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    /// Store a ticket, replacing any older one from the same node
    pub fn add_ticket(&mut self, mut ticket: Ticket) {
        let registering = &self.registering;
        ticket.pending.retain(|i| registering.contains(&ticket.topics[*i]));
        if ticket.pending.is_empty() {
            return;
        }
        log::trace!(
            "Ticket {} from {} for {} topic(s)",
            ticket.serial,
            ticket.node.id,
            ticket.pending.len()
        );
        self.tickets.insert(ticket.node.id, ticket);
    }

    /// Earliest registration time over all pending tickets
    pub fn next_due(&self) -> Option<u64> {
        self.tickets
            .values()
            .flat_map(|t| t.pending.iter().map(move |i| t.reg_times[*i]))
            .min()
    }

    /// Take the earliest ticket topic due at `now`. Tickets whose window
    /// has passed are dropped.
    pub fn take_due(&mut self, now: u64) -> Option<DueTicket> {
        loop {
            let (id, idx, reg_time) = self
                .tickets
                .iter()
                .flat_map(|(id, t)| t.pending.iter().map(move |i| (*id, *i, t.reg_times[*i])))
                .min_by_key(|(_, _, reg_time)| *reg_time)?;
            if reg_time > now {
                return None;
            }

            let ticket = self.tickets.get_mut(&id)?;
            ticket.pending.retain(|i| *i != idx);
            let due = DueTicket {
                ticket: ticket.clone(),
                idx,
            };
            if ticket.pending.is_empty() {
                self.tickets.remove(&id);
            }

            if now > reg_time + REG_WINDOW_SECS {
                log::debug!("Ticket from {} missed its registration window", id);
                continue;
            }
            return Some(due);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKey;

    fn node() -> Node {
        Node::new(NodeKey::generate().pub_key(), "10.0.0.1".parse().unwrap(), 30303, 46656)
    }

    #[test]
    fn test_tickets_in_registration_order() {
        let mut store = TicketStore::new();
        store.add_topic(Topic::from("a"));
        store.add_topic(Topic::from("b"));
        let topics = store.topics();

        let late = node();
        let early = node();
        store.add_ticket(Ticket::new(late.clone(), topics.clone(), 1, 100, &[60, 90], vec![]));
        store.add_ticket(Ticket::new(early.clone(), topics.clone(), 1, 100, &[20, 200], vec![]));
        assert_eq!(store.next_due(), Some(120));

        assert!(store.take_due(110).is_none());
        let due = store.take_due(121).unwrap();
        assert_eq!(due.ticket.node, early);
        assert_eq!(due.idx, 0);

        let due = store.take_due(161).unwrap();
        assert_eq!(due.ticket.node, late);
        assert_eq!(due.idx, 0);
        assert_eq!(store.next_due(), Some(190));
    }

    #[test]
    fn test_missed_window_dropped() {
        let mut store = TicketStore::new();
        store.add_topic(Topic::from("a"));
        store.add_ticket(Ticket::new(node(), store.topics(), 1, 0, &[60], vec![]));
        assert!(store.take_due(60 + REG_WINDOW_SECS + 1).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_newer_ticket_replaces() {
        let mut store = TicketStore::new();
        store.add_topic(Topic::from("a"));
        let n = node();
        store.add_ticket(Ticket::new(n.clone(), store.topics(), 1, 0, &[60], vec![]));
        store.add_ticket(Ticket::new(n, store.topics(), 2, 0, &[120], vec![]));
        assert_eq!(store.len(), 1);
        assert_eq!(store.next_due(), Some(120));
    }

    #[test]
    fn test_remove_topic_drops_tickets() {
        let mut store = TicketStore::new();
        store.add_topic(Topic::from("a"));
        store.add_ticket(Ticket::new(node(), store.topics(), 1, 0, &[60], vec![]));
        assert!(store.remove_topic(&Topic::from("a")));
        assert!(store.is_empty());
        assert!(!store.is_registering());
        // Tickets for topics we do not register are ignored
        store.add_ticket(Ticket::new(node(), vec![Topic::from("a")], 1, 0, &[60], vec![]));
        assert!(store.is_empty());
    }
}

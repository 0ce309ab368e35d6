//! Peer exchange reactor
//!
//! Trades addresses with peers on channel [`PEX_CHANNEL`] and keeps enough
//! outbound connections open, drawing candidates from the DHT when
//! discovery runs and from the address book otherwise.

pub mod message;

pub use message::{PexMessage, PexMessageError, MAX_PEX_ADDRS, PEX_CHANNEL};

use crate::crypto::PubKey;
use crate::network::addrbook::SharedAddrBook;
use crate::network::discover::Network;
use crate::network::netaddress::NetAddress;
use crate::network::peer::Peer;
use crate::network::reactor::{ChannelDescriptor, Reactor};
use crate::network::switch::{Switch, SwitchError, SwitchRef};
use async_trait::async_trait;
use bytes::Bytes;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;

// =============================================================================
// Constants
// =============================================================================

pub const DEFAULT_MAX_MSGS_PER_PEER_PER_HOUR: u32 = 1000;

const ENSURE_PEERS_INTERVAL: Duration = Duration::from_secs(120);

/// Fast retry while we have almost no peers
const FAST_ENSURE_INTERVAL: Duration = Duration::from_secs(3);
const FAST_ENSURE_PEER_THRESHOLD: usize = 3;

const MSG_COUNT_FLUSH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Time given to a trade before a peer over capacity is dropped
const GRACEFUL_STOP_DELAY: Duration = Duration::from_secs(1);

/// Most DHT nodes offered in answer to one request
const MAX_DHT_ADDRS: usize = 20;

/// Book picks tried per missing outbound peer
const PICK_ATTEMPTS_PER_DIAL: usize = 10;

const SEND_QUEUE_CAPACITY: usize = 10;

/// Penalty for an undecodable message
const BAD_MESSAGE_SCORE: u32 = 10;

// =============================================================================
// Reactor
// =============================================================================

pub struct PexReactor {
    book: SharedAddrBook,
    discv: Option<Network>,
    switch: RwLock<SwitchRef>,
    msg_counts: Arc<Mutex<HashMap<PubKey, u32>>>,
    max_msgs_per_peer: u32,
    quit: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PexReactor {
    pub fn new(book: SharedAddrBook, discv: Option<Network>) -> Self {
        let (quit, _) = watch::channel(false);
        Self {
            book,
            discv,
            switch: RwLock::new(Weak::new()),
            msg_counts: Arc::new(Mutex::new(HashMap::new())),
            max_msgs_per_peer: DEFAULT_MAX_MSGS_PER_PEER_PER_HOUR,
            quit,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_max_msgs_per_peer(mut self, max: u32) -> Self {
        self.max_msgs_per_peer = max;
        self
    }

    fn switch(&self) -> Option<Arc<Switch>> {
        self.switch.read().unwrap_or_else(|p| p.into_inner()).upgrade()
    }

    /// Count a message from `peer`; false once it is over the hourly limit
    fn count_msg(&self, peer: &PubKey) -> bool {
        let mut counts = self.msg_counts.lock().unwrap_or_else(|p| p.into_inner());
        let count = counts.entry(*peer).or_insert(0);
        *count += 1;
        *count <= self.max_msgs_per_peer
    }

    /// Addresses to hand out: random DHT nodes, or a book selection
    async fn selection(&self) -> Vec<NetAddress> {
        if let Some(discv) = &self.discv {
            let addrs: Vec<NetAddress> = discv
                .read_random_nodes(MAX_DHT_ADDRS)
                .await
                .iter()
                .map(|n| NetAddress::from_socket_addr(n.tcp_addr()))
                .collect();
            if !addrs.is_empty() {
                return addrs;
            }
        }
        self.book.read().await.get_selection()
    }

    async fn send_addrs(peer: &Peer, addrs: Vec<NetAddress>) {
        log::debug!("Sending {} addresses to {}", addrs.len(), peer.key());
        send_msg(peer, &PexMessage::PexAddrs { addrs }).await;
    }

    /// Dial until we have `min_outbound_peers` outbound connections
    pub async fn ensure_outbound_peers(switch: &Arc<Switch>, book: &SharedAddrBook, discv: Option<&Network>) {
        let (outbound, _, dialing) = switch.num_peers().await;
        let to_dial = switch.config().min_outbound_peers.saturating_sub(outbound + dialing);
        log::debug!(
            "Ensure peers: {} outbound, {} dialing, {} to dial",
            outbound,
            dialing,
            to_dial
        );

        if to_dial > 0 {
            let mut candidates = Vec::with_capacity(to_dial);
            let mut seen = HashSet::new();

            if let Some(discv) = discv {
                for node in discv.read_random_nodes(to_dial * 3).await {
                    if candidates.len() >= to_dial {
                        break;
                    }
                    let addr = NetAddress::from_socket_addr(node.tcp_addr());
                    if seen.insert(addr) && is_dialable(switch, book, &addr).await {
                        candidates.push(addr);
                    }
                }
            }

            // Lean on new addresses more as outbound connections pile up
            let bias = (outbound.min(8) * 10 + 10) as u32;
            for _ in 0..to_dial * PICK_ATTEMPTS_PER_DIAL {
                if candidates.len() >= to_dial {
                    break;
                }
                let Some(addr) = book.read().await.pick_address(bias) else {
                    break;
                };
                if seen.insert(addr) && is_dialable(switch, book, &addr).await {
                    candidates.push(addr);
                }
            }

            for addr in candidates {
                let sw = switch.clone();
                tokio::spawn(async move {
                    if let Err(e) = sw.dial_peer_with_address(addr).await {
                        log::debug!("Failed to dial {}: {}", addr, e);
                    }
                });
            }
        }

        if book.read().await.need_more_addrs() {
            let peer = switch.peers().await.choose(&mut rand::thread_rng()).cloned();
            if let Some(peer) = peer {
                send_msg(&peer, &PexMessage::PexRequest).await;
            }
        }
    }

    fn spawn_ensure_loop(&self) -> JoinHandle<()> {
        let sw = self.switch.read().unwrap_or_else(|p| p.into_inner()).clone();
        let book = self.book.clone();
        let discv = self.discv.clone();
        let mut quit = self.quit.subscribe();
        tokio::spawn(async move {
            let mut slow = interval(ENSURE_PEERS_INTERVAL);
            let mut fast = interval(FAST_ENSURE_INTERVAL);
            loop {
                let fast_tick = tokio::select! {
                    _ = quit.changed() => break,
                    _ = slow.tick() => false,
                    _ = fast.tick() => true,
                };
                let Some(switch) = sw.upgrade() else { break };
                if fast_tick && switch.peers().await.len() >= FAST_ENSURE_PEER_THRESHOLD {
                    continue;
                }
                Self::ensure_outbound_peers(&switch, &book, discv.as_ref()).await;
            }
        })
    }

    fn spawn_flush_loop(&self) -> JoinHandle<()> {
        let counts = self.msg_counts.clone();
        let mut quit = self.quit.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(MSG_COUNT_FLUSH_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = quit.changed() => break,
                    _ = ticker.tick() => counts.lock().unwrap_or_else(|p| p.into_inner()).clear(),
                }
            }
        })
    }
}

async fn send_msg(peer: &Peer, msg: &PexMessage) {
    let bytes = match msg.to_bytes() {
        Ok(b) => Bytes::from(b),
        Err(e) => {
            log::warn!("Failed to encode {}: {}", msg.type_name(), e);
            return;
        }
    };
    if let Err(e) = peer.send(PEX_CHANNEL, bytes).await {
        log::debug!("Failed to send {} to {}: {}", msg.type_name(), peer.key(), e);
    }
}

/// Not us, not connected and not being dialed
async fn is_dialable(switch: &Switch, book: &SharedAddrBook, addr: &NetAddress) -> bool {
    if switch.listen_address() == Some(*addr) || book.read().await.is_our_address(addr) {
        return false;
    }
    !switch.is_connected_or_dialing(addr).await
}

#[async_trait]
impl Reactor for PexReactor {
    fn get_channels(&self) -> Vec<ChannelDescriptor> {
        vec![ChannelDescriptor::new(PEX_CHANNEL, 1).with_send_queue_capacity(SEND_QUEUE_CAPACITY)]
    }

    fn set_switch(&self, switch: Weak<Switch>) {
        *self.switch.write().unwrap_or_else(|p| p.into_inner()) = switch;
    }

    async fn start(&self) -> Result<(), SwitchError> {
        let ensure = self.spawn_ensure_loop();
        let flush = self.spawn_flush_loop();
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).extend([ensure, flush]);
        log::info!("PEX reactor started");
        Ok(())
    }

    async fn stop(&self) {
        self.quit.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        log::info!("PEX reactor stopped");
    }

    async fn add_peer(&self, peer: &Arc<Peer>) -> Result<(), SwitchError> {
        let Some(switch) = self.switch() else {
            return Ok(());
        };

        if switch.peers().await.len() > switch.config().max_num_peers {
            // Trade addresses, then make room
            let addrs = self.selection().await;
            let peer = peer.clone();
            let sw = Arc::downgrade(&switch);
            tokio::spawn(async move {
                Self::send_addrs(&peer, addrs).await;
                tokio::time::sleep(GRACEFUL_STOP_DELAY).await;
                if let Some(switch) = sw.upgrade() {
                    switch.stop_peer_gracefully(&peer).await;
                }
            });
            return Ok(());
        }

        if peer.is_outbound() {
            if self.book.read().await.need_more_addrs() {
                send_msg(peer, &PexMessage::PexRequest).await;
            }
        } else if let Some(addr) = peer.listen_addr() {
            if let Err(e) = self.book.write().await.add_address(addr, addr) {
                log::debug!("Inbound peer address {} not added: {}", addr, e);
            }
        }
        Ok(())
    }

    async fn remove_peer(&self, peer: &Arc<Peer>, _reason: &str) {
        self.msg_counts.lock().unwrap_or_else(|p| p.into_inner()).remove(&peer.id());
    }

    async fn receive(&self, _ch_id: u8, peer: &Arc<Peer>, msg: Bytes) {
        let Some(switch) = self.switch() else {
            return;
        };
        if !self.count_msg(&peer.id()) {
            switch.stop_peer_for_error(peer, "too many PEX messages").await;
            return;
        }

        let msg = match PexMessage::from_bytes(&msg) {
            Ok(msg) => msg,
            Err(e) => {
                let reason = format!("invalid PEX message: {}", e);
                switch.add_ban_score(peer.remote_ip(), BAD_MESSAGE_SCORE, 0, &reason).await;
                switch.stop_peer_for_error(peer, &reason).await;
                return;
            }
        };
        log::trace!("Received {} from {}", msg.type_name(), peer.key());

        match msg {
            PexMessage::PexRequest => {
                let addrs = self.selection().await;
                Self::send_addrs(peer, addrs).await;
            }
            PexMessage::PexAddrs { addrs } => {
                let src = peer.listen_addr().unwrap_or_else(|| peer.remote_addr());
                let mut book = self.book.write().await;
                let mut added = 0;
                for addr in addrs {
                    match book.add_address(addr, src) {
                        Ok(()) => added += 1,
                        Err(e) => log::trace!("Address {} from {} not added: {}", addr, peer.key(), e),
                    }
                }
                log::debug!("Added {} addresses from {}", added, peer.key());
            }
        }
    }
}

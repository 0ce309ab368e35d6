//! Switch: peer lifecycle and message routing
//!
//! The switch accepts and dials TCP connections, runs the secret handshake
//! and the node info exchange, admits compatible peers and routes every
//! message they send to the reactor owning its channel.
//!
//! Pipeline for a new connection:
//! 1. ban and self checks (dialing only, before any I/O)
//! 2. secret connection handshake, skipped when auth encryption is off
//! 3. node info exchange, all under the handshake timeout
//! 4. compatibility gate and duplicate check
//! 5. `add_peer` on every reactor, then the multiplexed connection starts

use crate::config::P2PConfig;
use crate::crypto::{NodeKey, PubKey};
use crate::network::addrbook::{AddrBookError, SharedAddrBook};
use crate::network::banscore::{BanList, DynamicBanScore};
use crate::network::listener::Listener;
use crate::network::mconn::{ChannelDescriptor, ErrorCallback, InboundMessage, MConnError, MConnection};
use crate::network::netaddress::NetAddress;
use crate::network::node_info::{exchange_node_info, NodeInfo, VersionCheck};
use crate::network::peer::{Peer, PeerSet};
use crate::network::reactor::Reactor;
use crate::network::secret_conn::{BoxedReader, BoxedWriter, SecretConnError, SecretConnection};
use crate::network::upnp;
use crate::storage::StorageError;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Upper bound of the random delay before each seed dial
const MAX_SEED_DIAL_JITTER: Duration = Duration::from_secs(3);

/// Penalty for a peer that sent malformed or forged data
const ADVERSARIAL_PERSISTENT_SCORE: u32 = 20;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("connect to self")]
    ConnectSelf,
    #[error("connect to banned IP {0}")]
    ConnectBanned(IpAddr),
    #[error("duplicate peer {0}")]
    DuplicatePeer(String),
    #[error("incompatible version: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: String, theirs: String },
    #[error("network mismatch: ours {ours}, theirs {theirs}")]
    NetworkMismatch { ours: String, theirs: String },
    #[error("genesis block mismatch")]
    GenesisMismatch,
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("already dialing {0}")]
    AlreadyDialing(NetAddress),
    #[error("peer limit reached")]
    MaxPeers,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("channel {channel:#04x} already owned by reactor {owner}")]
    ReactorChannelConflict { channel: u8, owner: String },
    #[error("invalid node info: {0}")]
    InvalidNodeInfo(String),
    #[error("secret connection: {0}")]
    SecretConn(#[from] SecretConnError),
    #[error("connection: {0}")]
    MConn(#[from] MConnError),
    #[error("address book: {0}")]
    AddrBook(#[from] AddrBookError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Ban score penalty for errors that only a misbehaving peer produces
fn ban_penalty(err: &MConnError) -> Option<u32> {
    match err {
        MConnError::WireDecode(_) | MConnError::UnknownChannel(_) | MConnError::MessageTooLarge(_) => {
            Some(ADVERSARIAL_PERSISTENT_SCORE)
        }
        MConnError::IoError(io) => io
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<SecretConnError>())
            .and_then(secret_conn_penalty),
        _ => None,
    }
}

fn secret_conn_penalty(err: &SecretConnError) -> Option<u32> {
    match err {
        SecretConnError::FrameDecrypt | SecretConnError::FrameTooLarge(_) | SecretConnError::HandshakeVerification => {
            Some(ADVERSARIAL_PERSISTENT_SCORE)
        }
        _ => None,
    }
}

// =============================================================================
// Switch
// =============================================================================

#[derive(Default)]
struct Reactors {
    by_name: Vec<(String, Arc<dyn Reactor>)>,
    by_channel: HashMap<u8, Arc<dyn Reactor>>,
    channels: Vec<ChannelDescriptor>,
}

pub struct Switch {
    config: P2PConfig,
    node_key: NodeKey,
    node_info: RwLock<NodeInfo>,
    is_compatible_version: VersionCheck,
    reactors: RwLock<Reactors>,
    peers: PeerSet,
    dialing: Mutex<HashSet<NetAddress>>,
    addr_book: SharedAddrBook,
    ban_list: tokio::sync::Mutex<BanList>,
    ban_scores: Mutex<HashMap<IpAddr, DynamicBanScore>>,
    listen_addr: RwLock<Option<NetAddress>>,
    quit: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    peer_errors: mpsc::UnboundedSender<(PubKey, MConnError)>,
    peer_errors_rx: Mutex<Option<mpsc::UnboundedReceiver<(PubKey, MConnError)>>>,
}

impl Switch {
    /// Create a switch; the ban list is loaded from the data directory
    pub fn new(
        config: P2PConfig,
        node_key: NodeKey,
        node_info: NodeInfo,
        addr_book: SharedAddrBook,
        is_compatible_version: VersionCheck,
    ) -> Result<Arc<Self>, SwitchError> {
        let ban_list = BanList::open(config.ban_list_path())?;
        let (quit, _) = watch::channel(false);
        let (peer_errors, peer_errors_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            config,
            node_key,
            node_info: RwLock::new(node_info),
            is_compatible_version,
            reactors: RwLock::new(Reactors::default()),
            peers: PeerSet::new(),
            dialing: Mutex::new(HashSet::new()),
            addr_book,
            ban_list: tokio::sync::Mutex::new(ban_list),
            ban_scores: Mutex::new(HashMap::new()),
            listen_addr: RwLock::new(None),
            quit,
            tasks: Mutex::new(Vec::new()),
            peer_errors,
            peer_errors_rx: Mutex::new(Some(peer_errors_rx)),
        }))
    }

    /// Register a reactor; each channel id may belong to one reactor only
    pub fn add_reactor(self: &Arc<Self>, name: &str, reactor: Arc<dyn Reactor>) -> Result<(), SwitchError> {
        {
            let mut reactors = self.reactors.write().unwrap_or_else(|p| p.into_inner());
            let descs = reactor.get_channels();
            for desc in &descs {
                if reactors.by_channel.contains_key(&desc.id) {
                    let owner = reactors
                        .by_name
                        .iter()
                        .find(|(_, r)| r.get_channels().iter().any(|d| d.id == desc.id))
                        .map(|(n, _)| n.clone())
                        .unwrap_or_default();
                    return Err(SwitchError::ReactorChannelConflict { channel: desc.id, owner });
                }
            }
            for desc in descs {
                reactors.by_channel.insert(desc.id, reactor.clone());
                reactors.channels.push(desc);
            }
            reactors.by_name.push((name.to_string(), reactor.clone()));
        }
        reactor.set_switch(Arc::downgrade(self));
        log::debug!("Added reactor {}", name);
        Ok(())
    }

    pub fn reactor(&self, name: &str) -> Option<Arc<dyn Reactor>> {
        let reactors = self.reactors.read().unwrap_or_else(|p| p.into_inner());
        reactors.by_name.iter().find(|(n, _)| n == name).map(|(_, r)| r.clone())
    }

    fn reactor_list(&self) -> Vec<Arc<dyn Reactor>> {
        let reactors = self.reactors.read().unwrap_or_else(|p| p.into_inner());
        reactors.by_name.iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn config(&self) -> &P2PConfig {
        &self.config
    }

    pub fn node_info(&self) -> NodeInfo {
        self.node_info.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Replace our node info, e.g. when the best block changes
    pub fn set_node_info(&self, info: NodeInfo) {
        *self.node_info.write().unwrap_or_else(|p| p.into_inner()) = info;
    }

    pub fn pub_key(&self) -> PubKey {
        self.node_key.pub_key()
    }

    pub fn addr_book(&self) -> &SharedAddrBook {
        &self.addr_book
    }

    /// The address peers should dial us on, once listening
    pub fn listen_address(&self) -> Option<NetAddress> {
        *self.listen_addr.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_running(&self) -> bool {
        !*self.quit.borrow()
    }

    fn quit_signal(&self) -> watch::Receiver<bool> {
        self.quit.subscribe()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start reactors, the listener and the peer error loop
    pub async fn start(self: &Arc<Self>) -> Result<(), SwitchError> {
        for reactor in self.reactor_list() {
            reactor.start().await?;
        }

        if !self.config.listen_addr.is_empty() {
            let listener = Listener::bind(&self.config.listen_addr, self.config.skip_upnp).await?;
            let addr = listener.best_address();
            *self.listen_addr.write().unwrap_or_else(|p| p.into_inner()) = Some(addr);
            {
                let mut info = self.node_info.write().unwrap_or_else(|p| p.into_inner());
                info.listen_addr = addr.to_string();
            }
            self.addr_book.write().await.add_our_address(addr);
            if let Some(mapping) = listener.port_mapping() {
                self.track(upnp::spawn_renewal(mapping, self.quit_signal()));
            }
            let handle = self.spawn_accept_loop(listener);
            self.track(handle);
        }

        let rx = self.peer_errors_rx.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(rx) = rx {
            let handle = self.spawn_error_loop(rx);
            self.track(handle);
        }

        log::info!("Switch started as {}", self.pub_key());
        Ok(())
    }

    /// Stop all peers and reactors
    pub async fn stop(&self) {
        if self.quit.send_replace(true) {
            return;
        }
        for peer in self.peers.list().await {
            self.stop_peer_gracefully(&peer).await;
        }
        for reactor in self.reactor_list() {
            reactor.stop().await;
        }
        let tasks: Vec<_> = self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                log::warn!("Switch task did not stop in time");
            }
        }
        log::info!("Switch stopped");
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).push(handle);
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: Listener) -> JoinHandle<()> {
        let sw = Arc::downgrade(self);
        let mut quit = self.quit_signal();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = quit.changed() => break,
                    accepted = listener.accept() => accepted,
                };
                let Some(switch) = sw.upgrade() else { break };
                match accepted {
                    Ok((stream, remote)) => {
                        tokio::spawn(async move {
                            switch.accept_conn(stream, NetAddress::from_socket_addr(remote)).await;
                        });
                    }
                    Err(e) => {
                        log::warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        })
    }

    fn spawn_error_loop(self: &Arc<Self>, mut errors: mpsc::UnboundedReceiver<(PubKey, MConnError)>) -> JoinHandle<()> {
        let sw = Arc::downgrade(self);
        let mut quit = self.quit_signal();
        tokio::spawn(async move {
            loop {
                let (id, err) = tokio::select! {
                    _ = quit.changed() => break,
                    next = errors.recv() => match next {
                        Some(next) => next,
                        None => break,
                    },
                };
                let Some(switch) = sw.upgrade() else { break };
                let Some(peer) = switch.peers.get(&id).await else { continue };
                if let Some(score) = ban_penalty(&err) {
                    switch.add_ban_score(peer.remote_ip(), score, 0, &err.to_string()).await;
                }
                switch.stop_peer_for_error(&peer, &err.to_string()).await;
            }
        })
    }

    // =========================================================================
    // Peers
    // =========================================================================

    /// Outbound, inbound and in-progress dial counts
    pub async fn num_peers(&self) -> (usize, usize, usize) {
        let peers = self.peers.list().await;
        let outbound = peers.iter().filter(|p| p.is_outbound()).count();
        let dialing = self.dialing.lock().unwrap_or_else(|p| p.into_inner()).len();
        (outbound, peers.len() - outbound, dialing)
    }

    /// Snapshot of the connected peers
    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.list().await
    }

    pub async fn peer(&self, id: &PubKey) -> Option<Arc<Peer>> {
        self.peers.get(id).await
    }

    pub fn is_dialing(&self, addr: &NetAddress) -> bool {
        self.dialing.lock().unwrap_or_else(|p| p.into_inner()).contains(addr)
    }

    /// Whether we are connected to, or dialing, `addr`
    pub async fn is_connected_or_dialing(&self, addr: &NetAddress) -> bool {
        if self.is_dialing(addr) {
            return true;
        }
        self.peers
            .list()
            .await
            .iter()
            .any(|p| p.remote_addr() == *addr || p.listen_addr() == Some(*addr))
    }

    /// Disconnect a peer after a failure
    pub async fn stop_peer_for_error(&self, peer: &Arc<Peer>, reason: &str) {
        log::info!("Stopping peer {} for error: {}", peer.key(), reason);
        self.stop_and_remove_peer(peer, reason).await;
    }

    /// Disconnect a peer without blaming it
    pub async fn stop_peer_gracefully(&self, peer: &Arc<Peer>) {
        log::debug!("Stopping peer {} gracefully", peer.key());
        self.stop_and_remove_peer(peer, "").await;
    }

    async fn stop_and_remove_peer(&self, peer: &Arc<Peer>, reason: &str) {
        if self.peers.remove(&peer.id()).await.is_none() {
            return;
        }
        for reactor in self.reactor_list() {
            reactor.remove_peer(peer, reason).await;
        }
        peer.stop();
    }

    // =========================================================================
    // Bans
    // =========================================================================

    pub async fn is_banned(&self, ip: &IpAddr) -> bool {
        self.ban_list.lock().await.is_banned(ip)
    }

    /// Ban `ip` for the configured duration and drop its peers
    pub async fn ban(&self, ip: IpAddr) {
        if let Err(e) = self.ban_list.lock().await.ban(ip, self.config.ban.ban_duration) {
            log::warn!("Failed to persist ban of {}: {}", ip, e);
        }
        for peer in self.peers.list().await {
            if peer.remote_ip() == ip {
                self.stop_peer_for_error(&peer, "banned").await;
            }
        }
    }

    /// Add to the misbehaviour score of `ip`; returns true if it got banned
    pub async fn add_ban_score(&self, ip: IpAddr, persistent: u32, transient: u32, reason: &str) -> bool {
        let score = {
            let mut scores = self.ban_scores.lock().unwrap_or_else(|p| p.into_inner());
            let score = scores.entry(ip).or_default().increase(persistent, transient);
            if score >= self.config.ban.threshold {
                scores.remove(&ip);
            }
            score
        };

        if score >= self.config.ban.threshold {
            log::warn!("Banning {} with score {}: {}", ip, score, reason);
            self.ban(ip).await;
            return true;
        }
        if score > self.config.ban.warn_threshold() {
            log::warn!("Ban score of {} increased to {}: {}", ip, score, reason);
        } else {
            log::debug!("Ban score of {} increased to {}: {}", ip, score, reason);
        }
        false
    }

    pub fn ban_score(&self, ip: &IpAddr) -> u32 {
        self.ban_scores
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(ip)
            .map_or(0, DynamicBanScore::int)
    }

    // =========================================================================
    // Dialing and accepting
    // =========================================================================

    fn is_self_address(&self, addr: &NetAddress) -> bool {
        self.listen_address() == Some(*addr)
    }

    /// Dial `addr` and run the full handshake pipeline
    pub async fn dial_peer_with_address(self: &Arc<Self>, addr: NetAddress) -> Result<Arc<Peer>, SwitchError> {
        if self.is_banned(&addr.ip).await {
            return Err(SwitchError::ConnectBanned(addr.ip));
        }
        if self.is_self_address(&addr) || self.addr_book.read().await.is_our_address(&addr) {
            return Err(SwitchError::ConnectSelf);
        }
        if !self.dialing.lock().unwrap_or_else(|p| p.into_inner()).insert(addr) {
            return Err(SwitchError::AlreadyDialing(addr));
        }

        let result = self.dial(addr).await;
        self.dialing.lock().unwrap_or_else(|p| p.into_inner()).remove(&addr);
        result
    }

    async fn dial(self: &Arc<Self>, addr: NetAddress) -> Result<Arc<Peer>, SwitchError> {
        log::debug!("Dialing {}", addr);
        self.addr_book.write().await.mark_attempt(&addr);
        let stream = addr
            .dial_timeout(self.config.dial_timeout)
            .await
            .map_err(|e| SwitchError::Dial(format!("{}: {}", addr, e)))?;
        let peer = self.add_peer_with_conn(stream, addr, true).await?;
        self.addr_book.write().await.mark_good(&addr);
        Ok(peer)
    }

    async fn accept_conn(self: &Arc<Self>, stream: TcpStream, remote: NetAddress) {
        if self.peers.size().await >= self.config.max_num_peers * 2 {
            log::debug!("Rejecting inbound {}: {}", remote, SwitchError::MaxPeers);
            return;
        }
        if self.is_banned(&remote.ip).await {
            log::debug!("Rejecting inbound {}: banned", remote);
            return;
        }
        match self.add_peer_with_conn(stream, remote, false).await {
            Ok(peer) => log::info!("Accepted inbound peer {} from {}", peer.key(), remote),
            Err(e) => {
                log::debug!("Inbound handshake with {} failed: {}", remote, e);
                if let SwitchError::SecretConn(inner) = &e {
                    if let Some(score) = secret_conn_penalty(inner) {
                        self.add_ban_score(remote.ip, score, 0, &e.to_string()).await;
                    }
                }
            }
        }
    }

    /// Upgrade the raw stream; returns the halves and the authenticated key
    async fn upgrade(&self, stream: TcpStream) -> Result<(BoxedReader, BoxedWriter, Option<PubKey>), SwitchError> {
        if self.config.auth_enc_disable {
            let (r, w) = stream.into_split();
            return Ok((Box::new(r), Box::new(w), None));
        }
        let conn = SecretConnection::make(stream, &self.node_key).await?;
        let remote_key = conn.remote_pub_key();
        let (r, w) = conn.into_split();
        Ok((r, w, Some(remote_key)))
    }

    async fn handshake(&self, stream: TcpStream) -> Result<(BoxedReader, BoxedWriter, NodeInfo), SwitchError> {
        let (mut reader, mut writer, remote_key) = self.upgrade(stream).await?;
        let ours = self.node_info();
        let theirs = exchange_node_info(&mut reader, &mut writer, &ours).await?;
        if let Some(key) = remote_key {
            if key != theirs.pub_key {
                return Err(SwitchError::InvalidNodeInfo(format!(
                    "key {} does not match authenticated key {}",
                    theirs.pub_key, key
                )));
            }
        }
        Ok((reader, writer, theirs))
    }

    /// Reject peers that must not join
    async fn filter_peer(&self, info: &NodeInfo) -> Result<(), SwitchError> {
        if info.pub_key == self.pub_key() {
            return Err(SwitchError::ConnectSelf);
        }
        self.node_info().compatible_with(info, self.is_compatible_version)?;
        if self.peers.has(&info.pub_key).await {
            return Err(SwitchError::DuplicatePeer(info.pub_key.to_hex()));
        }
        Ok(())
    }

    async fn add_peer_with_conn(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: NetAddress,
        outbound: bool,
    ) -> Result<Arc<Peer>, SwitchError> {
        let (reader, writer, info) = tokio::time::timeout(self.config.handshake_timeout, self.handshake(stream))
            .await
            .map_err(|_| SwitchError::HandshakeTimeout)??;
        self.filter_peer(&info).await?;

        let (channels, by_channel) = {
            let reactors = self.reactors.read().unwrap_or_else(|p| p.into_inner());
            (reactors.channels.clone(), reactors.by_channel.clone())
        };
        let (inbound_tx, inbound_rx) = MConnection::inbound_queue();
        let errors = self.peer_errors.clone();
        let id = info.pub_key;
        let on_error: ErrorCallback = Box::new(move |err| {
            let _ = errors.send((id, err));
        });
        let mconn = MConnection::new(reader, writer, &channels, self.config.mconn.clone(), inbound_tx, on_error);
        let peer = Arc::new(Peer::new(info, outbound, remote, mconn));

        self.peers.add(peer.clone()).await?;
        for reactor in self.reactor_list() {
            if let Err(e) = reactor.add_peer(&peer).await {
                self.stop_peer_for_error(&peer, &e.to_string()).await;
                return Err(e);
            }
        }
        peer.start();
        spawn_dispatcher(peer.clone(), by_channel, inbound_rx);

        log::info!(
            "Added peer {} at {} (outbound: {})",
            peer.key(),
            remote,
            outbound
        );
        Ok(peer)
    }

    /// Resolve the seeds, add them to the book and dial them in random order
    pub async fn dial_seeds(self: &Arc<Self>, seeds: &[String]) -> Result<(), SwitchError> {
        if seeds.is_empty() {
            return Ok(());
        }
        let mut addrs = NetAddress::resolve_many(seeds).await;
        if addrs.is_empty() {
            return Err(SwitchError::Dial("no seed could be resolved".to_string()));
        }

        let our = self.listen_address();
        {
            let mut book = self.addr_book.write().await;
            for addr in &addrs {
                if let Err(e) = book.add_address(*addr, our.unwrap_or(*addr)) {
                    log::debug!("Seed {} not added to address book: {}", addr, e);
                }
            }
        }

        addrs.shuffle(&mut rand::thread_rng());
        for addr in addrs {
            let sw = self.clone();
            let jitter = rand::thread_rng().gen_range(0..MAX_SEED_DIAL_JITTER.as_millis() as u64);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                if let Err(e) = sw.dial_peer_with_address(addr).await {
                    log::warn!("Failed to dial seed {}: {}", addr, e);
                }
            });
        }
        Ok(())
    }
}

/// Hand received messages to the reactor owning their channel
fn spawn_dispatcher(
    peer: Arc<Peer>,
    reactors: HashMap<u8, Arc<dyn Reactor>>,
    mut inbound: mpsc::Receiver<InboundMessage>,
) {
    tokio::spawn(async move {
        while let Some((ch_id, msg)) = inbound.recv().await {
            match reactors.get(&ch_id) {
                Some(reactor) => reactor.receive(ch_id, &peer, msg).await,
                None => log::warn!("No reactor for channel {:#04x} from {}", ch_id, peer.key()),
            }
        }
    });
}

/// Weak handle held by reactors
pub type SwitchRef = Weak<Switch>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::addrbook::AddrBook;
    use crate::network::node_info::{major_version_compatible, ServiceFlags};
    use async_trait::async_trait;
    use bytes::Bytes;

    const TEST_CHANNEL: u8 = 0x40;

    #[derive(Default)]
    struct RecordingReactor {
        received: tokio::sync::Mutex<Vec<(u8, Bytes)>>,
        added: tokio::sync::Mutex<Vec<PubKey>>,
        removed: tokio::sync::Mutex<Vec<PubKey>>,
        notify: tokio::sync::Notify,
    }

    #[async_trait]
    impl Reactor for RecordingReactor {
        fn get_channels(&self) -> Vec<ChannelDescriptor> {
            vec![ChannelDescriptor::new(TEST_CHANNEL, 1)]
        }

        async fn add_peer(&self, peer: &Arc<Peer>) -> Result<(), SwitchError> {
            self.added.lock().await.push(peer.id());
            Ok(())
        }

        async fn remove_peer(&self, peer: &Arc<Peer>, _reason: &str) {
            self.removed.lock().await.push(peer.id());
            self.notify.notify_one();
        }

        async fn receive(&self, ch_id: u8, _peer: &Arc<Peer>, msg: Bytes) {
            self.received.lock().await.push((ch_id, msg));
            self.notify.notify_one();
        }
    }

    struct Node {
        _dir: tempfile::TempDir,
        sw: Arc<Switch>,
        reactor: Arc<RecordingReactor>,
    }

    async fn node(chain_id: &str, auth_enc_disable: bool) -> Node {
        let dir = tempfile::tempdir().unwrap();
        let config = P2PConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            chain_id: chain_id.to_string(),
            data_dir: dir.path().to_path_buf(),
            addrbook_strict: false,
            auth_enc_disable,
            ..P2PConfig::default()
        };
        let key = NodeKey::generate();
        let info = NodeInfo {
            pub_key: key.pub_key(),
            moniker: "test".to_string(),
            network: chain_id.to_string(),
            listen_addr: String::new(),
            version: "1.0.0".to_string(),
            genesis_hash: "genesis".to_string(),
            best_height: 0,
            best_hash: String::new(),
            service_flags: ServiceFlags::FULL_NODE,
            other: Vec::new(),
        };
        let book = AddrBook::new(config.addr_book_path(), false).into_shared();
        let sw = Switch::new(config, key, info, book, major_version_compatible).unwrap();
        let reactor = Arc::new(RecordingReactor::default());
        sw.add_reactor("recorder", reactor.clone()).unwrap();
        sw.start().await.unwrap();
        Node { _dir: dir, sw, reactor }
    }

    async fn wait_for_peers(sw: &Switch, n: usize) {
        for _ in 0..200 {
            if sw.peers().await.len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} peers", n);
    }

    #[tokio::test]
    async fn test_connect_and_route_message() {
        let a = node("mainnet", false).await;
        let b = node("mainnet", false).await;

        let addr_b = b.sw.listen_address().unwrap();
        let peer = a.sw.dial_peer_with_address(addr_b).await.unwrap();
        assert_eq!(peer.id(), b.sw.pub_key());
        assert!(peer.is_outbound());
        wait_for_peers(&b.sw, 1).await;
        assert_eq!(a.sw.num_peers().await, (1, 0, 0));
        assert_eq!(b.sw.num_peers().await, (0, 1, 0));
        assert_eq!(a.reactor.added.lock().await.as_slice(), &[b.sw.pub_key()]);

        peer.send(TEST_CHANNEL, Bytes::from_static(b"hello")).await.unwrap();
        loop {
            if let Some(msg) = b.reactor.received.lock().await.first() {
                assert_eq!(msg, &(TEST_CHANNEL, Bytes::from_static(b"hello")));
                break;
            }
            b.reactor.notify.notified().await;
        }

        a.sw.stop().await;
        b.sw.stop().await;
    }

    #[tokio::test]
    async fn test_plaintext_connection() {
        let a = node("mainnet", true).await;
        let b = node("mainnet", true).await;
        let peer = a.sw.dial_peer_with_address(b.sw.listen_address().unwrap()).await.unwrap();
        assert_eq!(peer.node_info().pub_key, b.sw.pub_key());
        a.sw.stop().await;
        b.sw.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_and_self() {
        let a = node("mainnet", false).await;
        let b = node("mainnet", false).await;
        let addr_b = b.sw.listen_address().unwrap();

        a.sw.dial_peer_with_address(addr_b).await.unwrap();
        assert!(matches!(
            a.sw.dial_peer_with_address(addr_b).await,
            Err(SwitchError::DuplicatePeer(_))
        ));
        assert!(matches!(
            a.sw.dial_peer_with_address(a.sw.listen_address().unwrap()).await,
            Err(SwitchError::ConnectSelf)
        ));
        a.sw.stop().await;
        b.sw.stop().await;
    }

    #[tokio::test]
    async fn test_network_mismatch() {
        let a = node("mainnet", false).await;
        let b = node("wisdom", false).await;
        assert!(matches!(
            a.sw.dial_peer_with_address(b.sw.listen_address().unwrap()).await,
            Err(SwitchError::NetworkMismatch { .. })
        ));
        assert!(a.sw.peers().await.is_empty());
        a.sw.stop().await;
        b.sw.stop().await;
    }

    #[tokio::test]
    async fn test_ban_blocks_dial_and_drops_peer() {
        let a = node("mainnet", false).await;
        let b = node("mainnet", false).await;
        let addr_b = b.sw.listen_address().unwrap();
        let peer = a.sw.dial_peer_with_address(addr_b).await.unwrap();

        let threshold = a.sw.config().ban.threshold;
        assert!(!a.sw.add_ban_score(addr_b.ip, threshold / 2, 0, "test").await);
        assert!(a.sw.add_ban_score(addr_b.ip, threshold / 2, 0, "test").await);
        assert!(a.sw.is_banned(&addr_b.ip).await);
        assert!(a.sw.peers().await.is_empty());
        assert!(!peer.is_running());
        assert_eq!(a.reactor.removed.lock().await.len(), 1);

        assert!(matches!(
            a.sw.dial_peer_with_address(addr_b).await,
            Err(SwitchError::ConnectBanned(_))
        ));
        a.sw.stop().await;
        b.sw.stop().await;
    }

    #[tokio::test]
    async fn test_remote_disconnect_removes_peer() {
        let a = node("mainnet", false).await;
        let b = node("mainnet", false).await;
        a.sw.dial_peer_with_address(b.sw.listen_address().unwrap()).await.unwrap();
        wait_for_peers(&b.sw, 1).await;

        b.sw.stop().await;
        wait_for_peers(&a.sw, 0).await;
        assert_eq!(a.reactor.removed.lock().await.as_slice(), &[b.sw.pub_key()]);
        a.sw.stop().await;
    }

    #[tokio::test]
    async fn test_reactor_channel_conflict() {
        let a = node("mainnet", false).await;
        let result = a.sw.add_reactor("other", Arc::new(RecordingReactor::default()));
        match result {
            Err(SwitchError::ReactorChannelConflict { channel, owner }) => {
                assert_eq!(channel, TEST_CHANNEL);
                assert_eq!(owner, "recorder");
            }
            other => panic!("unexpected {:?}", other.err()),
        }
        a.sw.stop().await;
    }
}

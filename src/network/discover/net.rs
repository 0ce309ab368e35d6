//! The discovery loop
//!
//! Every packet, timeout, tick and request is handled in order by a single
//! task that owns the routing table, the node records and the topic state.
//! Lookups run in their own tasks and reach the loop through [`Network`].

use crate::crypto::NodeKey;
use crate::network::discover::database::NodeDb;
use crate::network::discover::node::{id_hash, Hash, Node, NodeId, NodesByDistance, RpcEndpoint};
use crate::network::discover::packet::{
    chunk_nodes, decode_packet, max_nodes_per_packet, FindNodeHash, Neighbors, Packet, Ping, Pong, TopicNodes,
    TopicQuery, TopicRegister, PROTOCOL_VERSION,
};
use crate::network::discover::table::{Table, BUCKET_SIZE};
use crate::network::discover::ticket::{Ticket, TicketStore};
use crate::network::discover::topic::{topics_hash, Topic, TopicRadius, TopicTable, MIN_WAIT_SECS};
use crate::network::discover::udp::{spawn_reader, Ingress, Transport};
use crate::network::discover::{unix_now, DiscoverError};
use crate::network::upnp;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, interval_at, Instant};
use tokio_util::time::{delay_queue, DelayQueue};

// =============================================================================
// Constants
// =============================================================================

/// Concurrency of a lookup
pub const ALPHA: usize = 3;

/// How long to wait for a pong, a ping or a neighbors reply
pub const RESP_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a lookup waits on one node, including the handshake needed
/// before it can be queried
const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Lifetime of packets we send
pub const EXPIRATION_SECS: u64 = 20;

const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const REG_LOOKUP_INTERVAL: Duration = Duration::from_secs(60);
const SEARCH_INTERVAL: Duration = Duration::from_secs(10);

/// Unanswered topic queries are forgotten after this long
const TOPIC_QUERY_TTL: Duration = Duration::from_secs(10);

const SEED_COUNT: usize = 30;
const SEED_MAX_AGE_SECS: u64 = 5 * 24 * 60 * 60;

/// Failed find-node queries before a node is dropped from the table
const MAX_FIND_FAILS: u32 = 5;

/// Lookups run concurrently for topic registration and search
const MAX_TOPIC_LOOKUPS: usize = 5;

/// Upper bound on node records kept by the loop
const MAX_NODE_RECORDS: usize = 4096;

const REQUEST_QUEUE_SIZE: usize = 64;
const INGRESS_QUEUE_SIZE: usize = 256;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct DiscoverConfig {
    /// UDP address to bind
    pub listen_addr: String,
    pub chain_id: String,
    /// Nodes to seed from when the database has nothing fresh
    pub bootnodes: Vec<Node>,
    /// Peer port advertised with our endpoint
    pub tcp_port: u16,
    /// Address to advertise instead of the bound one
    pub external_ip: Option<IpAddr>,
    /// Shortest wait put into the topic tickets we issue
    pub min_ticket_wait: Duration,
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:46656".to_string(),
            chain_id: "mainnet".to_string(),
            bootnodes: Vec::new(),
            tcp_port: 46656,
            external_ip: None,
            min_ticket_wait: Duration::from_secs(MIN_WAIT_SECS as u64),
        }
    }
}

// =============================================================================
// Node state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unknown,
    /// We pinged first and wait for the pong
    VerifyInit,
    /// They pinged first; we answered and wait for our pong
    VerifyWait,
    /// Our ping was answered; give them a moment to ping us back
    RemoteVerifyWait,
    Known,
    /// Pinged again because a newer node wants its bucket slot
    Contested,
    Unresponsive,
}

impl NodeState {
    fn can_query(self) -> bool {
        matches!(self, NodeState::Known | NodeState::Contested)
    }

    /// Whether requests from the node are answered
    fn is_verified(self) -> bool {
        matches!(
            self,
            NodeState::RemoteVerifyWait | NodeState::Known | NodeState::Contested | NodeState::Unresponsive
        )
    }
}

enum Query {
    FindNode {
        target: Hash,
        reply: oneshot::Sender<Vec<Node>>,
    },
    Topic(Topic),
}

struct PendingNeighbors {
    reply: oneshot::Sender<Vec<Node>>,
    nodes: Vec<Node>,
}

struct NodeRecord {
    node: Node,
    state: NodeState,
    /// Hash of our last unanswered ping
    ping_echo: Option<Hash>,
    ping_topics: Vec<Topic>,
    deferred: Vec<Query>,
    pending_neighbors: Option<PendingNeighbors>,
}

impl NodeRecord {
    fn new(node: Node) -> Self {
        Self {
            node,
            state: NodeState::Unknown,
            ping_echo: None,
            ping_topics: Vec::new(),
            deferred: Vec::new(),
            pending_neighbors: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimeoutKind {
    Pong,
    Ping,
    Neighbors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Timeout {
    id: NodeId,
    kind: TimeoutKind,
}

struct Search {
    found: mpsc::Sender<Node>,
    radius: TopicRadius,
    seen: HashSet<NodeId>,
}

struct PendingTopicQuery {
    topic: Topic,
    node: NodeId,
    sent: Instant,
}

#[derive(Debug, Clone)]
enum LookupPurpose {
    Refresh,
    BucketRefresh,
    Register(Topic),
    Search(Topic),
}

enum Request {
    QueryFindNode {
        node: Node,
        target: Hash,
        reply: oneshot::Sender<Vec<Node>>,
    },
    Closest {
        target: Hash,
        reply: oneshot::Sender<Vec<Node>>,
    },
    RandomNodes {
        n: usize,
        reply: oneshot::Sender<Vec<Node>>,
    },
    Refresh {
        done: oneshot::Sender<()>,
    },
    SetFallbackNodes(Vec<Node>),
    RegisterTopic(Topic),
    StopRegisterTopic(Topic),
    SearchTopic {
        topic: Topic,
        found: mpsc::Sender<Node>,
    },
    NodeState {
        id: NodeId,
        reply: oneshot::Sender<Option<NodeState>>,
    },
    LookupDone {
        purpose: LookupPurpose,
        nodes: Vec<Node>,
    },
}

// =============================================================================
// Handle
// =============================================================================

/// Handle to a running discovery loop
#[derive(Clone)]
pub struct Network {
    self_node: Node,
    requests: mpsc::Sender<Request>,
    quit: Arc<watch::Sender<bool>>,
}

impl Network {
    /// Bind the discovery socket and start the loop
    pub async fn listen(key: NodeKey, config: DiscoverConfig) -> Result<Self, DiscoverError> {
        let socket = Arc::new(UdpSocket::bind(&config.listen_addr).await?);
        let bound = socket.local_addr()?;
        let ip = match config.external_ip {
            Some(ip) => ip,
            None if bound.ip().is_unspecified() => upnp::local_ipv4()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            None => bound.ip(),
        };
        let self_node = Node::new(key.pub_key(), ip, bound.port(), config.tcp_port);
        log::info!("Discovery listening on {} as {}", bound, self_node);

        let (quit_tx, quit_rx) = watch::channel(false);
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_QUEUE_SIZE);

        let network = Network {
            self_node: self_node.clone(),
            requests: requests_tx,
            quit: Arc::new(quit_tx),
        };

        spawn_reader(socket.clone(), config.chain_id.clone(), ingress_tx, quit_rx.clone());
        let discovery = Discovery::new(
            Transport::new(socket, key, config.chain_id),
            self_node,
            config.bootnodes,
            TopicTable::with_min_wait(config.min_ticket_wait.as_secs_f64()),
            network.clone(),
        );
        tokio::spawn(discovery.run(requests_rx, ingress_rx, quit_rx));
        Ok(network)
    }

    pub fn self_node(&self) -> &Node {
        &self.self_node
    }

    /// Stop the loop and the socket reader
    pub fn close(&self) {
        self.quit.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.quit.borrow()
    }

    async fn request<T: Default>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> T {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(make(tx)).await.is_err() {
            return T::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Nodes in our table closest to `target`
    pub async fn closest(&self, target: Hash) -> Vec<Node> {
        self.request(|reply| Request::Closest { target, reply }).await
    }

    /// Up to `n` random nodes from the routing table
    pub async fn read_random_nodes(&self, n: usize) -> Vec<Node> {
        self.request(|reply| Request::RandomNodes { n, reply }).await
    }

    /// Reseed the table and look up our own id; returns when done
    pub async fn refresh(&self) {
        let (done, rx) = oneshot::channel();
        if self.requests.send(Request::Refresh { done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// State of a node as seen by the loop
    pub async fn node_state(&self, id: &NodeId) -> Option<NodeState> {
        let id = *id;
        self.request(|reply| Request::NodeState { id, reply }).await
    }

    /// Replace the nodes used when the database has no fresh seeds
    pub async fn set_fallback_nodes(&self, nodes: Vec<Node>) -> Result<(), DiscoverError> {
        self.requests
            .send(Request::SetFallbackNodes(nodes))
            .await
            .map_err(|_| DiscoverError::Closed)
    }

    /// The nodes closest to `target` found by an iterative lookup
    pub async fn lookup(&self, target: Hash) -> Vec<Node> {
        self.lookup_with(target, Vec::new(), true).await
    }

    async fn lookup_with(&self, target: Hash, extra: Vec<Node>, allow_refresh: bool) -> Vec<Node> {
        let mut seeds = self.closest(target).await;
        seeds.extend(extra);
        if seeds.is_empty() && allow_refresh {
            self.refresh().await;
            seeds = self.closest(target).await;
        }
        let this = self;
        run_lookup(target, self.self_node.id, seeds, move |node| this.query_find_node(node, target)).await
    }

    async fn query_find_node(&self, node: Node, target: Hash) -> Vec<Node> {
        let (reply, rx) = oneshot::channel();
        if self
            .requests
            .send(Request::QueryFindNode { node, target, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        match tokio::time::timeout(QUERY_TIMEOUT, rx).await {
            Ok(Ok(nodes)) => nodes,
            _ => Vec::new(),
        }
    }

    /// Find the current endpoint of `id`
    pub async fn resolve(&self, id: &NodeId) -> Option<Node> {
        let sha = id_hash(id);
        if let Some(n) = self.closest(sha).await.into_iter().find(|n| n.id == *id) {
            return Some(n);
        }
        self.lookup(sha).await.into_iter().find(|n| n.id == *id)
    }

    /// Advertise this node under `topic` until stopped
    pub async fn register_topic(&self, topic: Topic) -> Result<(), DiscoverError> {
        self.requests
            .send(Request::RegisterTopic(topic))
            .await
            .map_err(|_| DiscoverError::Closed)
    }

    pub async fn stop_register_topic(&self, topic: Topic) -> Result<(), DiscoverError> {
        self.requests
            .send(Request::StopRegisterTopic(topic))
            .await
            .map_err(|_| DiscoverError::Closed)
    }

    /// Stream nodes advertising `topic` into `found` until it is closed
    pub async fn search_topic(&self, topic: Topic, found: mpsc::Sender<Node>) -> Result<(), DiscoverError> {
        self.requests
            .send(Request::SearchTopic { topic, found })
            .await
            .map_err(|_| DiscoverError::Closed)
    }
}

/// Iterative Kademlia lookup. Keeps the [`BUCKET_SIZE`] nodes closest to
/// `target`, asking at most [`ALPHA`] of them at a time, until every node in
/// the result has been asked.
pub(crate) async fn run_lookup<F, Fut>(target: Hash, self_id: NodeId, seeds: Vec<Node>, mut query: F) -> Vec<Node>
where
    F: FnMut(Node) -> Fut,
    Fut: Future<Output = Vec<Node>>,
{
    let mut result = NodesByDistance::new(target);
    let mut seen = HashSet::from([self_id]);
    let mut asked = HashSet::from([self_id]);
    for n in seeds {
        if seen.insert(n.id) {
            result.push(n, BUCKET_SIZE);
        }
    }

    let mut pending = FuturesUnordered::new();
    loop {
        for n in &result.entries {
            if pending.len() >= ALPHA {
                break;
            }
            if asked.insert(n.id) {
                pending.push(query(n.clone()));
            }
        }
        match pending.next().await {
            Some(nodes) => {
                for n in nodes {
                    if seen.insert(n.id) {
                        result.push(n, BUCKET_SIZE);
                    }
                }
            }
            None => break,
        }
    }
    result.entries
}

// =============================================================================
// Loop
// =============================================================================

struct Discovery {
    transport: Transport,
    self_node: Node,
    table: Table,
    db: NodeDb,
    nodes: HashMap<NodeId, NodeRecord>,
    timeouts: DelayQueue<Timeout>,
    timeout_keys: HashMap<Timeout, delay_queue::Key>,
    bootnodes: Vec<Node>,
    topic_table: TopicTable,
    tickets: TicketStore,
    searches: HashMap<Topic, Search>,
    topic_queries: HashMap<Hash, PendingTopicQuery>,
    refreshing: bool,
    refresh_waiters: Vec<oneshot::Sender<()>>,
    topic_lookups: usize,
    handle: Network,
}

impl Discovery {
    fn new(transport: Transport, self_node: Node, bootnodes: Vec<Node>, topic_table: TopicTable, handle: Network) -> Self {
        Self {
            transport,
            table: Table::new(self_node.clone()),
            db: NodeDb::new(self_node.id),
            self_node,
            nodes: HashMap::new(),
            timeouts: DelayQueue::new(),
            timeout_keys: HashMap::new(),
            bootnodes,
            topic_table,
            tickets: TicketStore::new(),
            searches: HashMap::new(),
            topic_queries: HashMap::new(),
            refreshing: false,
            refresh_waiters: Vec::new(),
            topic_lookups: 0,
            handle,
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut ingress: mpsc::Receiver<Ingress>,
        mut quit: watch::Receiver<bool>,
    ) {
        // First tick fires at once and seeds the table
        let mut refresh_tick = interval(REFRESH_INTERVAL);
        let mut bucket_tick = interval_at(Instant::now() + BUCKET_REFRESH_INTERVAL, BUCKET_REFRESH_INTERVAL);
        let mut reg_tick = interval(REG_LOOKUP_INTERVAL);
        let mut search_tick = interval(SEARCH_INTERVAL);
        let ticket_timer = tokio::time::sleep(REFRESH_INTERVAL);
        tokio::pin!(ticket_timer);

        loop {
            if *quit.borrow() {
                break;
            }
            let ticket_armed = match self.tickets.next_due() {
                Some(due) => {
                    let wait = Duration::from_secs(due.saturating_sub(unix_now()));
                    ticket_timer.as_mut().reset(Instant::now() + wait);
                    true
                }
                None => false,
            };

            tokio::select! {
                changed = quit.changed() => {
                    if changed.is_err() || *quit.borrow() {
                        break;
                    }
                }
                Some(req) = requests.recv() => self.handle_request(req),
                Some(pkt) = ingress.recv() => {
                    let name = pkt.decoded.packet.name();
                    let from = pkt.from;
                    if let Err(e) = self.handle_packet(pkt) {
                        log::debug!("Dropped {} from {}: {}", name, from, e);
                    }
                }
                Some(expired) = self.timeouts.next() => self.handle_timeout(expired.into_inner()),
                _ = refresh_tick.tick() => {
                    let now = unix_now();
                    let expired = self.db.expire(now);
                    if expired > 0 {
                        log::debug!("Expired {} nodes from the node database", expired);
                    }
                    self.topic_table.expire(now);
                    self.start_refresh();
                }
                _ = bucket_tick.tick() => self.bucket_refresh(),
                _ = reg_tick.tick() => self.registration_round(),
                _ = search_tick.tick() => self.search_round(),
                _ = &mut ticket_timer, if ticket_armed => self.redeem_tickets(),
            }
        }
        log::info!("Discovery stopped");
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    fn handle_request(&mut self, req: Request) {
        match req {
            Request::QueryFindNode { node, target, reply } => {
                self.query_or_defer(node, Query::FindNode { target, reply });
            }
            Request::Closest { target, reply } => {
                let _ = reply.send(self.table.closest(&target, BUCKET_SIZE));
            }
            Request::RandomNodes { n, reply } => {
                let _ = reply.send(self.table.read_random_nodes(n));
            }
            Request::Refresh { done } => {
                self.refresh_waiters.push(done);
                if !self.refreshing {
                    self.start_refresh();
                }
            }
            Request::SetFallbackNodes(nodes) => {
                self.bootnodes = nodes;
            }
            Request::RegisterTopic(topic) => {
                if self.tickets.add_topic(topic.clone()) {
                    log::info!("Registering topic {}", topic);
                    self.spawn_topic_lookup(LookupPurpose::Register(topic));
                }
            }
            Request::StopRegisterTopic(topic) => {
                if self.tickets.remove_topic(&topic) {
                    log::info!("Stopped registering topic {}", topic);
                }
            }
            Request::SearchTopic { topic, found } => {
                self.searches.insert(
                    topic.clone(),
                    Search {
                        found,
                        radius: TopicRadius::new(&topic),
                        seen: HashSet::new(),
                    },
                );
                self.spawn_topic_lookup(LookupPurpose::Search(topic));
            }
            Request::NodeState { id, reply } => {
                let _ = reply.send(self.nodes.get(&id).map(|r| r.state));
            }
            Request::LookupDone { purpose, nodes } => self.lookup_done(purpose, nodes),
        }
    }

    fn start_refresh(&mut self) {
        let mut seeds = self.db.query_seeds(SEED_COUNT, SEED_MAX_AGE_SECS, unix_now());
        if seeds.is_empty() {
            seeds = self.bootnodes.clone();
        }
        log::debug!("Refreshing the routing table from {} seeds", seeds.len());
        for seed in &seeds {
            self.intern(seed.clone());
            if self.state_of(&seed.id) == Some(NodeState::Unknown) {
                self.transition(&seed.id, NodeState::VerifyInit);
            }
        }
        self.refreshing = true;
        self.spawn_lookup(self.self_node.sha, seeds, LookupPurpose::Refresh);
    }

    fn bucket_refresh(&mut self) {
        let pruned = self.prune_records();
        if pruned > 0 {
            log::debug!("Dropped {} idle node records, {} left", pruned, self.nodes.len());
        }
        if self.refreshing {
            return;
        }
        if self.table.is_empty() {
            self.start_refresh();
            return;
        }
        let target = self.table.choose_bucket_refresh_target();
        self.spawn_lookup(target, Vec::new(), LookupPurpose::BucketRefresh);
    }

    fn spawn_lookup(&mut self, target: Hash, seeds: Vec<Node>, purpose: LookupPurpose) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let nodes = handle.lookup_with(target, seeds, false).await;
            let _ = handle.requests.send(Request::LookupDone { purpose, nodes }).await;
        });
    }

    fn spawn_topic_lookup(&mut self, purpose: LookupPurpose) {
        if self.topic_lookups >= MAX_TOPIC_LOOKUPS {
            return;
        }
        let target = match &purpose {
            LookupPurpose::Register(t) | LookupPurpose::Search(t) => t.hash(),
            _ => return,
        };
        self.topic_lookups += 1;
        self.spawn_lookup(target, Vec::new(), purpose);
    }

    fn lookup_done(&mut self, purpose: LookupPurpose, nodes: Vec<Node>) {
        match purpose {
            LookupPurpose::Refresh => {
                self.refreshing = false;
                log::debug!("Refresh done, {} nodes in table", self.table.len());
                for done in self.refresh_waiters.drain(..) {
                    let _ = done.send(());
                }
            }
            LookupPurpose::BucketRefresh => {}
            LookupPurpose::Register(topic) => {
                self.topic_lookups = self.topic_lookups.saturating_sub(1);
                if !self.tickets.topics().contains(&topic) {
                    return;
                }
                // Pings carry our topics; the pongs bring tickets
                for node in nodes {
                    self.intern(node.clone());
                    match self.state_of(&node.id) {
                        Some(NodeState::Unknown) => self.transition(&node.id, NodeState::VerifyInit),
                        Some(s) if s.can_query() => self.send_ping(&node.id),
                        _ => {}
                    }
                }
            }
            LookupPurpose::Search(topic) => {
                self.topic_lookups = self.topic_lookups.saturating_sub(1);
                let in_radius: Vec<Node> = match self.searches.get(&topic) {
                    Some(search) => nodes.into_iter().filter(|n| search.radius.in_radius(n)).collect(),
                    None => return,
                };
                for node in in_radius {
                    self.query_or_defer(node, Query::Topic(topic.clone()));
                }
            }
        }
    }

    fn registration_round(&mut self) {
        for topic in self.tickets.topics() {
            self.spawn_topic_lookup(LookupPurpose::Register(topic));
        }
    }

    fn search_round(&mut self) {
        self.searches.retain(|topic, s| {
            let open = !s.found.is_closed();
            if !open {
                log::debug!("Search for {} finished", topic);
            }
            open
        });
        self.topic_queries.retain(|_, q| q.sent.elapsed() < TOPIC_QUERY_TTL);
        let topics: Vec<Topic> = self.searches.keys().cloned().collect();
        for topic in topics {
            self.spawn_topic_lookup(LookupPurpose::Search(topic));
        }
    }

    fn redeem_tickets(&mut self) {
        let now = unix_now();
        while let Some(due) = self.tickets.take_due(now) {
            let ticket = due.ticket;
            let packet = Packet::TopicRegister(TopicRegister {
                topics: ticket.topics.clone(),
                idx: due.idx as u32,
                pong: hex::encode(&ticket.pong),
            });
            log::debug!("Registering {} at {}", ticket.topics[due.idx], ticket.node);
            if let Err(e) = self.transport.send(ticket.node.udp_addr(), &packet) {
                log::debug!("Failed to send topic registration: {}", e);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Node records
    // -------------------------------------------------------------------------

    fn state_of(&self, id: &NodeId) -> Option<NodeState> {
        self.nodes.get(id).map(|r| r.state)
    }

    fn intern(&mut self, node: Node) {
        if node.id == self.self_node.id || !node.is_valid() {
            return;
        }
        if !self.nodes.contains_key(&node.id) && self.nodes.len() >= MAX_NODE_RECORDS {
            self.prune_records();
            if self.nodes.len() >= MAX_NODE_RECORDS {
                log::debug!("Node records full, ignoring {}", node);
                return;
            }
        }
        self.nodes.entry(node.id).or_insert_with(|| NodeRecord::new(node));
    }

    /// Whether the loop still waits on something from the node
    fn is_busy(&self, id: &NodeId, rec: &NodeRecord) -> bool {
        rec.ping_echo.is_some()
            || !rec.deferred.is_empty()
            || rec.pending_neighbors.is_some()
            || [TimeoutKind::Pong, TimeoutKind::Ping, TimeoutKind::Neighbors]
                .into_iter()
                .any(|kind| self.timeout_keys.contains_key(&Timeout { id: *id, kind }))
            || self.topic_queries.values().any(|q| q.node == *id)
    }

    /// Forget nodes that are neither in the table nor in the middle of an
    /// exchange; returns how many were dropped
    fn prune_records(&mut self) -> usize {
        let idle: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(id, rec)| !self.table.knows(id) && !self.is_busy(id, rec))
            .map(|(id, _)| *id)
            .collect();
        for id in &idle {
            self.nodes.remove(id);
        }
        idle.len()
    }

    fn query_or_defer(&mut self, node: Node, query: Query) {
        let id = node.id;
        self.intern(node);
        let Some(state) = self.state_of(&id) else {
            // Our own id or an unusable address
            return;
        };
        if state.can_query() {
            self.send_query(&id, query);
            return;
        }
        if let Some(rec) = self.nodes.get_mut(&id) {
            rec.deferred.push(query);
        }
        if state == NodeState::Unknown {
            self.transition(&id, NodeState::VerifyInit);
        }
    }

    fn send_query(&mut self, id: &NodeId, query: Query) {
        let Some(rec) = self.nodes.get_mut(id) else {
            return;
        };
        let addr = rec.node.udp_addr();
        match query {
            Query::FindNode { target, reply } => {
                if rec.pending_neighbors.is_some() {
                    // One find-node in flight per node
                    let _ = reply.send(Vec::new());
                    return;
                }
                let packet = Packet::FindNodeHash(FindNodeHash {
                    target,
                    expiration: unix_now() + EXPIRATION_SECS,
                });
                match self.transport.send(addr, &packet) {
                    Ok(_) => {
                        rec.pending_neighbors = Some(PendingNeighbors {
                            reply,
                            nodes: Vec::new(),
                        });
                        self.arm(*id, TimeoutKind::Neighbors, RESP_TIMEOUT);
                    }
                    Err(e) => {
                        log::debug!("Failed to send findnode to {}: {}", addr, e);
                        let _ = reply.send(Vec::new());
                    }
                }
            }
            Query::Topic(topic) => {
                let packet = Packet::TopicQuery(TopicQuery {
                    topic: topic.clone(),
                    expiration: unix_now() + EXPIRATION_SECS,
                });
                match self.transport.send(addr, &packet) {
                    Ok((hash, _)) => {
                        self.topic_queries.insert(
                            hash,
                            PendingTopicQuery {
                                topic,
                                node: *id,
                                sent: Instant::now(),
                            },
                        );
                    }
                    Err(e) => log::debug!("Failed to send topic query to {}: {}", addr, e),
                }
            }
        }
    }

    fn send_ping(&mut self, id: &NodeId) {
        let topics = self.tickets.topics();
        let Some(rec) = self.nodes.get_mut(id) else {
            return;
        };
        let packet = Packet::Ping(Ping {
            version: PROTOCOL_VERSION,
            from: self.self_node.endpoint(),
            to: rec.node.endpoint(),
            expiration: unix_now() + EXPIRATION_SECS,
            topics: topics.clone(),
        });
        match self.transport.send(rec.node.udp_addr(), &packet) {
            Ok((hash, _)) => {
                rec.ping_echo = Some(hash);
                rec.ping_topics = topics;
                self.db.update_last_ping(id, unix_now());
                self.arm(*id, TimeoutKind::Pong, RESP_TIMEOUT);
            }
            Err(e) => log::debug!("Failed to ping {}: {}", rec.node, e),
        }
    }

    fn transition(&mut self, id: &NodeId, next: NodeState) {
        let Some(rec) = self.nodes.get_mut(id) else {
            return;
        };
        if rec.state == next {
            return;
        }
        log::trace!("Node {} {:?} -> {:?}", rec.node, rec.state, next);
        rec.state = next;

        match next {
            NodeState::Unknown => self.enter_unknown(id),
            NodeState::VerifyInit | NodeState::Contested => self.send_ping(id),
            NodeState::VerifyWait => {}
            NodeState::RemoteVerifyWait => self.arm(*id, TimeoutKind::Ping, RESP_TIMEOUT),
            NodeState::Known => self.enter_known(id),
            NodeState::Unresponsive => {
                if let Some(replacement) = self.table.delete_replace(id) {
                    log::debug!("Replaced unresponsive node {} with {}", id, replacement);
                }
            }
        }
    }

    fn enter_known(&mut self, id: &NodeId) {
        let Some(rec) = self.nodes.get_mut(id) else {
            return;
        };
        let node = rec.node.clone();
        let deferred = std::mem::take(&mut rec.deferred);
        self.db.update_node(&node, unix_now());

        if let Some(contested) = self.table.add(node) {
            if self.state_of(&contested.id) == Some(NodeState::Known) {
                self.transition(&contested.id, NodeState::Contested);
            }
        }
        for query in deferred {
            self.send_query(id, query);
        }
    }

    fn enter_unknown(&mut self, id: &NodeId) {
        self.table.delete(id);
        for kind in [TimeoutKind::Pong, TimeoutKind::Ping, TimeoutKind::Neighbors] {
            self.cancel(*id, kind);
        }
        // Dropping the record drops every reply sender it holds
        self.nodes.remove(id);
    }

    // -------------------------------------------------------------------------
    // Timeouts
    // -------------------------------------------------------------------------

    fn arm(&mut self, id: NodeId, kind: TimeoutKind, after: Duration) {
        let t = Timeout { id, kind };
        if let Some(key) = self.timeout_keys.remove(&t) {
            self.timeouts.try_remove(&key);
        }
        let key = self.timeouts.insert(t, after);
        self.timeout_keys.insert(t, key);
    }

    fn cancel(&mut self, id: NodeId, kind: TimeoutKind) {
        if let Some(key) = self.timeout_keys.remove(&Timeout { id, kind }) {
            self.timeouts.try_remove(&key);
        }
    }

    fn handle_timeout(&mut self, t: Timeout) {
        self.timeout_keys.remove(&t);
        let Some(state) = self.state_of(&t.id) else {
            return;
        };
        match t.kind {
            TimeoutKind::Pong => {
                if let Some(rec) = self.nodes.get_mut(&t.id) {
                    rec.ping_echo = None;
                }
                match state {
                    NodeState::VerifyInit | NodeState::VerifyWait => self.transition(&t.id, NodeState::Unknown),
                    NodeState::Contested => self.transition(&t.id, NodeState::Unresponsive),
                    _ => {}
                }
            }
            TimeoutKind::Ping => {
                if state == NodeState::RemoteVerifyWait {
                    self.transition(&t.id, NodeState::Known);
                }
            }
            TimeoutKind::Neighbors => {
                let Some(pending) = self.nodes.get_mut(&t.id).and_then(|r| r.pending_neighbors.take()) else {
                    return;
                };
                if pending.nodes.is_empty() {
                    let fails = self.db.find_fails(&t.id) + 1;
                    self.db.update_find_fails(&t.id, fails);
                    if fails >= MAX_FIND_FAILS {
                        log::debug!("Dropping {} after {} failed queries", t.id, fails);
                        self.transition(&t.id, NodeState::Unknown);
                    }
                }
                let _ = pending.reply.send(pending.nodes);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Packets
    // -------------------------------------------------------------------------

    fn handle_packet(&mut self, ingress: Ingress) -> Result<(), DiscoverError> {
        let Ingress { from, decoded, raw } = ingress;
        let id = decoded.from_id;
        if id == self.self_node.id {
            return Err(DiscoverError::WrongAddress);
        }
        if let Some(expiration) = decoded.packet.expiration() {
            if expiration < unix_now() {
                return Err(DiscoverError::Expired);
            }
        }

        let state = match self.nodes.get_mut(&id) {
            Some(rec) => {
                if rec.node.udp_addr() != from {
                    if rec.state != NodeState::Unknown {
                        return Err(DiscoverError::WrongAddress);
                    }
                    rec.node = Node::new(id, from.ip(), from.port(), rec.node.tcp);
                }
                rec.state
            }
            None => match &decoded.packet {
                Packet::Ping(p) => {
                    let node = Node::new(id, from.ip(), from.port(), p.from.tcp);
                    self.nodes.insert(id, NodeRecord::new(node));
                    NodeState::Unknown
                }
                _ => return Err(DiscoverError::UnknownNode),
            },
        };

        match decoded.packet {
            Packet::Ping(ping) => {
                self.reply_pong(&id, from, &ping, decoded.hash)?;
                match state {
                    NodeState::Unknown => {
                        self.send_ping(&id);
                        self.transition(&id, NodeState::VerifyWait);
                    }
                    NodeState::VerifyInit => self.transition(&id, NodeState::VerifyWait),
                    NodeState::Unresponsive => self.transition(&id, NodeState::Known),
                    _ => {}
                }
                Ok(())
            }
            Packet::Pong(pong) => {
                self.handle_pong(&id, pong, raw)?;
                match state {
                    NodeState::VerifyInit => self.transition(&id, NodeState::RemoteVerifyWait),
                    NodeState::VerifyWait | NodeState::Contested | NodeState::Unresponsive => {
                        self.transition(&id, NodeState::Known)
                    }
                    _ => {}
                }
                Ok(())
            }
            Packet::FindNode(req) => {
                if !state.is_verified() {
                    return Err(DiscoverError::UnknownNode);
                }
                self.reply_neighbors(from, &id_hash(&req.target))
            }
            Packet::FindNodeHash(req) => {
                if !state.is_verified() {
                    return Err(DiscoverError::UnknownNode);
                }
                self.reply_neighbors(from, &req.target)
            }
            Packet::Neighbors(resp) => self.handle_neighbors(&id, resp),
            Packet::TopicRegister(reg) => {
                if !state.is_verified() {
                    return Err(DiscoverError::UnknownNode);
                }
                self.handle_topic_register(&id, from, reg)
            }
            Packet::TopicQuery(query) => {
                if !state.is_verified() {
                    return Err(DiscoverError::UnknownNode);
                }
                self.reply_topic_nodes(from, &query, decoded.hash)
            }
            Packet::TopicNodes(resp) => self.handle_topic_nodes(&id, resp),
        }
    }

    fn reply_pong(&mut self, id: &NodeId, from: SocketAddr, ping: &Ping, ping_hash: Hash) -> Result<(), DiscoverError> {
        let (topic_hash, ticket_serial, wait_periods) = if ping.topics.is_empty() {
            (Hash::default(), 0, Vec::new())
        } else {
            let (serial, waits) = self.topic_table.issue_ticket(id, &ping.topics);
            (topics_hash(&ping.topics), serial, waits)
        };
        let pong = Packet::Pong(Pong {
            to: RpcEndpoint {
                ip: from.ip(),
                udp: from.port(),
                tcp: ping.from.tcp,
            },
            reply_tok: ping_hash,
            expiration: unix_now() + EXPIRATION_SECS,
            topic_hash,
            ticket_serial,
            wait_periods,
        });
        self.transport.send(from, &pong)?;
        Ok(())
    }

    fn handle_pong(&mut self, id: &NodeId, pong: Pong, raw: Vec<u8>) -> Result<(), DiscoverError> {
        let rec = self.nodes.get_mut(id).ok_or(DiscoverError::UnknownNode)?;
        if rec.ping_echo != Some(pong.reply_tok) {
            return Err(DiscoverError::NoQuery);
        }
        rec.ping_echo = None;
        let topics = std::mem::take(&mut rec.ping_topics);
        let node = rec.node.clone();
        self.cancel(*id, TimeoutKind::Pong);
        self.db.update_node(&node, unix_now());
        self.db.update_last_pong(id, unix_now());

        if !topics.is_empty()
            && pong.ticket_serial != 0
            && pong.topic_hash == topics_hash(&topics)
            && pong.wait_periods.len() == topics.len()
        {
            let issue_time = pong.expiration.saturating_sub(EXPIRATION_SECS);
            self.tickets
                .add_ticket(Ticket::new(node, topics, pong.ticket_serial, issue_time, &pong.wait_periods, raw));
        }
        Ok(())
    }

    fn reply_neighbors(&mut self, to: SocketAddr, target: &Hash) -> Result<(), DiscoverError> {
        let closest: Vec<_> = self.table.closest(target, BUCKET_SIZE).iter().map(|n| n.to_rpc()).collect();
        for chunk in chunk_nodes(&closest) {
            let packet = Packet::Neighbors(Neighbors {
                nodes: chunk,
                expiration: unix_now() + EXPIRATION_SECS,
            });
            self.transport.send(to, &packet)?;
        }
        Ok(())
    }

    fn handle_neighbors(&mut self, id: &NodeId, resp: Neighbors) -> Result<(), DiscoverError> {
        let self_id = self.self_node.id;
        let rec = self.nodes.get_mut(id).ok_or(DiscoverError::UnknownNode)?;
        let pending = rec.pending_neighbors.as_mut().ok_or(DiscoverError::NoQuery)?;

        let chunk_len = resp.nodes.len();
        pending.nodes.extend(
            resp.nodes
                .into_iter()
                .map(Node::from)
                .filter(|n| n.id != self_id && n.is_valid()),
        );
        // Full chunks mean more may follow
        if chunk_len < max_nodes_per_packet() || pending.nodes.len() >= BUCKET_SIZE {
            if let Some(done) = rec.pending_neighbors.take() {
                let _ = done.reply.send(done.nodes);
            }
            self.cancel(*id, TimeoutKind::Neighbors);
            self.db.update_find_fails(id, 0);
        }
        Ok(())
    }

    fn handle_topic_register(&mut self, id: &NodeId, from: SocketAddr, reg: TopicRegister) -> Result<(), DiscoverError> {
        let raw = hex::decode(&reg.pong).map_err(|e| DiscoverError::InvalidTicket(e.to_string()))?;
        let issued = decode_packet(&raw, self.transport.chain_id())?;
        if issued.from_id != self.self_node.id {
            return Err(DiscoverError::InvalidTicket("not issued by us".to_string()));
        }
        let Packet::Pong(pong) = issued.packet else {
            return Err(DiscoverError::InvalidTicket("not a pong".to_string()));
        };
        if pong.to.ip != from.ip() {
            return Err(DiscoverError::InvalidTicket("issued to another address".to_string()));
        }
        if pong.topic_hash != topics_hash(&reg.topics) {
            return Err(DiscoverError::InvalidTicket("topic hash mismatch".to_string()));
        }

        let node = self.nodes.get(id).map(|r| r.node.clone()).ok_or(DiscoverError::UnknownNode)?;
        let issue_time = pong.expiration.saturating_sub(EXPIRATION_SECS);
        self.topic_table.use_ticket(
            &node,
            pong.ticket_serial,
            &reg.topics,
            reg.idx as usize,
            issue_time,
            &pong.wait_periods,
            unix_now(),
        )?;
        log::debug!("{} registered topic {}", node, reg.topics[reg.idx as usize]);
        Ok(())
    }

    fn reply_topic_nodes(&mut self, to: SocketAddr, query: &TopicQuery, echo: Hash) -> Result<(), DiscoverError> {
        let entries: Vec<_> = self
            .topic_table
            .get_entries(&query.topic, unix_now())
            .iter()
            .map(|n| n.to_rpc())
            .collect();
        for chunk in chunk_nodes(&entries) {
            let packet = Packet::TopicNodes(TopicNodes { echo, nodes: chunk });
            self.transport.send(to, &packet)?;
        }
        Ok(())
    }

    fn handle_topic_nodes(&mut self, id: &NodeId, resp: TopicNodes) -> Result<(), DiscoverError> {
        let topic = match self.topic_queries.get(&resp.echo) {
            Some(q) if q.node == *id => q.topic.clone(),
            _ => return Err(DiscoverError::NoQuery),
        };
        let Some(replier) = self.nodes.get(id).map(|r| r.node.clone()) else {
            return Err(DiscoverError::UnknownNode);
        };
        let Some(search) = self.searches.get_mut(&topic) else {
            return Ok(());
        };
        search.radius.add_sample(&replier, !resp.nodes.is_empty());
        let mut closed = false;
        for n in resp.nodes {
            let node = Node::from(n);
            if !search.seen.insert(node.id) {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Closed(_)) = search.found.try_send(node) {
                closed = true;
                break;
            }
        }
        if closed {
            self.searches.remove(&topic);
        }
        Ok(())
    }
}

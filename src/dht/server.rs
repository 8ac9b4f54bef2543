//! The DHT engine: a single task owning the socket and all mutable state,
//! multiplexing inbound packets, embedder requests, and periodic
//! housekeeping. Auxiliary tasks (UDP reader, ping pacer) touch none of
//! that state and talk to the engine over bounded channels only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::arena::Arena;
use super::config::{Config, Proto};
use super::error::DhtError;
use super::id::{InfoHash, NodeId};
use super::krpc::{self, ErrorMsg, Packet, Query, QueryBody, Reply, MAX_UDP_PACKET_SIZE};
use super::metrics::Stats;
use super::node::QueryKind;
use super::peer_store::PeerStore;
use super::store::DhtStore;
use super::table::RoutingTable;
use super::throttle::HostThrottle;

// Try to keep at least this many nodes in the routing table.
const MIN_NODES: usize = 16;

const SECRET_ROTATE_PERIOD: Duration = Duration::from_secs(5 * 60);

const INBOUND_QUEUE_LEN: usize = 128;
const ARENA_BLOCKS: usize = 256;

/// A Mainline DHT node.
///
/// Created with [`Dht::new`]; discovered peers arrive on the result
/// channel read by [`Dht::peers`]. The embedding torrent client asks for
/// peers per infohash and the node walks the DHT, answering remote
/// queries along the way.
///
/// ```no_run
/// use rdht::dht::{Config, Dht, InfoHash};
///
/// # async fn example() -> Result<(), rdht::dht::DhtError> {
/// let mut dht = Dht::new(Config::default()).await?;
/// let info_hash = InfoHash::from_hex("d1c5676ae7ac98e8b19f63565905105e3c4c37a2")?;
/// dht.peers_request(info_hash, false);
///
/// while let Some(batch) = dht.peers().await {
///     for (ih, peers) in batch {
///         println!("{}: {} peers", ih, peers.len());
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Dht {
    acquaintance_tx: mpsc::Sender<String>,
    peers_req_tx: mpsc::Sender<IhRequest>,
    port_tx: mpsc::Sender<oneshot::Sender<u16>>,
    stats_tx: mpsc::Sender<oneshot::Sender<Stats>>,
    results_rx: mpsc::Receiver<HashMap<InfoHash, Vec<SocketAddr>>>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct IhRequest {
    info_hash: InfoHash,
    announce: bool,
}

impl Dht {
    /// Binds the UDP socket, loads (or creates) the persisted identity,
    /// and spawns the engine. Configuration problems are fatal here;
    /// everything after startup is best-effort.
    pub async fn new(config: Config) -> Result<Dht, DhtError> {
        let proto = config.proto()?;
        let bind = config.bind_addr()?;
        let socket = UdpSocket::bind(&bind)
            .await
            .map_err(|err| DhtError::Config(format!("cannot bind {}: {}", bind, err)))?;
        let local_addr = socket.local_addr()?;

        let mut store = DhtStore::open(config.port, config.save_routing_table);
        if store.id.len() != NodeId::LEN {
            store.id = NodeId::generate().as_bytes().to_vec();
            store.save();
        }
        let node_id = NodeId::from_bytes(&store.id)?;
        info!("DHT node {} listening on {}", node_id, local_addr);

        let (packets_tx, packets_rx) = mpsc::channel(INBOUND_QUEUE_LEN);
        let (acquaintance_tx, acquaintance_rx) = mpsc::channel(100);
        let (peers_req_tx, peers_req_rx) = mpsc::channel(100);
        let (nodes_req_tx, nodes_req_rx) = mpsc::channel(100);
        let (ping_tx, ping_rx) = mpsc::channel(16);
        let (port_tx, port_rx) = mpsc::channel(1);
        let (stats_tx, stats_rx) = mpsc::channel(1);
        let (results_tx, results_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let socket = Arc::new(socket);
        let arena = Arena::new(MAX_UDP_PACKET_SIZE, ARENA_BLOCKS);
        let reader_dropped = Arc::new(AtomicU64::new(0));
        tokio::spawn(read_loop(
            socket.clone(),
            arena.clone(),
            packets_tx,
            reader_dropped.clone(),
            stop_rx.clone(),
        ));

        let bootstrap: Vec<String> = store.remotes.keys().cloned().collect();
        let engine = Engine {
            table: RoutingTable::new(node_id),
            peers: PeerStore::new(config.max_infohashes, config.max_infohash_peers),
            throttle: HostThrottle::new(
                config.client_per_minute_limit,
                config.throttler_tracked_clients,
            ),
            secrets: TokenSecrets::new(),
            stats: Stats::default(),
            store,
            node_id,
            proto,
            port: local_addr.port(),
            socket,
            arena,
            reader_dropped,
            rate_window_start: Instant::now(),
            rate_count: 0,
            nodes_req_tx,
            ping_tx,
            results_tx,
            stop_rx: stop_rx.clone(),
            config,
        };
        let channels = EngineChannels {
            packets_rx,
            acquaintance_rx,
            peers_req_rx,
            nodes_req_rx,
            ping_rx,
            port_rx,
            stats_rx,
            stop_rx,
        };
        let task = tokio::spawn(engine.run(channels, bootstrap));

        Ok(Dht {
            acquaintance_tx,
            peers_req_tx,
            port_tx,
            stats_tx,
            results_rx,
            stop_tx,
            task,
        })
    }

    /// Enqueues a `"host:port"` address for the routing table. Dropped
    /// silently when the bootstrap queue is full.
    pub fn add_node(&self, addr: &str) {
        let _ = self.acquaintance_tx.try_send(addr.to_string());
    }

    /// Asks the DHT for more peers for `info_hash`. With `announce` set
    /// the node also announces itself as actively downloading once peers
    /// are found.
    pub fn peers_request(&self, info_hash: InfoHash, announce: bool) {
        let _ = self.peers_req_tx.try_send(IhRequest {
            info_hash,
            announce,
        });
    }

    /// The UDP port actually bound, useful with port 0 in the config.
    pub async fn port(&self) -> Result<u16, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.port_tx
            .send(tx)
            .await
            .map_err(|_| DhtError::ShuttingDown)?;
        rx.await.map_err(|_| DhtError::ShuttingDown)
    }

    /// Snapshot of the engine counters.
    pub async fn stats(&self) -> Result<Stats, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.stats_tx
            .send(tx)
            .await
            .map_err(|_| DhtError::ShuttingDown)?;
        rx.await.map_err(|_| DhtError::ShuttingDown)
    }

    /// The next batch of discovered peers. The engine drops updates when
    /// this channel is not drained. `None` after [`Dht::stop`].
    pub async fn peers(&mut self) -> Option<HashMap<InfoHash, Vec<SocketAddr>>> {
        self.results_rx.recv().await
    }

    /// Graceful shutdown: abandons in-flight queries, saves the routing
    /// table, and waits for the engine to exit.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

struct EngineChannels {
    packets_rx: mpsc::Receiver<(BytesMut, SocketAddr)>,
    acquaintance_rx: mpsc::Receiver<String>,
    peers_req_rx: mpsc::Receiver<IhRequest>,
    nodes_req_rx: mpsc::Receiver<InfoHash>,
    ping_rx: mpsc::Receiver<String>,
    port_rx: mpsc::Receiver<oneshot::Sender<u16>>,
    stats_rx: mpsc::Receiver<oneshot::Sender<Stats>>,
    stop_rx: watch::Receiver<bool>,
}

struct Engine {
    table: RoutingTable,
    peers: PeerStore,
    throttle: HostThrottle,
    secrets: TokenSecrets,
    stats: Stats,
    store: DhtStore,
    node_id: NodeId,
    proto: Proto,
    port: u16,
    socket: Arc<UdpSocket>,
    arena: Arc<Arena>,
    reader_dropped: Arc<AtomicU64>,
    rate_window_start: Instant,
    rate_count: i64,
    nodes_req_tx: mpsc::Sender<InfoHash>,
    ping_tx: mpsc::Sender<String>,
    results_tx: mpsc::Sender<HashMap<InfoHash, Vec<SocketAddr>>>,
    stop_rx: watch::Receiver<bool>,
    config: Config,
}

impl Engine {
    async fn run(mut self, mut ch: EngineChannels, bootstrap: Vec<String>) {
        let mut cleanup = tokio::time::interval(self.config.cleanup_period);
        let mut save = tokio::time::interval(self.config.save_period);
        let mut rotate = tokio::time::interval(SECRET_ROTATE_PERIOD);
        for timer in [&mut cleanup, &mut save, &mut rotate] {
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            timer.tick().await;
        }

        for addr in bootstrap {
            self.handle_add_node(addr).await;
        }
        let _ = self.nodes_req_tx.try_send(self.node_id);

        loop {
            tokio::select! {
                changed = ch.stop_rx.changed() => {
                    // A dropped handle counts as a stop signal.
                    if changed.is_err() || *ch.stop_rx.borrow() {
                        break;
                    }
                }
                Some((buf, from)) = ch.packets_rx.recv() => {
                    self.on_packet(buf, from).await;
                }
                Some(addr) = ch.acquaintance_rx.recv() => {
                    self.handle_add_node(addr).await;
                }
                Some(req) = ch.peers_req_rx.recv() => {
                    self.handle_peers_request(req).await;
                }
                Some(ih) = ch.nodes_req_rx.recv() => {
                    self.handle_nodes_request(ih).await;
                }
                Some(addr_key) = ch.ping_rx.recv() => {
                    self.send_ping(&addr_key).await;
                }
                Some(reply_to) = ch.port_rx.recv() => {
                    let _ = reply_to.send(self.port);
                }
                Some(reply_to) = ch.stats_rx.recv() => {
                    let _ = reply_to.send(self.stats_snapshot());
                }
                _ = cleanup.tick() => {
                    self.on_cleanup();
                }
                _ = save.tick() => {
                    self.save_store();
                }
                _ = rotate.tick() => {
                    self.secrets.rotate();
                }
            }
        }

        info!("DHT node stopping");
        self.save_store();
    }

    fn stats_snapshot(&self) -> Stats {
        let mut stats = self.stats.clone();
        stats.total_dropped_packets += self.reader_dropped.load(Ordering::Relaxed);
        stats
    }

    fn rate_ok(&mut self) -> bool {
        if self.config.rate_limit < 0 {
            return true;
        }
        let now = Instant::now();
        if now.duration_since(self.rate_window_start) >= Duration::from_secs(1) {
            self.rate_window_start = now;
            self.rate_count = 0;
        }
        self.rate_count += 1;
        self.rate_count <= self.config.rate_limit
    }

    async fn on_packet(&mut self, buf: BytesMut, from: SocketAddr) {
        self.stats.total_recv += 1;
        self.stats.total_read_bytes += buf.len() as u64;

        if !self.rate_ok() {
            self.stats.total_dropped_packets += 1;
            self.arena.release(buf);
            return;
        }
        if !self.throttle.allow(&from.ip().to_string()) {
            self.stats.total_packets_from_blocked_hosts += 1;
            self.arena.release(buf);
            return;
        }

        let parsed = Packet::parse(&buf);
        self.arena.release(buf);
        match parsed {
            Ok(Packet::Query(query)) => self.on_query(query, from).await,
            Ok(Packet::Reply(reply)) => self.on_reply(reply, from).await,
            Ok(Packet::Error(err)) => self.on_error_msg(err, from),
            Ok(Packet::Malformed { tid }) => {
                self.send_reply(ErrorMsg::protocol_error(tid).encode(), from).await;
            }
            Err(err) => {
                debug!("cannot parse packet from {}: {}", from, err);
                self.stats.total_decode_errors += 1;
            }
        }
    }

    async fn on_query(&mut self, query: Query, from: SocketAddr) {
        if query.id == self.node_id {
            return;
        }
        let addr_key = match self.table.get_or_create(from, Some(query.id), &mut self.stats) {
            Ok(key) => key,
            Err(err) => {
                debug!("query from unusable address {}: {}", from, err);
                return;
            }
        };
        match self.table.get(&addr_key).and_then(|n| n.id) {
            None => {
                let _ = self.table.update(&addr_key, query.id, &mut self.stats);
            }
            Some(old) if old != query.id => {
                // The address now speaks with a different id; restart its
                // table entry so the trie does not keep a ghost terminal.
                self.table.kill(&addr_key, &mut self.peers, &mut self.stats);
                let _ = self.table.get_or_create(from, Some(query.id), &mut self.stats);
            }
            _ => {}
        }

        let tid = query.tid.clone();
        match query.body {
            QueryBody::Ping => {
                self.stats.total_recv_ping += 1;
                let reply = Reply {
                    tid,
                    id: self.node_id,
                    ..Reply::default()
                };
                self.send_reply(reply.encode(), from).await;
            }
            QueryBody::FindNode { target } => {
                self.stats.total_recv_find_node += 1;
                let reply = self.nodes_reply(tid, &target);
                self.send_reply(reply.encode(), from).await;
            }
            QueryBody::GetPeers { info_hash } => {
                self.stats.total_recv_get_peers += 1;
                let token = self.secrets.token_for(&from);
                let contacts = self.peers.peer_contacts(&info_hash);
                let reply = if contacts.is_empty() {
                    let mut reply = self.nodes_reply(tid, &info_hash);
                    reply.token = Some(token);
                    reply
                } else {
                    Reply {
                        tid,
                        id: self.node_id,
                        values: contacts.into_iter().map(Bytes::from).collect(),
                        token: Some(token),
                        ..Reply::default()
                    }
                };
                self.send_reply(reply.encode(), from).await;
            }
            QueryBody::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
            } => {
                self.stats.total_recv_announce_peer += 1;
                if !self.secrets.validate(&from, &token) {
                    debug!("rejecting announce_peer from {}: invalid token", from);
                    let err = ErrorMsg {
                        tid,
                        code: krpc::PROTOCOL_ERROR_CODE,
                        message: "Invalid token".to_string(),
                    };
                    self.send_reply(err.encode(), from).await;
                    return;
                }
                let peer_port = if implied_port { from.port() } else { port };
                let contact = krpc::compact_peer(&SocketAddr::new(from.ip(), peer_port));
                self.peers.add_contact(info_hash, &contact);
                let reply = Reply {
                    tid,
                    id: self.node_id,
                    ..Reply::default()
                };
                self.send_reply(reply.encode(), from).await;
            }
        }
    }

    /// Compact node-info reply for the k nodes nearest `target`.
    fn nodes_reply(&self, tid: Bytes, target: &NodeId) -> Reply {
        let mut blob = Vec::new();
        for key in self.table.closest_filtered(target) {
            if let Some(node) = self.table.get(&key) {
                if let Some(id) = node.id {
                    if let Some(entry) = krpc::compact_node(&id, &node.addr, self.proto) {
                        blob.extend_from_slice(&entry);
                    }
                }
            }
        }
        let mut reply = Reply {
            tid,
            id: self.node_id,
            ..Reply::default()
        };
        match self.proto {
            Proto::V4 => reply.nodes = Bytes::from(blob),
            Proto::V6 => reply.nodes6 = Bytes::from(blob),
        }
        reply
    }

    async fn on_reply(&mut self, reply: Reply, from: SocketAddr) {
        if reply.id == self.node_id {
            self.stats.total_self_promotions += 1;
            return;
        }
        let addr_key = from.to_string();
        let tid = match std::str::from_utf8(&reply.tid) {
            Ok(tid) => tid.to_string(),
            Err(_) => return,
        };

        let stale = matches!(
            self.table.get(&addr_key).and_then(|n| n.id),
            Some(old) if old != reply.id
        );
        if stale {
            debug!("node {} changed id, deleting", addr_key);
            self.table.kill(&addr_key, &mut self.peers, &mut self.stats);
            return;
        }

        let (record, newly_reachable, has_id) = {
            let node = match self.table.get_mut(&addr_key) {
                // Response from an address we no longer (or never) track.
                None => return,
                Some(node) => node,
            };
            let record = match node.settle(&tid) {
                // Unmatched transaction id; the pending entry may have
                // been evicted. Silent drop.
                None => return,
                Some(record) => record,
            };
            node.last_response_time = Some(Instant::now());
            let newly_reachable = !node.reachable;
            node.reachable = true;
            (record, newly_reachable, node.id.is_some())
        };

        if !has_id {
            let _ = self.table.update(&addr_key, reply.id, &mut self.stats);
        }
        if newly_reachable {
            self.stats.total_nodes_reached += 1;
        }
        self.table
            .neighborhood_upkeep(&addr_key, &mut self.peers, &mut self.stats);

        match record.kind {
            QueryKind::Ping => {
                self.stats.total_recv_ping_reply += 1;
            }
            QueryKind::FindNode => {
                self.stats.total_recv_find_node_reply += 1;
                self.process_found_nodes(&reply, record.info_hash, false).await;
            }
            QueryKind::GetPeers => {
                self.stats.total_recv_get_peers_reply += 1;
                if let Some(ih) = record.info_hash {
                    self.process_get_peers_reply(&addr_key, ih, reply).await;
                }
            }
            QueryKind::AnnouncePeer => {}
        }

        if self.table.len() < MIN_NODES {
            let asked = self
                .table
                .get(&addr_key)
                .map_or(true, |n| n.was_contacted_recently(&self.node_id));
            if !asked {
                self.send_find_node(&addr_key, self.node_id).await;
            }
        }
    }

    fn on_error_msg(&mut self, err: ErrorMsg, from: SocketAddr) {
        debug!("KRPC error from {}: {} {:?}", from, err.code, err.message);
        if let Ok(tid) = std::str::from_utf8(&err.tid) {
            if let Some(node) = self.table.get_mut(&from.to_string()) {
                let _ = node.settle(tid);
            }
        }
    }

    async fn process_get_peers_reply(&mut self, addr_key: &str, ih: InfoHash, reply: Reply) {
        if self.peers.has_local_download(&ih) {
            if let Some(token) = reply.token.clone() {
                self.send_announce(addr_key, ih, token).await;
            }
        }

        if !reply.values.is_empty() {
            let mut found = Vec::new();
            for value in &reply.values {
                if let Some(peer_addr) = krpc::parse_peer(value) {
                    if self.peers.add_contact(ih, value) {
                        self.stats.total_peers += 1;
                    }
                    found.push(peer_addr);
                }
            }
            if !found.is_empty() {
                self.publish(ih, found);
            }
        }

        self.process_found_nodes(&reply, Some(ih), true).await;
    }

    /// Feeds `nodes`/`nodes6` from a reply into the routing table and
    /// chains the search through newly met nodes while it is still short
    /// of peers (get_peers) or nodes (find_node).
    async fn process_found_nodes(
        &mut self,
        reply: &Reply,
        search_ih: Option<InfoHash>,
        via_get_peers: bool,
    ) {
        let blob = match self.proto {
            Proto::V4 => &reply.nodes,
            Proto::V6 => &reply.nodes6,
        };
        if blob.is_empty() {
            return;
        }
        let parsed = match krpc::parse_nodes(blob, self.proto) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!("bad compact node string: {}", err);
                self.stats.total_decode_errors += 1;
                return;
            }
        };

        for (id, addr) in parsed {
            if id == self.node_id {
                continue;
            }
            let key = addr.to_string();
            if self.table.get(&key).is_some_and(|n| n.id == Some(id)) {
                if via_get_peers {
                    self.stats.total_get_peers_dupes += 1;
                } else {
                    self.stats.total_find_node_dupes += 1;
                }
                continue;
            }
            if self.table.len() >= self.config.max_nodes {
                continue;
            }
            if self
                .table
                .get_or_create(addr, Some(id), &mut self.stats)
                .is_err()
            {
                continue;
            }
            let Some(ih) = search_ih else { continue };
            if via_get_peers {
                if self.peers.count(&ih) < self.config.num_target_peers
                    && !self
                        .table
                        .get(&key)
                        .map_or(true, |n| n.was_contacted_recently(&ih))
                {
                    self.send_get_peers(&key, ih).await;
                }
            } else if self.table.len() < MIN_NODES {
                self.send_find_node(&key, self.node_id).await;
            }
        }
    }

    async fn handle_add_node(&mut self, addr: String) {
        if self.table.len() >= self.config.max_nodes {
            return;
        }
        let Some(resolved) = self.resolve(&addr).await else {
            return;
        };
        match self.table.get_or_create(resolved, None, &mut self.stats) {
            Ok(key) => self.send_ping(&key).await,
            Err(err) => debug!("add_node {}: {}", addr, err),
        }
    }

    async fn handle_peers_request(&mut self, req: IhRequest) {
        debug!("peers requested for {}", req.info_hash);
        if req.announce {
            self.peers.add_local_download(req.info_hash);
        }
        let cached = self.peers.peer_contacts(&req.info_hash);
        if !cached.is_empty() {
            let found: Vec<SocketAddr> =
                cached.iter().filter_map(|c| krpc::parse_peer(c)).collect();
            if !found.is_empty() {
                self.publish(req.info_hash, found);
            }
        }
        self.get_peers(req.info_hash).await;
    }

    async fn get_peers(&mut self, ih: InfoHash) {
        let closest = self.table.closest_filtered(&ih);
        if closest.is_empty() {
            self.query_routers(ih, QueryKind::GetPeers).await;
            return;
        }
        for key in closest {
            self.send_get_peers(&key, ih).await;
        }
    }

    async fn handle_nodes_request(&mut self, target: InfoHash) {
        let closest = self.table.closest_filtered(&target);
        if closest.is_empty() {
            self.query_routers(target, QueryKind::FindNode).await;
            return;
        }
        for key in closest {
            self.send_find_node(&key, target).await;
        }
    }

    /// No usable known nodes: fall back to the configured routers.
    async fn query_routers(&mut self, target: InfoHash, kind: QueryKind) {
        let routers: Vec<String> = self
            .config
            .dht_routers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        for router in routers {
            let Some(addr) = self.resolve(&router).await else {
                continue;
            };
            let key = match self.table.get_or_create(addr, None, &mut self.stats) {
                Ok(key) => key,
                Err(err) => {
                    debug!("router {}: {}", router, err);
                    continue;
                }
            };
            match kind {
                QueryKind::FindNode => self.send_find_node(&key, target).await,
                _ => self.send_get_peers(&key, target).await,
            }
        }
    }

    async fn resolve(&self, addr: &str) -> Option<SocketAddr> {
        match tokio::net::lookup_host(addr).await {
            Ok(addrs) => {
                let want_v4 = self.proto == Proto::V4;
                addrs.into_iter().find(|a| a.is_ipv4() == want_v4)
            }
            Err(err) => {
                debug!("cannot resolve {}: {}", addr, err);
                None
            }
        }
    }

    async fn send_ping(&mut self, addr_key: &str) {
        let Some(node) = self.table.get_mut(addr_key) else {
            return;
        };
        let tid = node.new_query(QueryKind::Ping, None);
        let addr = node.addr;
        let query = Query {
            tid: Bytes::from(tid.into_bytes()),
            id: self.node_id,
            body: QueryBody::Ping,
        };
        if self.send_query(query, addr).await {
            self.stats.total_sent_ping += 1;
        }
    }

    async fn send_find_node(&mut self, addr_key: &str, target: NodeId) {
        let Some(node) = self.table.get_mut(addr_key) else {
            return;
        };
        let tid = node.new_query(QueryKind::FindNode, Some(target));
        let addr = node.addr;
        let query = Query {
            tid: Bytes::from(tid.into_bytes()),
            id: self.node_id,
            body: QueryBody::FindNode { target },
        };
        if self.send_query(query, addr).await {
            self.stats.total_sent_find_node += 1;
        }
    }

    async fn send_get_peers(&mut self, addr_key: &str, info_hash: InfoHash) {
        let Some(node) = self.table.get_mut(addr_key) else {
            return;
        };
        let tid = node.new_query(QueryKind::GetPeers, Some(info_hash));
        node.last_search_time = Some(Instant::now());
        let addr = node.addr;
        let query = Query {
            tid: Bytes::from(tid.into_bytes()),
            id: self.node_id,
            body: QueryBody::GetPeers { info_hash },
        };
        if self.send_query(query, addr).await {
            self.stats.total_sent_get_peers += 1;
        }
    }

    async fn send_announce(&mut self, addr_key: &str, info_hash: InfoHash, token: Bytes) {
        let Some(node) = self.table.get_mut(addr_key) else {
            return;
        };
        let tid = node.new_query(QueryKind::AnnouncePeer, Some(info_hash));
        let addr = node.addr;
        let query = Query {
            tid: Bytes::from(tid.into_bytes()),
            id: self.node_id,
            body: QueryBody::AnnouncePeer {
                info_hash,
                port: self.port,
                implied_port: false,
                token,
            },
        };
        if self.send_query(query, addr).await {
            self.stats.total_sent_announce_peer += 1;
        }
    }

    async fn send_query(&mut self, query: Query, addr: SocketAddr) -> bool {
        match query.encode() {
            Ok(data) => self.send_to(&data, addr).await,
            Err(err) => {
                debug!("cannot encode {} query: {}", query.body.method(), err);
                false
            }
        }
    }

    async fn send_reply(&mut self, encoded: Result<Vec<u8>, DhtError>, addr: SocketAddr) {
        match encoded {
            Ok(data) => {
                self.send_to(&data, addr).await;
            }
            Err(err) => debug!("cannot encode reply: {}", err),
        }
    }

    async fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> bool {
        match self.socket.send_to(data, addr).await {
            Ok(written) => {
                self.stats.total_sent += 1;
                self.stats.total_written_bytes += written as u64;
                true
            }
            Err(err) => {
                debug!("write to {} failed: {}", addr, err);
                false
            }
        }
    }

    fn publish(&mut self, ih: InfoHash, found: Vec<SocketAddr>) {
        let mut update = HashMap::new();
        update.insert(ih, found);
        if self.results_tx.try_send(update).is_err() {
            debug!("peers result channel full, dropping update");
        }
    }

    fn on_cleanup(&mut self) {
        let need_ping =
            self.table
                .cleanup(self.config.cleanup_period, &mut self.peers, &mut self.stats);
        debug!("cleanup: {} nodes to ping", need_ping.len());
        if !need_ping.is_empty() {
            tokio::spawn(ping_slowly(
                self.ping_tx.clone(),
                need_ping,
                self.config.cleanup_period,
                self.stop_rx.clone(),
            ));
        }
        if self.table.len() < MIN_NODES {
            let _ = self.nodes_req_tx.try_send(self.node_id);
        }
    }

    fn save_store(&mut self) {
        if !self.config.save_routing_table {
            return;
        }
        self.store.remotes = self.table.reachable_nodes();
        self.store.save();
    }
}

/// Owns the receive half of the socket: reads datagrams into arena
/// buffers and hands them to the engine. A full inbound queue drops the
/// packet rather than stalling the reader.
async fn read_loop(
    socket: Arc<UdpSocket>,
    arena: Arc<Arena>,
    packets_tx: mpsc::Sender<(BytesMut, SocketAddr)>,
    dropped: Arc<AtomicU64>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let mut buf = arena.acquire();
        buf.resize(MAX_UDP_PACKET_SIZE, 0);
        tokio::select! {
            received = socket.recv_from(&mut buf[..]) => match received {
                Ok((len, from)) => {
                    buf.truncate(len);
                    match packets_tx.try_send((buf, from)) {
                        Ok(()) => {}
                        Err(TrySendError::Full((buf, _))) => {
                            dropped.fetch_add(1, Ordering::Relaxed);
                            arena.release(buf);
                        }
                        Err(TrySendError::Closed((buf, _))) => {
                            arena.release(buf);
                            return;
                        }
                    }
                }
                Err(err) => {
                    debug!("udp read failed: {}", err);
                    arena.release(buf);
                }
            },
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// Spreads the post-cleanup pings evenly over the cleanup period (minus a
/// minute of slack) instead of bursting them.
async fn ping_slowly(
    ping_tx: mpsc::Sender<String>,
    need_ping: Vec<String>,
    cleanup_period: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let span = cleanup_period.saturating_sub(Duration::from_secs(60));
    let per_ping_wait = span / need_ping.len() as u32;
    for addr_key in need_ping {
        if ping_tx.send(addr_key).await.is_err() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(per_ping_wait) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// Short-lived secrets behind `get_peers` tokens. Two generations stay
/// valid so announces straddling a rotation still verify.
struct TokenSecrets {
    current: [u8; 16],
    previous: [u8; 16],
}

impl TokenSecrets {
    fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
        }
    }

    fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
        debug!("token secret rotated");
    }

    fn token_for(&self, addr: &SocketAddr) -> Bytes {
        Self::token_with(&self.current, addr)
    }

    fn validate(&self, addr: &SocketAddr, token: &Bytes) -> bool {
        token == &Self::token_with(&self.current, addr)
            || token == &Self::token_with(&self.previous, addr)
    }

    fn token_with(secret: &[u8; 16], addr: &SocketAddr) -> Bytes {
        let mut hasher = Sha1::new();
        hasher.update(secret);
        hasher.update(addr.to_string().as_bytes());
        Bytes::copy_from_slice(&hasher.finalize()[..8])
    }
}

use crate::krpc::{self, ERR_METHOD_UNKNOWN, ERR_PROTOCOL, Message, Query};
use crate::routing::{NodeId, RoutingTable};
use crate::seen::RollingSet;
use crate::token::TokenSecret;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

// Minimal BEP-5 indexing node:
// - Keeps itself visible with periodic find_node self-lookups
// - Answers every query so other nodes keep routing traffic to us
// - Harvests info_hash from get_peers / announce_peer queries

/// Fan-out of one self-lookup round and size of `nodes` in replies.
const K: usize = 8;
/// Upper bound on fingerprints kept per harvest window.
///
/// A window that fills up rotates before the tick does. Past this many
/// distinct (infohash, sender) pairs per interval, a pair can therefore be
/// harvested again inside one interval; memory stays at two windows
/// (about 4 MiB of fingerprints plus table overhead).
const HARVEST_WINDOW_CAP: usize = 1 << 18;
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// An infohash observed in live DHT traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateInfoHash {
    pub info_hash: [u8; 20],
    /// Best guess at the peer's BitTorrent address.
    pub peer: SocketAddr,
    pub seen_at: Instant,
}

impl CandidateInfoHash {
    pub fn hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub interval: Duration,
    pub max_neighbors: usize,
    pub bootstrap: Vec<String>,
}

/// What handling one datagram produced.
#[derive(Debug, Default)]
pub struct Outcome {
    pub reply: Option<Vec<u8>>,
    pub candidate: Option<CandidateInfoHash>,
}

/// Socket-free protocol state of one indexing node.
pub struct IndexerState {
    id: NodeId,
    ipv4: bool,
    table: RoutingTable,
    tokens: TokenSecret,
    harvested: RollingSet,
    next_tx: u16,
}

impl IndexerState {
    pub fn new(id: NodeId, max_neighbors: usize, ipv4: bool, now: Instant) -> Self {
        Self {
            id,
            ipv4,
            table: RoutingTable::new(id, max_neighbors),
            tokens: TokenSecret::new(now),
            harvested: RollingSet::new(HARVEST_WINDOW_CAP),
            next_tx: 0,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn handle(&mut self, raw: &[u8], from: SocketAddr, now: Instant) -> Outcome {
        let Some(msg) = Message::parse(raw) else {
            return Outcome::default();
        };

        let mut out = Outcome::default();
        if let Message::Query { tx, query } = &msg {
            out.candidate = self.observe(query, from, now);
            out.reply = Some(self.reply(tx, query, from));
        }
        self.learn(&msg, from, now);
        out
    }

    /// Harvest step. Emits at most one candidate per (infohash, sender) per
    /// window and never influences the reply.
    pub fn observe(&mut self, query: &Query<'_>, from: SocketAddr, now: Instant) -> Option<CandidateInfoHash> {
        let info_hash = query.info_hash()?;

        let mut key = Vec::with_capacity(20 + 16 + 2);
        key.extend_from_slice(&info_hash);
        match from.ip() {
            IpAddr::V4(ip) => key.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => key.extend_from_slice(&ip.octets()),
        }
        key.extend_from_slice(&from.port().to_be_bytes());
        if !self.harvested.test_and_set(&key) {
            return None;
        }

        let peer = match query {
            Query::AnnouncePeer {
                port,
                implied_port: false,
                ..
            } => SocketAddr::new(from.ip(), *port),
            _ => from,
        };
        Some(CandidateInfoHash {
            info_hash,
            peer,
            seen_at: now,
        })
    }

    /// Reply step; always produces a BEP-5 conformant answer.
    pub fn reply(&self, tx: &[u8], query: &Query<'_>, from: SocketAddr) -> Vec<u8> {
        match query {
            Query::Ping { .. } => krpc::id_reply(tx, &self.id),
            Query::FindNode { target, .. } => {
                krpc::find_node_reply(tx, &self.id, &self.table.closest(target, K))
            }
            Query::GetPeers { info_hash, .. } => {
                let token = self.tokens.issue(from.ip());
                krpc::get_peers_reply(tx, &self.id, &token, &self.table.closest(info_hash, K))
            }
            Query::AnnouncePeer { token, .. } => {
                if self.tokens.validate(from.ip(), token) {
                    krpc::id_reply(tx, &self.id)
                } else {
                    krpc::error_reply(tx, ERR_PROTOCOL, "bad token")
                }
            }
            Query::Unknown { .. } => krpc::error_reply(tx, ERR_METHOD_UNKNOWN, "Method Unknown"),
            Query::Malformed { reason } => krpc::error_reply(tx, ERR_PROTOCOL, reason),
        }
    }

    fn learn(&mut self, msg: &Message<'_>, from: SocketAddr, now: Instant) {
        match msg {
            Message::Query { query, .. } => {
                if let Some(id) = query.sender_id() {
                    self.remember(id, from, now);
                }
            }
            Message::Response { response, .. } => {
                self.remember(response.id, from, now);
                let learned = if self.ipv4 {
                    response.nodes.map(krpc::parse_compact_nodes)
                } else {
                    response.nodes6.map(krpc::parse_compact_nodes6)
                };
                for (id, addr) in learned.unwrap_or_default() {
                    self.remember(id, addr, now);
                }
            }
            Message::Error { .. } => {}
        }
    }

    fn remember(&mut self, id: NodeId, addr: SocketAddr, now: Instant) {
        if addr.is_ipv4() != self.ipv4 || !is_publicly_routable_ip(addr.ip()) {
            return;
        }
        self.table.insert(id, addr, now);
    }

    /// Closes the current harvest window.
    pub fn end_window(&mut self, now: Instant) {
        self.harvested.rotate();
        self.tokens.maybe_rotate(now);
    }

    /// find_node queries for `target` to the nearest known nodes.
    pub fn lookup_round(&mut self, target: &[u8; 20]) -> Vec<(SocketAddr, Vec<u8>)> {
        let closest = self.table.closest(target, K);
        closest
            .into_iter()
            .map(|e| (e.addr, self.find_node_to(target)))
            .collect()
    }

    /// find_node queries to bootstrap routers, used while the table is empty.
    pub fn bootstrap_round(&mut self, routers: &[SocketAddr]) -> Vec<(SocketAddr, Vec<u8>)> {
        let target = *self.id.as_bytes();
        let ipv4 = self.ipv4;
        routers
            .iter()
            .filter(|a| a.is_ipv4() == ipv4)
            .map(|a| (*a, self.find_node_to(&target)))
            .collect()
    }

    fn find_node_to(&mut self, target: &[u8; 20]) -> Vec<u8> {
        self.next_tx = self.next_tx.wrapping_add(1);
        krpc::find_node_query(&self.next_tx.to_be_bytes(), &self.id, target)
    }
}

/// One UDP endpoint participating in the DHT.
pub struct IndexerNode {
    socket: UdpSocket,
    local_addr: SocketAddr,
    state: IndexerState,
    config: IndexerConfig,
    output: broadcast::Sender<CandidateInfoHash>,
}

impl IndexerNode {
    pub async fn bind(
        addr: SocketAddr,
        config: IndexerConfig,
        output: broadcast::Sender<CandidateInfoHash>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let state = IndexerState::new(
            NodeId::random(),
            config.max_neighbors,
            local_addr.is_ipv4(),
            Instant::now(),
        );
        Ok(Self {
            socket,
            local_addr,
            state,
            config,
            output,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs until `shutdown` flips to true (or its sender goes away) or the
    /// socket fails for good.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(bind = %self.local_addr, id = %self.state.id(), "indexer: listening");

        let mut routers: Vec<SocketAddr> = Vec::new();
        let mut resolving: Option<JoinHandle<Vec<SocketAddr>>> = None;
        let mut tick = interval(self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut buf = vec![0u8; 64 * 1024];

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    self.state.end_window(Instant::now());
                    if self.state.table().is_empty() && routers.is_empty() {
                        if resolving.is_none() && !self.config.bootstrap.is_empty() {
                            let hosts = self.config.bootstrap.clone();
                            resolving = Some(tokio::spawn(resolve_bootstrap(hosts, self.local_addr.is_ipv4())));
                        }
                    } else {
                        self.self_lookup(&routers).await;
                    }
                }
                resolved = join_resolve(&mut resolving) => {
                    routers = resolved;
                    if !routers.is_empty() {
                        self.self_lookup(&routers).await;
                    }
                }
                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok((n, from)) => self.on_datagram(&buf[..n], from).await,
                    Err(err) if is_transient(&err) => {
                        tracing::trace!(%err, bind = %self.local_addr, "indexer: recv error");
                    }
                    Err(err) => {
                        tracing::warn!(%err, bind = %self.local_addr, "indexer: socket failed; node stopping");
                        break;
                    }
                }
            }
        }

        if let Some(task) = resolving {
            task.abort();
        }
        tracing::info!(bind = %self.local_addr, neighbors = self.state.table().len(), "indexer: stopped");
    }

    async fn on_datagram(&mut self, raw: &[u8], from: SocketAddr) {
        let outcome = self.state.handle(raw, from, Instant::now());
        if let Some(candidate) = outcome.candidate {
            tracing::debug!(hash = %candidate.hex(), peer = %candidate.peer, "indexer: trawled");
            // Lagging receivers lose the oldest entries; the node never waits.
            let _ = self.output.send(candidate);
        }
        if let Some(reply) = outcome.reply {
            let _ = self.socket.send_to(&reply, from).await;
        }
    }

    async fn self_lookup(&mut self, routers: &[SocketAddr]) {
        let queries = if self.state.table().is_empty() {
            self.state.bootstrap_round(routers)
        } else {
            let target = NodeId::random();
            self.state.lookup_round(target.as_bytes())
        };
        for (addr, msg) in queries {
            let _ = self.socket.send_to(&msg, addr).await;
        }
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    // ICMP port-unreachable surfaces as ConnectionReset/Refused on some platforms.
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
    )
}

/// Waits for the running bootstrap resolve, if any. Never completes while
/// nothing is being resolved.
async fn join_resolve(task: &mut Option<JoinHandle<Vec<SocketAddr>>>) -> Vec<SocketAddr> {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    let resolved = handle.await.unwrap_or_default();
    *task = None;
    resolved
}

async fn resolve_bootstrap(hosts: Vec<String>, ipv4: bool) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for host in &hosts {
        match tokio::time::timeout(RESOLVE_TIMEOUT, tokio::net::lookup_host(host.as_str())).await {
            Ok(Ok(iter)) => out.extend(iter.filter(|a| a.is_ipv4() == ipv4)),
            Ok(Err(err)) => {
                tracing::debug!(%err, host = %host, "indexer: bootstrap resolve failed");
            }
            Err(_) => {
                tracing::debug!(host = %host, "indexer: bootstrap resolve timed out");
            }
        }
    }
    out
}

pub fn is_publicly_routable_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_private() || v4.is_loopback() || v4.is_unspecified() {
                return false;
            }
            if v4.is_link_local() || v4.is_multicast() || v4.is_broadcast() {
                return false;
            }

            // Exclude documentation / benchmark ranges.
            let o = v4.octets();
            if (o[0] == 192 && o[1] == 0 && o[2] == 2)
                || (o[0] == 198 && o[1] == 51 && o[2] == 100)
                || (o[0] == 203 && o[1] == 0 && o[2] == 113)
                || (o[0] == 198 && (o[1] == 18 || o[1] == 19))
            {
                return false;
            }

            true
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() || v6.is_multicast() {
                return false;
            }
            if v6.is_unique_local() || v6.is_unicast_link_local() {
                return false;
            }

            // 2001:db8::/32 documentation prefix.
            let seg = v6.segments();
            !(seg[0] == 0x2001 && seg[1] == 0x0db8)
        }
    }
}

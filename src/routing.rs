use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// 20-byte identifier in the DHT keyspace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance; compares lexicographically as a big-endian integer.
    pub fn distance(&self, other: &[u8; 20]) -> [u8; 20] {
        let mut out = [0u8; 20];
        for (i, d) in out.iter_mut().enumerate() {
            *d = self.0[i] ^ other[i];
        }
        out
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingEntry {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

/// Bounded set of known DHT participants, owned by a single indexer node.
///
/// Full tables evict the least-recently-seen entry. Recency is tracked with a
/// monotonically increasing stamp so eviction is `O(log n)`.
pub struct RoutingTable {
    own_id: NodeId,
    capacity: usize,
    entries: HashMap<NodeId, (RoutingEntry, u64)>,
    by_recency: BTreeSet<(u64, NodeId)>,
    stamp: u64,
}

impl RoutingTable {
    pub fn new(own_id: NodeId, capacity: usize) -> Self {
        Self {
            own_id,
            capacity: capacity.max(1),
            entries: HashMap::new(),
            by_recency: BTreeSet::new(),
            stamp: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts or refreshes a node. Returns the evicted entry, if any.
    pub fn insert(&mut self, id: NodeId, addr: SocketAddr, now: Instant) -> Option<RoutingEntry> {
        if id == self.own_id || addr.port() == 0 {
            return None;
        }

        self.stamp += 1;
        let stamp = self.stamp;

        if let Some((entry, old_stamp)) = self.entries.get_mut(&id) {
            self.by_recency.remove(&(*old_stamp, id));
            entry.addr = addr;
            entry.last_seen = now;
            *old_stamp = stamp;
            self.by_recency.insert((stamp, id));
            return None;
        }

        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            if let Some((_, oldest)) = self.by_recency.pop_first() {
                evicted = self.entries.remove(&oldest).map(|(e, _)| e);
            }
        }

        let entry = RoutingEntry {
            id,
            addr,
            last_seen: now,
        };
        self.entries.insert(id, (entry, stamp));
        self.by_recency.insert((stamp, id));
        evicted
    }

    /// Up to `k` entries closest to `target` by XOR distance, nearest first.
    pub fn closest(&self, target: &[u8; 20], k: usize) -> Vec<RoutingEntry> {
        let mut all: Vec<([u8; 20], RoutingEntry)> = self
            .entries
            .values()
            .map(|(e, _)| (e.id.distance(target), *e))
            .collect();
        all.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        all.into_iter().take(k).map(|(_, e)| e).collect()
    }

    #[cfg(test)]
    pub fn get(&self, id: &NodeId) -> Option<&RoutingEntry> {
        self.entries.get(id).map(|(e, _)| e)
    }
}

//! Routing table: address-indexed node ownership over the routing trie,
//! neighborhood boundary tracking, and the liveness cleanup pass.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::debug;

use super::error::DhtError;
use super::id::{InfoHash, NodeId};
use super::metrics::Stats;
use super::node::{RemoteNode, MAX_NODE_PENDING_QUERIES};
use super::peer_store::PeerStore;
use super::routing::{Leaf, Trie, K_NODES};

pub(crate) struct RoutingTable {
    trie: Trie,
    /// Owner of all remote-node state, keyed by canonical `"host:port"`.
    /// UDP address structs make poor map keys, so the string form is the
    /// one canonical key everywhere.
    nodes: HashMap<String, RemoteNode>,
    node_id: NodeId,
    /// Farthest entry among the k nearest to our own id, and how many
    /// leading bits it shares with us.
    boundary: Option<String>,
    proximity: usize,
}

impl RoutingTable {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            trie: Trie::default(),
            nodes: HashMap::new(),
            node_id,
            boundary: None,
            proximity: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, addr_key: &str) -> Option<&RemoteNode> {
        self.nodes.get(addr_key)
    }

    pub fn get_mut(&mut self, addr_key: &str) -> Option<&mut RemoteNode> {
        self.nodes.get_mut(addr_key)
    }

    #[cfg(test)]
    pub fn boundary(&self) -> Option<&str> {
        self.boundary.as_deref()
    }

    #[cfg(test)]
    pub fn proximity(&self) -> usize {
        self.proximity
    }

    /// Inserts a node. Re-inserting a present address is a no-op; nodes
    /// with port 0 or an unspecified IP are rejected.
    pub fn insert(&mut self, node: RemoteNode, stats: &mut Stats) -> Result<(), DhtError> {
        if node.addr.port() == 0 {
            return Err(DhtError::InvalidAddress("port is 0".into()));
        }
        if node.addr.ip().is_unspecified() {
            return Err(DhtError::InvalidAddress("unspecified IP".into()));
        }
        if self.nodes.contains_key(&node.addr_key) {
            return Ok(());
        }
        if let Some(id) = node.id {
            self.trie.insert(id, node.addr_key.clone());
            stats.total_nodes += 1;
        }
        self.nodes.insert(node.addr_key.clone(), node);
        Ok(())
    }

    /// Sets the id of an already-present address and installs it in the
    /// trie. Fails when the address is absent.
    pub fn update(&mut self, addr_key: &str, id: NodeId, stats: &mut Stats) -> Result<(), DhtError> {
        let old = match self.nodes.get(addr_key) {
            Some(node) => node.id,
            None => {
                return Err(DhtError::InvalidAddress(format!(
                    "node missing from the routing table: {}",
                    addr_key
                )))
            }
        };
        match old {
            Some(old_id) if old_id == id => return Ok(()),
            Some(old_id) => {
                self.trie.cut(&old_id, 0);
            }
            None => {}
        }
        if let Some(node) = self.nodes.get_mut(addr_key) {
            node.id = Some(id);
        }
        self.trie.insert(id, addr_key.to_string());
        stats.total_nodes += 1;
        Ok(())
    }

    /// Returns the address key for `addr`, creating and inserting a node
    /// when none exists yet. Idempotent.
    pub fn get_or_create(
        &mut self,
        addr: SocketAddr,
        id: Option<NodeId>,
        stats: &mut Stats,
    ) -> Result<String, DhtError> {
        let key = addr.to_string();
        if !self.nodes.contains_key(&key) {
            self.insert(RemoteNode::new(addr, id), stats)?;
        }
        Ok(key)
    }

    /// Removes a node from the map and the trie, recomputes the boundary
    /// when it was the boundary, and tombstones its peer-store contacts.
    pub fn kill(
        &mut self,
        addr_key: &str,
        peers: &mut PeerStore,
        stats: &mut Stats,
    ) -> Option<RemoteNode> {
        let node = self.nodes.remove(addr_key)?;
        if let Some(id) = node.id {
            self.trie.cut(&id, 0);
        }
        stats.total_killed_nodes += 1;
        if self.boundary.as_deref() == Some(addr_key) {
            self.reset_neighborhood_boundary();
        }
        peers.kill_contact(&node.compact);
        Some(node)
    }

    /// Re-derives the boundary as the farthest of the k nearest to our id.
    pub fn reset_neighborhood_boundary(&mut self) {
        self.boundary = None;
        self.proximity = 0;
        let neighbors = self.trie.lookup(&self.node_id);
        if let Some(last) = neighbors.last() {
            self.proximity = self.node_id.common_bits(&last.id);
            self.boundary = Some(last.addr_key.clone());
        }
    }

    /// Called after a successful exchange with a node: promotes it into
    /// the neighborhood when it is closer to us than the current boundary,
    /// displacing the boundary node.
    pub fn neighborhood_upkeep(
        &mut self,
        addr_key: &str,
        peers: &mut PeerStore,
        stats: &mut Stats,
    ) {
        let id = match self.nodes.get(addr_key).and_then(|n| n.id) {
            Some(id) => id,
            None => return,
        };
        if self.boundary.is_none() || self.len() < K_NODES {
            self.reset_neighborhood_boundary();
            return;
        }
        let cmp = self.node_id.common_bits(&id);
        if cmp == 0 || cmp <= self.proximity {
            return;
        }
        if let Some(boundary) = self.boundary.clone() {
            // kill() recomputes the boundary, now including this node.
            self.kill(&boundary, peers, stats);
        }
    }

    /// Scans every entry, killing decayed nodes and returning the address
    /// keys that should be pinged, spread out by the caller over the
    /// cleanup period.
    pub fn cleanup(
        &mut self,
        period: Duration,
        peers: &mut PeerStore,
        stats: &mut Stats,
    ) -> Vec<String> {
        let mut to_kill = Vec::new();
        let mut need_ping = Vec::new();

        for (key, node) in &self.nodes {
            if key.is_empty() || *key != node.addr_key {
                debug!(addr = %key, "cleanup: node address mismatch, deleting");
                to_kill.push(key.clone());
                continue;
            }
            if node.reachable {
                if node.pending_queries() == 0 {
                    need_ping.push(key.clone());
                    continue;
                }
                match node.last_response_time.map(|t| t.elapsed()) {
                    Some(age) if age > period * 2 + period / 15 => {
                        debug!(addr = %key, ?age, "cleanup: old node, deleting");
                        to_kill.push(key.clone());
                        continue;
                    }
                    Some(age) if age < period / 2 => continue,
                    _ => {}
                }
                need_ping.push(key.clone());
            } else if node.pending_queries() > MAX_NODE_PENDING_QUERIES {
                debug!(addr = %key, "cleanup: node never replied, deleting");
                to_kill.push(key.clone());
            } else {
                need_ping.push(key.clone());
            }
        }

        for key in &to_kill {
            self.kill(key, peers, stats);
        }
        need_ping
    }

    /// Up to k address keys nearest to `target`.
    pub fn closest(&self, target: &NodeId) -> Vec<String> {
        self.trie
            .lookup(target)
            .into_iter()
            .map(|leaf| leaf.addr_key.clone())
            .collect()
    }

    /// Like [`closest`](Self::closest), skipping nodes that are stuck
    /// (too many pending queries) or were already asked about `ih` within
    /// the retry window.
    pub fn closest_filtered(&self, ih: &InfoHash) -> Vec<String> {
        let nodes = &self.nodes;
        let keep = |leaf: &Leaf| {
            nodes.get(&leaf.addr_key).is_some_and(|node| {
                node.pending_queries() <= MAX_NODE_PENDING_QUERIES
                    && !node.was_contacted_recently(ih)
            })
        };
        self.trie
            .lookup_filtered(ih, &keep)
            .into_iter()
            .map(|leaf| leaf.addr_key.clone())
            .collect()
    }

    /// Snapshot of reachable nodes with known ids, for persistence.
    pub fn reachable_nodes(&self) -> HashMap<String, Vec<u8>> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.reachable)
            .filter_map(|(key, node)| {
                node.id.map(|id| (key.clone(), id.as_bytes().to_vec()))
            })
            .collect()
    }
}

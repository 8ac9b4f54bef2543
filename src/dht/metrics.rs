/// Engine counters, snapshotted through [`Dht::stats`](super::Dht::stats).
///
/// All counters are monotonic over the life of the node. A node killed,
/// re-added, and killed again counts twice.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub total_sent: u64,
    pub total_recv: u64,
    pub total_read_bytes: u64,
    pub total_written_bytes: u64,

    pub total_sent_ping: u64,
    pub total_sent_find_node: u64,
    pub total_sent_get_peers: u64,
    pub total_sent_announce_peer: u64,

    pub total_recv_ping: u64,
    pub total_recv_ping_reply: u64,
    pub total_recv_find_node: u64,
    pub total_recv_find_node_reply: u64,
    pub total_recv_get_peers: u64,
    pub total_recv_get_peers_reply: u64,
    pub total_recv_announce_peer: u64,

    /// Nodes ever added to the routing trie.
    pub total_nodes: u64,
    /// Nodes ever removed from the routing table.
    pub total_killed_nodes: u64,
    /// Nodes that answered us at least once.
    pub total_nodes_reached: u64,

    pub total_get_peers_dupes: u64,
    pub total_find_node_dupes: u64,
    /// Replies claiming our own node id.
    pub total_self_promotions: u64,
    /// Peer contacts newly learned from `get_peers` values.
    pub total_peers: u64,

    pub total_dropped_packets: u64,
    pub total_packets_from_blocked_hosts: u64,
    pub total_decode_errors: u64,
}

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::id::{InfoHash, NodeId};
use super::krpc;

/// A remote is not re-queried for the same infohash until this elapses.
pub(crate) const SEARCH_RETRY_PERIOD: Duration = Duration::from_secs(15);

/// A node with more pending queries than this is considered stuck and is
/// skipped by filtered lookups.
pub(crate) const MAX_NODE_PENDING_QUERIES: usize = 5;

// Past queries are only consulted by the retry damper; keep a bounded tail.
const MAX_PAST_QUERIES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

#[derive(Debug, Clone)]
pub(crate) struct QueryRecord {
    pub kind: QueryKind,
    pub info_hash: Option<InfoHash>,
}

/// Per-peer KRPC session state.
///
/// Transaction ids are the decimal rendering of a u8 counter, unique per
/// (node, direction) while pending. The counter wraps at 256; a pending
/// collision on wrap is resolved by overwrite, tolerated because the
/// protocol retry window is much shorter than the wrap time.
#[derive(Debug)]
pub(crate) struct RemoteNode {
    pub addr: SocketAddr,
    /// Canonical `"host:port"` form, the routing table's map key.
    pub addr_key: String,
    /// Compact binary contact form (6 bytes for IPv4, 18 for IPv6).
    pub compact: Vec<u8>,
    pub id: Option<NodeId>,
    pub reachable: bool,
    pub last_response_time: Option<Instant>,
    pub last_search_time: Option<Instant>,
    last_query_id: u8,
    pending: HashMap<String, QueryRecord>,
    past: HashMap<String, QueryRecord>,
    past_order: VecDeque<String>,
}

impl RemoteNode {
    pub fn new(addr: SocketAddr, id: Option<NodeId>) -> Self {
        Self {
            addr,
            addr_key: addr.to_string(),
            compact: krpc::compact_peer(&addr),
            id,
            reachable: false,
            last_response_time: None,
            last_search_time: None,
            last_query_id: rand::random(),
            pending: HashMap::new(),
            past: HashMap::new(),
            past_order: VecDeque::new(),
        }
    }

    /// Registers a fresh outbound query and returns its transaction id.
    pub fn new_query(&mut self, kind: QueryKind, info_hash: Option<InfoHash>) -> String {
        self.last_query_id = self.last_query_id.wrapping_add(1);
        let tid = self.last_query_id.to_string();
        self.pending.insert(tid.clone(), QueryRecord { kind, info_hash });
        tid
    }

    /// Resolves a pending query by transaction id, moving it to the past
    /// set. `None` when the id does not match anything in flight.
    pub fn settle(&mut self, tid: &str) -> Option<QueryRecord> {
        let record = self.pending.remove(tid)?;
        if self.past.insert(tid.to_string(), record.clone()).is_none() {
            self.past_order.push_back(tid.to_string());
            if self.past_order.len() > MAX_PAST_QUERIES {
                if let Some(oldest) = self.past_order.pop_front() {
                    self.past.remove(&oldest);
                }
            }
        }
        Some(record)
    }

    pub fn pending_queries(&self) -> usize {
        self.pending.len()
    }

    /// Whether this node was asked about `ih` within the retry window.
    /// Missing timestamps count as long ago.
    pub fn was_contacted_recently(&self, ih: &InfoHash) -> bool {
        if self.pending.is_empty() && self.past.is_empty() {
            return false;
        }
        let recent = |t: Option<Instant>| {
            t.is_some_and(|t| t.elapsed() <= SEARCH_RETRY_PERIOD)
        };
        if self.pending.values().any(|q| q.info_hash.as_ref() == Some(ih))
            && (recent(self.last_search_time) || recent(self.last_response_time))
        {
            return true;
        }
        recent(self.last_search_time)
            && self.past.values().any(|q| q.info_hash.as_ref() == Some(ih))
    }
}

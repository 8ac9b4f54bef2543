use std::time::Duration;

use super::error::DhtError;

/// Well-known DHT routers used to bootstrap when the routing table has no
/// usable nodes.
pub const DEFAULT_ROUTERS: &str =
    "router.bittorrent.com:6881,dht.transmissionbt.com:6881,router.utorrent.com:6881";

/// Address family of the single UDP socket an instance binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Proto {
    V4,
    V6,
}

impl Proto {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "udp4" => Some(Proto::V4),
            "udp6" => Some(Proto::V6),
            _ => None,
        }
    }

    pub fn any_addr(self) -> &'static str {
        match self {
            Proto::V4 => "0.0.0.0",
            Proto::V6 => "::",
        }
    }
}

/// Node configuration. Fixed once the node is created.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address; empty picks the wildcard for the address family.
    pub address: String,
    /// UDP port; 0 lets the OS assign one.
    pub port: u16,
    /// Peers sought per searched infohash.
    pub num_target_peers: usize,
    /// Comma-separated bootstrap router addresses.
    pub dht_routers: String,
    /// Routing table cap. The main knob for how aggressive this node is.
    pub max_nodes: usize,
    /// How often to ping nodes to see if they are still reachable.
    pub cleanup_period: Duration,
    /// Whether to read and periodically persist the routing table.
    pub save_routing_table: bool,
    /// How often to save the routing table to disk.
    pub save_period: Duration,
    /// Packets per second to process; negative disables the limit.
    pub rate_limit: i64,
    /// Infohashes to keep peer lists for.
    pub max_infohashes: usize,
    /// Peer contacts tracked per infohash.
    pub max_infohash_peers: usize,
    /// Packets accepted per source host per minute.
    pub client_per_minute_limit: usize,
    /// Hosts the throttler remembers.
    pub throttler_tracked_clients: usize,
    /// "udp4" or "udp6".
    pub udp_proto: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 0,
            num_target_peers: 5,
            dht_routers: DEFAULT_ROUTERS.to_string(),
            max_nodes: 500,
            cleanup_period: Duration::from_secs(15 * 60),
            save_routing_table: true,
            save_period: Duration::from_secs(5 * 60),
            rate_limit: 100,
            max_infohashes: 2048,
            max_infohash_peers: 256,
            client_per_minute_limit: 50,
            throttler_tracked_clients: 1000,
            udp_proto: "udp4".to_string(),
        }
    }
}

impl Config {
    pub(crate) fn proto(&self) -> Result<Proto, DhtError> {
        Proto::parse(&self.udp_proto)
            .ok_or_else(|| DhtError::Config(format!("unknown udp_proto {:?}", self.udp_proto)))
    }

    /// The `"host:port"` string to bind, validated for the chosen family.
    pub(crate) fn bind_addr(&self) -> Result<String, DhtError> {
        let proto = self.proto()?;
        let host = if self.address.is_empty() {
            proto.any_addr().to_string()
        } else {
            self.address.clone()
        };
        match proto {
            Proto::V4 => Ok(format!("{}:{}", host, self.port)),
            Proto::V6 => Ok(format!("[{}]:{}", host.trim_matches(['[', ']']), self.port)),
        }
    }
}

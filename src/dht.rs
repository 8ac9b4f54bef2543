//! Distributed Hash Table node ([BEP-5]).
//!
//! A node in the Kademlia-based Mainline BitTorrent DHT: it maintains a
//! routing table of remote peers, answers their KRPC queries, issues its
//! own, and surfaces discovered peers to the embedding torrent client,
//! with no central tracker involved.
//!
//! # Getting started
//!
//! ```no_run
//! use rdht::dht::{Config, Dht, InfoHash};
//!
//! # async fn example() -> Result<(), rdht::dht::DhtError> {
//! let mut dht = Dht::new(Config::default()).await?;
//!
//! // Ask for peers for a torrent; results arrive on the peers channel.
//! let info_hash = InfoHash::from_hex("d1c5676ae7ac98e8b19f63565905105e3c4c37a2")?;
//! dht.peers_request(info_hash, true);
//!
//! if let Some(batch) = dht.peers().await {
//!     for (ih, peers) in batch {
//!         println!("found {} peers for {}", peers.len(), ih);
//!     }
//! }
//!
//! dht.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! A single engine task owns the routing table, peer store, throttler,
//! and all per-node session state; everything else reaches it over
//! bounded channels. The pieces:
//!
//! - [`Dht`] — public handle; engine loop behind it
//! - routing: a binary trie plus address map with neighborhood tracking
//! - peer store: bounded LRU of infohash → rotating peer contact ring
//! - KRPC codec over the [`crate::bencode`] module
//! - persistence of the node id and known remotes between runs
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

mod arena;
mod config;
mod error;
mod id;
mod krpc;
mod metrics;
mod node;
mod peer_store;
mod routing;
mod server;
mod store;
mod table;
mod throttle;

pub use config::{Config, DEFAULT_ROUTERS};
pub use error::DhtError;
pub use id::{InfoHash, NodeId};
pub use metrics::Stats;
pub use server::Dht;

#[cfg(test)]
mod tests;

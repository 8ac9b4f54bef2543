//! rdht - a Mainline BitTorrent DHT node
//!
//! This library implements the Kademlia-based Distributed Hash Table used
//! by BitTorrent for trackerless peer discovery, following BEP
//! (BitTorrent Enhancement Proposal) specifications.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`dht`] - BEP-5 DHT node: routing table, KRPC protocol, peer store

pub mod bencode;
pub mod dht;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{Config, Dht, DhtError, InfoHash, NodeId, Stats};

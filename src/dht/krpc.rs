//! KRPC message model and wire codec ([BEP-5]).
//!
//! KRPC is bencoded dictionaries over UDP. Every message carries a
//! transaction id `t` and a type `y` of `"q"` (query), `"r"` (response),
//! or `"e"` (error). Replies are correlated with the query they answer by
//! `t` per remote node, so the reply shape here stays generic: the engine
//! knows what it asked and interprets the `r` fields accordingly.
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;

use crate::bencode::{decode, encode, Value};

use super::config::Proto;
use super::error::DhtError;
use super::id::{InfoHash, NodeId};

/// Maximum KRPC datagram size.
pub(crate) const MAX_UDP_PACKET_SIZE: usize = 4096;

/// Generic KRPC error code (BEP-5 "Protocol Error").
pub(crate) const PROTOCOL_ERROR_CODE: i64 = 203;

const V4_CONTACT_LEN: usize = 26;
const V6_CONTACT_LEN: usize = 38;
const V4_PEER_LEN: usize = 6;
const V6_PEER_LEN: usize = 18;

/// One parsed inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Packet {
    Query(Query),
    Reply(Reply),
    Error(ErrorMsg),
    /// Query-shaped but with an unknown method or missing argument;
    /// answered with a 203 error.
    Malformed { tid: Bytes },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Query {
    pub tid: Bytes,
    /// The sender's node id (`a.id`).
    pub id: NodeId,
    pub body: QueryBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QueryBody {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: InfoHash,
    },
    AnnouncePeer {
        info_hash: InfoHash,
        port: u16,
        implied_port: bool,
        token: Bytes,
    },
}

impl QueryBody {
    pub fn method(&self) -> &'static str {
        match self {
            QueryBody::Ping => "ping",
            QueryBody::FindNode { .. } => "find_node",
            QueryBody::GetPeers { .. } => "get_peers",
            QueryBody::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// An `r` message. `values`, `nodes`, and `nodes6` default to empty when
/// absent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Reply {
    pub tid: Bytes,
    pub id: NodeId,
    pub values: Vec<Bytes>,
    pub nodes: Bytes,
    pub nodes6: Bytes,
    pub token: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ErrorMsg {
    pub tid: Bytes,
    pub code: i64,
    pub message: String,
}

impl Packet {
    /// Parses one datagram. Total function: malformed input yields an
    /// error value, never a panic.
    pub fn parse(data: &[u8]) -> Result<Packet, DhtError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| DhtError::InvalidMessage("top level is not a dict".into()))?;

        let tid = dict
            .get(b"t".as_slice())
            .and_then(Value::as_bytes)
            .cloned()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))?;

        let kind = dict
            .get(b"y".as_slice())
            .and_then(Value::as_str)
            .ok_or_else(|| DhtError::InvalidMessage("missing message type".into()))?;

        match kind {
            "q" => Ok(parse_query(tid.clone(), dict).unwrap_or(Packet::Malformed { tid })),
            "r" => parse_reply(tid, dict),
            "e" => parse_error(tid, dict),
            other => Err(DhtError::InvalidMessage(format!(
                "unknown message type {:?}",
                other
            ))),
        }
    }
}

fn parse_query(tid: Bytes, dict: &BTreeMap<Bytes, Value>) -> Option<Packet> {
    let method = dict.get(b"q".as_slice()).and_then(Value::as_str)?;
    let args = dict.get(b"a".as_slice()).and_then(Value::as_dict)?;
    let id = args
        .get(b"id".as_slice())
        .and_then(Value::as_bytes)
        .and_then(|b| NodeId::from_bytes(b).ok())?;

    let body = match method {
        "ping" => QueryBody::Ping,
        "find_node" => QueryBody::FindNode {
            target: arg_id(args, b"target")?,
        },
        "get_peers" => QueryBody::GetPeers {
            info_hash: arg_id(args, b"info_hash")?,
        },
        "announce_peer" => QueryBody::AnnouncePeer {
            info_hash: arg_id(args, b"info_hash")?,
            port: args
                .get(b"port".as_slice())
                .and_then(Value::as_int)
                .filter(|p| (0..=65535).contains(p))? as u16,
            implied_port: args
                .get(b"implied_port".as_slice())
                .and_then(Value::as_int)
                == Some(1),
            token: args.get(b"token".as_slice()).and_then(Value::as_bytes).cloned()?,
        },
        _ => return None,
    };

    Some(Packet::Query(Query { tid, id, body }))
}

fn arg_id(args: &BTreeMap<Bytes, Value>, key: &[u8]) -> Option<NodeId> {
    args.get(key)
        .and_then(Value::as_bytes)
        .and_then(|b| NodeId::from_bytes(b).ok())
}

fn parse_reply(tid: Bytes, dict: &BTreeMap<Bytes, Value>) -> Result<Packet, DhtError> {
    let fields = dict
        .get(b"r".as_slice())
        .and_then(Value::as_dict)
        .ok_or_else(|| DhtError::InvalidMessage("missing response dict".into()))?;

    let id = fields
        .get(b"id".as_slice())
        .and_then(Value::as_bytes)
        .and_then(|b| NodeId::from_bytes(b).ok())
        .ok_or_else(|| DhtError::InvalidMessage("missing id in response".into()))?;

    let values = fields
        .get(b"values".as_slice())
        .and_then(Value::as_list)
        .map(|list| list.iter().filter_map(Value::as_bytes).cloned().collect())
        .unwrap_or_default();

    let bytes_or_empty = |key: &[u8]| {
        fields
            .get(key)
            .and_then(Value::as_bytes)
            .cloned()
            .unwrap_or_default()
    };

    Ok(Packet::Reply(Reply {
        tid,
        id,
        values,
        nodes: bytes_or_empty(b"nodes"),
        nodes6: bytes_or_empty(b"nodes6"),
        token: fields.get(b"token".as_slice()).and_then(Value::as_bytes).cloned(),
    }))
}

fn parse_error(tid: Bytes, dict: &BTreeMap<Bytes, Value>) -> Result<Packet, DhtError> {
    let list = dict
        .get(b"e".as_slice())
        .and_then(Value::as_list)
        .ok_or_else(|| DhtError::InvalidMessage("missing error list".into()))?;

    Ok(Packet::Error(ErrorMsg {
        tid,
        code: list.first().and_then(Value::as_int).unwrap_or(0),
        message: list
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
    }))
}

impl Query {
    pub fn encode(&self) -> Result<Vec<u8>, DhtError> {
        let mut args = BTreeMap::new();
        args.insert(Bytes::from_static(b"id"), Value::bytes(self.id.as_bytes()));

        match &self.body {
            QueryBody::Ping => {}
            QueryBody::FindNode { target } => {
                args.insert(Bytes::from_static(b"target"), Value::bytes(target.as_bytes()));
            }
            QueryBody::GetPeers { info_hash } => {
                args.insert(
                    Bytes::from_static(b"info_hash"),
                    Value::bytes(info_hash.as_bytes()),
                );
            }
            QueryBody::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
            } => {
                args.insert(
                    Bytes::from_static(b"info_hash"),
                    Value::bytes(info_hash.as_bytes()),
                );
                args.insert(Bytes::from_static(b"port"), Value::Int(i64::from(*port)));
                args.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
                if *implied_port {
                    args.insert(Bytes::from_static(b"implied_port"), Value::Int(1));
                }
            }
        }

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"t"), Value::Bytes(self.tid.clone()));
        dict.insert(Bytes::from_static(b"y"), Value::str("q"));
        dict.insert(Bytes::from_static(b"q"), Value::str(self.body.method()));
        dict.insert(Bytes::from_static(b"a"), Value::Dict(args));
        Ok(encode(&Value::Dict(dict))?)
    }
}

impl Reply {
    pub fn encode(&self) -> Result<Vec<u8>, DhtError> {
        let mut fields = BTreeMap::new();
        fields.insert(Bytes::from_static(b"id"), Value::bytes(self.id.as_bytes()));
        if !self.values.is_empty() {
            fields.insert(
                Bytes::from_static(b"values"),
                Value::List(self.values.iter().cloned().map(Value::Bytes).collect()),
            );
        }
        if !self.nodes.is_empty() {
            fields.insert(Bytes::from_static(b"nodes"), Value::Bytes(self.nodes.clone()));
        }
        if !self.nodes6.is_empty() {
            fields.insert(
                Bytes::from_static(b"nodes6"),
                Value::Bytes(self.nodes6.clone()),
            );
        }
        if let Some(token) = &self.token {
            fields.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
        }

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"t"), Value::Bytes(self.tid.clone()));
        dict.insert(Bytes::from_static(b"y"), Value::str("r"));
        dict.insert(Bytes::from_static(b"r"), Value::Dict(fields));
        Ok(encode(&Value::Dict(dict))?)
    }
}

impl ErrorMsg {
    pub fn protocol_error(tid: Bytes) -> Self {
        Self {
            tid,
            code: PROTOCOL_ERROR_CODE,
            message: "Protocol error".to_string(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DhtError> {
        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"t"), Value::Bytes(self.tid.clone()));
        dict.insert(Bytes::from_static(b"y"), Value::str("e"));
        dict.insert(
            Bytes::from_static(b"e"),
            Value::List(vec![Value::Int(self.code), Value::str(&self.message)]),
        );
        Ok(encode(&Value::Dict(dict))?)
    }
}

/// Decodes a compact node-info string: per entry, 20-byte id then 4-byte
/// IPv4 + 2-byte port (26 bytes) or 16-byte IPv6 + 2-byte port (38 bytes).
///
/// # Errors
///
/// Rejects blobs whose length is not a multiple of the per-family unit.
pub(crate) fn parse_nodes(
    data: &[u8],
    proto: Proto,
) -> Result<Vec<(NodeId, SocketAddr)>, DhtError> {
    let unit = match proto {
        Proto::V4 => V4_CONTACT_LEN,
        Proto::V6 => V6_CONTACT_LEN,
    };
    if data.len() % unit != 0 {
        return Err(DhtError::InvalidMessage(format!(
            "compact node string of {} bytes is not a multiple of {}",
            data.len(),
            unit
        )));
    }

    let mut parsed = Vec::with_capacity(data.len() / unit);
    for chunk in data.chunks_exact(unit) {
        // from_bytes cannot fail here; the chunk is exactly unit bytes.
        let id = NodeId::from_bytes(&chunk[..NodeId::LEN])?;
        let ip: IpAddr = match proto {
            Proto::V4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&chunk[NodeId::LEN..NodeId::LEN + 4]);
                Ipv4Addr::from(octets).into()
            }
            Proto::V6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&chunk[NodeId::LEN..NodeId::LEN + 16]);
                Ipv6Addr::from(octets).into()
            }
        };
        let port = u16::from_be_bytes([chunk[unit - 2], chunk[unit - 1]]);
        parsed.push((id, SocketAddr::new(ip, port)));
    }
    Ok(parsed)
}

/// Encodes one compact node-info entry, or `None` when the address family
/// does not match the instance's protocol.
pub(crate) fn compact_node(id: &NodeId, addr: &SocketAddr, proto: Proto) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(V6_CONTACT_LEN);
    out.extend_from_slice(id.as_bytes());
    match (addr, proto) {
        (SocketAddr::V4(v4), Proto::V4) => {
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
        (SocketAddr::V6(v6), Proto::V6) => {
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
        }
        _ => return None,
    }
    Some(out)
}

/// Encodes a compact peer contact: 4-byte IPv4 + 2-byte port, or 16-byte
/// IPv6 + 2-byte port.
pub(crate) fn compact_peer(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut out = Vec::with_capacity(V4_PEER_LEN);
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
            out
        }
        SocketAddr::V6(v6) => {
            let mut out = Vec::with_capacity(V6_PEER_LEN);
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
            out
        }
    }
}

/// Decodes a compact peer contact; `None` for lengths other than 6 or 18.
pub(crate) fn parse_peer(data: &[u8]) -> Option<SocketAddr> {
    match data.len() {
        V4_PEER_LEN => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&data[..4]);
            let port = u16::from_be_bytes([data[4], data[5]]);
            Some(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
        }
        V6_PEER_LEN => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            let port = u16::from_be_bytes([data[16], data[17]]);
            Some(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        _ => None,
    }
}

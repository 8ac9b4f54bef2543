use std::fmt;

use rand::Rng as _;

use super::error::DhtError;

/// A 160-bit DHT identifier.
///
/// Node ids and torrent infohashes live in the same metric space and are
/// structurally identical, so one type serves both. Distance between two
/// ids is their bitwise XOR compared as a 160-bit big-endian integer.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

/// A 20-byte torrent infohash; same space as [`NodeId`].
pub type InfoHash = NodeId;

impl NodeId {
    pub const LEN: usize = 20;
    pub const BITS: usize = 160;

    /// A fresh random id.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != Self::LEN {
            return Err(DhtError::InvalidId);
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    /// Parses a 40-character hex string, the form embedders usually hold
    /// infohashes in.
    pub fn from_hex(s: &str) -> Result<Self, DhtError> {
        if s.len() != 40 {
            return Err(DhtError::InvalidId);
        }
        let mut id = [0u8; 20];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| DhtError::InvalidId)?;
        }
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn xor_distance(&self, other: &NodeId) -> [u8; 20] {
        let mut dist = [0u8; 20];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Number of leading bits shared with `other`; 160 for equal ids.
    pub fn common_bits(&self, other: &NodeId) -> usize {
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let xor = a ^ b;
            if xor != 0 {
                return i * 8 + xor.leading_zeros() as usize;
            }
        }
        Self::BITS
    }

    /// Bit `i` of the id, most significant first.
    pub fn bit(&self, i: usize) -> bool {
        (self.0[i / 8] >> (7 - (i % 8))) & 1 != 0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

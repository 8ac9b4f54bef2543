//! Bounded per-infohash peer cache.
//!
//! Each infohash maps to a set of compact peer contacts arranged in a
//! ring, so successive draws hand out different peers. The ring is an
//! index-based circular list over a flat slot array: unlink is a splice
//! of indices and killing a contact is an O(1) liveness flip, with the
//! actual removal deferred until space is needed.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

use lru::LruCache;

use super::id::InfoHash;
use super::routing::K_NODES;

const MIN_CONTACT_LEN: usize = 6;

struct Slot {
    contact: Vec<u8>,
    next: usize,
    prev: usize,
    alive: bool,
}

#[derive(Default)]
pub(crate) struct PeerContactsSet {
    slots: Vec<Slot>,
    index: HashMap<Vec<u8>, usize>,
    head: usize,
    free: Vec<usize>,
}

impl PeerContactsSet {
    fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.index.len()
    }

    #[cfg(test)]
    pub fn alive(&self) -> usize {
        self.index
            .values()
            .filter(|&&slot| self.slots[slot].alive)
            .count()
    }

    pub fn contains(&self, contact: &[u8]) -> bool {
        self.index.contains_key(contact)
    }

    /// Adds a contact as alive at the ring tail. Returns false for
    /// contacts shorter than 6 bytes or already present.
    pub fn put(&mut self, contact: &[u8]) -> bool {
        if contact.len() < MIN_CONTACT_LEN || self.index.contains_key(contact) {
            return false;
        }
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Slot {
                    contact: contact.to_vec(),
                    next: slot,
                    prev: slot,
                    alive: true,
                };
                slot
            }
            None => {
                self.slots.push(Slot {
                    contact: contact.to_vec(),
                    next: self.slots.len(),
                    prev: self.slots.len(),
                    alive: true,
                });
                self.slots.len() - 1
            }
        };
        if self.index.is_empty() {
            self.head = slot;
        } else {
            let head = self.head;
            let tail = self.slots[head].prev;
            self.slots[tail].next = slot;
            self.slots[slot].prev = tail;
            self.slots[slot].next = head;
            self.slots[head].prev = slot;
        }
        self.index.insert(contact.to_vec(), slot);
        true
    }

    /// Up to 8 contacts starting at the ring head, alive ones first and
    /// tombstoned ones only to fill out the count. The head advances one
    /// slot per returned contact, so consecutive calls rotate through the
    /// whole set.
    pub fn next(&mut self) -> Vec<Vec<u8>> {
        let total = self.index.len();
        if total == 0 {
            return Vec::new();
        }
        let want = total.min(K_NODES);
        let mut drawn = Vec::with_capacity(want);
        let mut dead = Vec::new();

        let mut cursor = self.head;
        for _ in 0..total {
            let slot = &self.slots[cursor];
            if slot.alive {
                drawn.push(slot.contact.clone());
            } else {
                dead.push(cursor);
            }
            cursor = slot.next;
            if drawn.len() >= want {
                break;
            }
        }
        for slot in dead {
            if drawn.len() >= want {
                break;
            }
            drawn.push(self.slots[slot].contact.clone());
        }

        for _ in 0..drawn.len() {
            self.head = self.slots[self.head].next;
        }
        drawn
    }

    /// Unlinks and returns one tombstoned contact, if any.
    pub fn drop_dead(&mut self) -> Option<Vec<u8>> {
        let total = self.index.len();
        let mut cursor = self.head;
        for _ in 0..total {
            let next = self.slots[cursor].next;
            if !self.slots[cursor].alive {
                return Some(self.unlink(cursor));
            }
            cursor = next;
        }
        None
    }

    /// Unlinks a specific contact from the ring and the set.
    #[cfg(test)]
    pub fn remove(&mut self, contact: &[u8]) -> Option<Vec<u8>> {
        let slot = *self.index.get(contact)?;
        Some(self.unlink(slot))
    }

    /// Flips a contact dead without unlinking; removal is lazy.
    pub fn kill(&mut self, contact: &[u8]) {
        if let Some(&slot) = self.index.get(contact) {
            self.slots[slot].alive = false;
        }
    }

    fn unlink(&mut self, slot: usize) -> Vec<u8> {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
        if next != slot {
            self.slots[prev].next = next;
            self.slots[next].prev = prev;
            if self.head == slot {
                self.head = next;
            }
        }
        let contact = std::mem::take(&mut self.slots[slot].contact);
        self.index.remove(&contact);
        self.free.push(slot);
        contact
    }
}

/// LRU of infohash → peer contact set, bounded both across infohashes and
/// per set.
pub(crate) struct PeerStore {
    infohash_peers: LruCache<InfoHash, PeerContactsSet>,
    local_active_downloads: HashSet<InfoHash>,
    max_infohash_peers: usize,
}

impl PeerStore {
    pub fn new(max_infohashes: usize, max_infohash_peers: usize) -> Self {
        Self {
            infohash_peers: LruCache::new(
                NonZeroUsize::new(max_infohashes).unwrap_or(NonZeroUsize::MIN),
            ),
            local_active_downloads: HashSet::new(),
            max_infohash_peers,
        }
    }

    /// Records a peer contact for an infohash. Returns true iff newly
    /// inserted. A full set accepts a new contact only when a tombstoned
    /// entry can be evicted: an all-alive full set rejects.
    pub fn add_contact(&mut self, ih: InfoHash, contact: &[u8]) -> bool {
        let max = self.max_infohash_peers;
        let set = self
            .infohash_peers
            .get_or_insert_mut(ih, PeerContactsSet::new);
        if set.size() >= max {
            if set.contains(contact) {
                return false;
            }
            if set.drop_dead().is_none() {
                return false;
            }
        }
        set.put(contact)
    }

    /// The next batch of up to 8 contacts for `ih`, or empty when unknown.
    pub fn peer_contacts(&mut self, ih: &InfoHash) -> Vec<Vec<u8>> {
        match self.infohash_peers.get_mut(ih) {
            Some(set) => set.next(),
            None => Vec::new(),
        }
    }

    /// Known contacts for `ih`.
    pub fn count(&mut self, ih: &InfoHash) -> usize {
        self.infohash_peers.get(ih).map_or(0, PeerContactsSet::size)
    }

    #[cfg(test)]
    pub fn alive(&mut self, ih: &InfoHash) -> usize {
        self.infohash_peers.get(ih).map_or(0, PeerContactsSet::alive)
    }

    /// Tombstones a contact in every set we actively download, which is
    /// where stale peers would actually hurt.
    pub fn kill_contact(&mut self, contact: &[u8]) {
        let active: Vec<InfoHash> = self.local_active_downloads.iter().copied().collect();
        for ih in active {
            if let Some(set) = self.infohash_peers.get_mut(&ih) {
                set.kill(contact);
            }
        }
    }

    pub fn add_local_download(&mut self, ih: InfoHash) {
        self.local_active_downloads.insert(ih);
    }

    pub fn has_local_download(&self, ih: &InfoHash) -> bool {
        self.local_active_downloads.contains(ih)
    }
}

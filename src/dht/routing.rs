//! Binary routing trie.
//!
//! Instead of the classical Kademlia bucket list, routing entries live in
//! a binary trie keyed by node-id bits, most significant first. Lookup
//! walks the side matching the target's bit first, so an inorder sweep
//! collects the closest populated branches without any bucket-splitting
//! bookkeeping. Paths stay as short as the populated id prefixes allow:
//! inserting a colliding prefix branches the trie only down to the first
//! divergent bit.

use super::id::NodeId;

/// Nodes returned per lookup (the Kademlia k).
pub(crate) const K_NODES: usize = 8;

/// A terminal entry: the remote's id and its routing-table address key.
/// Node state itself is owned by the table's address map.
#[derive(Debug, Clone)]
pub(crate) struct Leaf {
    pub id: NodeId,
    pub addr_key: String,
}

#[derive(Debug, Default)]
pub(crate) struct Trie {
    zero: Option<Box<Trie>>,
    one: Option<Box<Trie>>,
    leaf: Option<Leaf>,
}

impl Trie {
    pub fn insert(&mut self, id: NodeId, addr_key: String) {
        self.put(Leaf { id, addr_key }, 0);
    }

    fn put(&mut self, leaf: Leaf, depth: usize) {
        if depth >= NodeId::BITS {
            self.leaf = Some(leaf);
            return;
        }
        if let Some(existing) = self.leaf.take() {
            if existing.id == leaf.id {
                self.leaf = Some(leaf);
                return;
            }
            // Slot occupied by a different id: promote to internal and
            // push both down until their bits diverge.
            self.branch_out(leaf, existing, depth);
            return;
        }
        let child = self.child_mut(leaf.id.bit(depth));
        match child {
            Some(sub) => sub.put(leaf, depth + 1),
            None => {
                *child = Some(Box::new(Trie {
                    leaf: Some(leaf),
                    ..Trie::default()
                }));
            }
        }
    }

    fn branch_out(&mut self, a: Leaf, b: Leaf, depth: usize) {
        let bit_a = a.id.bit(depth);
        if bit_a != b.id.bit(depth) {
            self.put(a, depth);
            self.put(b, depth);
            return;
        }
        let child = self.child_mut(bit_a);
        *child = Some(Box::new(Trie::default()));
        if let Some(sub) = child {
            sub.branch_out(a, b, depth + 1);
        }
    }

    fn child_mut(&mut self, bit: bool) -> &mut Option<Box<Trie>> {
        if bit {
            &mut self.one
        } else {
            &mut self.zero
        }
    }

    /// Up to [`K_NODES`] terminals nearest to `target`, nearest side first.
    pub fn lookup(&self, target: &NodeId) -> Vec<&Leaf> {
        let mut found = Vec::with_capacity(K_NODES);
        self.traverse(target, 0, &mut found, None);
        found
    }

    /// Like [`lookup`](Self::lookup), skipping terminals rejected by `keep`.
    pub fn lookup_filtered<'t>(
        &'t self,
        target: &NodeId,
        keep: &dyn Fn(&Leaf) -> bool,
    ) -> Vec<&'t Leaf> {
        let mut found = Vec::with_capacity(K_NODES);
        self.traverse(target, 0, &mut found, Some(keep));
        found
    }

    fn traverse<'t>(
        &'t self,
        target: &NodeId,
        depth: usize,
        found: &mut Vec<&'t Leaf>,
        keep: Option<&dyn Fn(&Leaf) -> bool>,
    ) {
        if let Some(leaf) = &self.leaf {
            if keep.map_or(true, |keep| keep(leaf)) {
                found.push(leaf);
            }
            return;
        }
        if depth >= NodeId::BITS || found.len() >= K_NODES {
            return;
        }
        let (near, far) = if target.bit(depth) {
            (&self.one, &self.zero)
        } else {
            (&self.zero, &self.one)
        };
        if let Some(sub) = near {
            sub.traverse(target, depth + 1, found, keep);
        }
        if found.len() >= K_NODES {
            return;
        }
        if let Some(sub) = far {
            sub.traverse(target, depth + 1, found, keep);
        }
    }

    /// Removes the terminal for `id` and collapses the emptied subtrees on
    /// the way back up. Returns true when this whole subtree is empty.
    pub fn cut(&mut self, id: &NodeId, depth: usize) -> bool {
        if let Some(leaf) = &self.leaf {
            return leaf.id == *id;
        }
        if depth >= NodeId::BITS {
            return true;
        }
        let bit = id.bit(depth);
        let empty = match self.child_mut(bit) {
            None => true,
            Some(sub) => sub.cut(id, depth + 1),
        };
        if empty {
            *self.child_mut(bit) = None;
            if self.child_mut(!bit).is_none() {
                return true;
            }
        }
        false
    }
}

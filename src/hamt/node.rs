// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Trie node types and bitmap helpers.
//!
//! Nodes are immutable: every mutation builds a fresh node for the path from
//! the root to the touched key and shares all other subtrees via [`Arc`].

use std::sync::Arc;

/// Bits consumed per trie level (6 bits, 64-way branching).
pub(crate) const SHIFT_INCREMENT: u32 = 6;

/// Mask extracting one 6-bit hash chunk.
pub(crate) const CHUNK_MASK: u64 = 0x3f;

/// Extracts the 6-bit hash chunk for the given level.
#[inline]
pub(crate) const fn mask(hash: u64, shift: u32) -> u64 {
    (hash >> shift) & CHUNK_MASK
}

/// Maps a hash chunk to its single-bit position in a node bitmap.
#[inline]
pub(crate) const fn bitpos(hash: u64, shift: u32) -> u64 {
    1 << mask(hash, shift)
}

/// Returns the dense child index of `bit`: the number of set bits below it.
#[inline]
pub(crate) const fn index(bitmap: u64, bit: u64) -> usize {
    (bitmap & (bit - 1)).count_ones() as usize
}

/// A node of the hash-array-mapped trie.
pub(crate) enum Node<K, V> {
    /// A single key-value entry with its precomputed hash.
    Leaf { hash: u64, key: K, value: V },

    /// Branch node. The bitmap records which of the 64 chunk values are
    /// occupied; children are packed densely in bitmap order.
    BitmapIndexed {
        bitmap: u64,
        nodes: Box<[Arc<Node<K, V>>]>,
        shift: u32,
    },

    /// Fallback for keys whose hashes collide through all 64 bits.
    /// Lookup degrades to a linear scan by key equality.
    HashCollision {
        hash: u64,
        leaves: Box<[Arc<Node<K, V>>]>,
    },
}

/// Outcome of a removal at one node.
pub(crate) enum Removed<K, V> {
    /// The key was absent; the caller keeps its existing node pointer.
    NotFound,
    /// The node became empty and must be pruned by the caller.
    Empty,
    /// The node was replaced by a rebuilt (possibly collapsed) node.
    Node(Arc<Node<K, V>>),
}

impl<K: Eq, V> Node<K, V> {
    /// Looks up `key` by its hash. Returns the matching entry, if any.
    pub fn find(&self, key: &K, hash: u64) -> Option<(&K, &V)> {
        match self {
            Node::Leaf {
                hash: h,
                key: k,
                value,
            } => {
                if *h == hash && k == key {
                    Some((k, value))
                } else {
                    None
                }
            }
            Node::BitmapIndexed {
                bitmap,
                nodes,
                shift,
            } => {
                let bit = bitpos(hash, *shift);
                if bitmap & bit == 0 {
                    None
                } else {
                    nodes[index(*bitmap, bit)].find(key, hash)
                }
            }
            Node::HashCollision { hash: h, leaves } => {
                if *h != hash {
                    return None;
                }
                leaves.iter().find_map(|leaf| leaf.find(key, hash))
            }
        }
    }

    /// Associates `key` with `value`, returning the replacement node.
    ///
    /// Sets `added` when a new key was inserted, as opposed to overwriting an
    /// existing one; the map uses the signal to keep its count correct.
    pub fn assoc(
        self: &Arc<Self>,
        shift: u32,
        hash: u64,
        key: K,
        value: V,
        added: &mut bool,
    ) -> Arc<Self> {
        match &**self {
            Node::Leaf {
                hash: h, key: k, ..
            } => {
                if *h == hash {
                    if k == &key {
                        // overwrite in place, count unchanged
                        return Arc::new(Node::Leaf { hash, key, value });
                    }
                    // identical hashes through every level
                    *added = true;
                    return Arc::new(Node::HashCollision {
                        hash,
                        leaves: vec![self.clone(), Arc::new(Node::Leaf { hash, key, value })]
                            .into(),
                    });
                }
                *added = true;
                Node::join(shift, self.clone(), Arc::new(Node::Leaf { hash, key, value }))
            }
            Node::BitmapIndexed {
                bitmap,
                nodes,
                shift: node_shift,
            } => {
                let bit = bitpos(hash, *node_shift);
                let idx = index(*bitmap, bit);
                if bitmap & bit != 0 {
                    let child =
                        nodes[idx].assoc(node_shift + SHIFT_INCREMENT, hash, key, value, added);
                    let mut new_nodes = nodes.to_vec();
                    new_nodes[idx] = child;
                    Arc::new(Node::BitmapIndexed {
                        bitmap: *bitmap,
                        nodes: new_nodes.into(),
                        shift: *node_shift,
                    })
                } else {
                    *added = true;
                    let mut new_nodes = Vec::with_capacity(nodes.len() + 1);
                    new_nodes.extend_from_slice(&nodes[..idx]);
                    new_nodes.push(Arc::new(Node::Leaf { hash, key, value }));
                    new_nodes.extend_from_slice(&nodes[idx..]);
                    Arc::new(Node::BitmapIndexed {
                        bitmap: bitmap | bit,
                        nodes: new_nodes.into(),
                        shift: *node_shift,
                    })
                }
            }
            Node::HashCollision { hash: h, leaves } => {
                if *h != hash {
                    // the new key diverges from the collision hash at some level
                    *added = true;
                    return Node::join(
                        shift,
                        self.clone(),
                        Arc::new(Node::Leaf { hash, key, value }),
                    );
                }
                let pos = leaves.iter().position(|leaf| leaf.find(&key, hash).is_some());
                let mut new_leaves = leaves.to_vec();
                match pos {
                    Some(i) => new_leaves[i] = Arc::new(Node::Leaf { hash, key, value }),
                    None => {
                        *added = true;
                        new_leaves.push(Arc::new(Node::Leaf { hash, key, value }));
                    }
                }
                Arc::new(Node::HashCollision {
                    hash,
                    leaves: new_leaves.into(),
                })
            }
        }
    }

    /// Removes `key`, collapsing single-child branches on the way up.
    pub fn without(&self, hash: u64, key: &K) -> Removed<K, V> {
        match self {
            Node::Leaf { hash: h, key: k, .. } => {
                if *h == hash && k == key {
                    Removed::Empty
                } else {
                    Removed::NotFound
                }
            }
            Node::BitmapIndexed {
                bitmap,
                nodes,
                shift,
            } => {
                let bit = bitpos(hash, *shift);
                if bitmap & bit == 0 {
                    return Removed::NotFound;
                }
                let idx = index(*bitmap, bit);
                match nodes[idx].without(hash, key) {
                    Removed::NotFound => Removed::NotFound,
                    Removed::Node(child) => {
                        let mut new_nodes = nodes.to_vec();
                        new_nodes[idx] = child;
                        Removed::Node(Arc::new(Node::BitmapIndexed {
                            bitmap: *bitmap,
                            nodes: new_nodes.into(),
                            shift: *shift,
                        }))
                    }
                    Removed::Empty => {
                        if nodes.len() == 1 {
                            return Removed::Empty;
                        }
                        let mut new_nodes = nodes.to_vec();
                        new_nodes.remove(idx);
                        if new_nodes.len() == 1
                            && !matches!(&*new_nodes[0], Node::BitmapIndexed { .. })
                        {
                            // single leaf-like child: collapse it upward
                            return Removed::Node(new_nodes[0].clone());
                        }
                        Removed::Node(Arc::new(Node::BitmapIndexed {
                            bitmap: bitmap & !bit,
                            nodes: new_nodes.into(),
                            shift: *shift,
                        }))
                    }
                }
            }
            Node::HashCollision { hash: h, leaves } => {
                if *h != hash {
                    return Removed::NotFound;
                }
                let pos = leaves.iter().position(|leaf| leaf.find(key, hash).is_some());
                match pos {
                    None => Removed::NotFound,
                    Some(i) => {
                        let mut new_leaves = leaves.to_vec();
                        new_leaves.remove(i);
                        match new_leaves.len() {
                            0 => Removed::Empty,
                            1 => Removed::Node(new_leaves[0].clone()),
                            _ => Removed::Node(Arc::new(Node::HashCollision {
                                hash,
                                leaves: new_leaves.into(),
                            })),
                        }
                    }
                }
            }
        }
    }

    /// Builds the smallest branch structure holding two leaf-like nodes whose
    /// hashes differ. Recurses one level deeper while their chunks agree.
    fn join(shift: u32, a: Arc<Self>, b: Arc<Self>) -> Arc<Self> {
        let (ha, hb) = (a.node_hash(), b.node_hash());
        let (bit_a, bit_b) = (bitpos(ha, shift), bitpos(hb, shift));
        if bit_a == bit_b {
            let child = Node::join(shift + SHIFT_INCREMENT, a, b);
            return Arc::new(Node::BitmapIndexed {
                bitmap: bit_a,
                nodes: vec![child].into(),
                shift,
            });
        }
        let nodes = if bit_a < bit_b { vec![a, b] } else { vec![b, a] };
        Arc::new(Node::BitmapIndexed {
            bitmap: bit_a | bit_b,
            nodes: nodes.into(),
            shift,
        })
    }

    fn node_hash(&self) -> u64 {
        match self {
            Node::Leaf { hash, .. } | Node::HashCollision { hash, .. } => *hash,
            Node::BitmapIndexed { .. } => unreachable!("branch nodes carry no single hash"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_helpers() {
        assert_eq!(mask(0b101_000000, 6), 0b101);
        assert_eq!(bitpos(0, 0), 1);
        assert_eq!(bitpos(63, 0), 1 << 63);
        // three children below bit 5
        assert_eq!(index(0b101011, 1 << 5), 3);
        assert_eq!(index(0b101011, 1 << 0), 0);
    }

    #[test]
    fn test_join_splits_on_first_differing_chunk() {
        let a: Arc<Node<u64, ()>> = Arc::new(Node::Leaf {
            hash: 0b000001,
            key: 1,
            value: (),
        });
        let b = Arc::new(Node::Leaf {
            hash: 0b000010,
            key: 2,
            value: (),
        });
        let joined = Node::join(0, a, b);
        match &*joined {
            Node::BitmapIndexed { bitmap, nodes, .. } => {
                assert_eq!(*bitmap, (1 << 1) | (1 << 2));
                assert_eq!(nodes.len(), 2);
            }
            _ => panic!("expected a branch node"),
        }
    }

    #[test]
    fn test_join_recurses_while_chunks_agree() {
        // chunks equal at level 0, differ at level 1
        let a: Arc<Node<u64, ()>> = Arc::new(Node::Leaf {
            hash: 0b000001_000011,
            key: 1,
            value: (),
        });
        let b = Arc::new(Node::Leaf {
            hash: 0b000010_000011,
            key: 2,
            value: (),
        });
        let joined = Node::join(0, a, b);
        match &*joined {
            Node::BitmapIndexed { bitmap, nodes, shift } => {
                assert_eq!(*shift, 0);
                assert_eq!(*bitmap, 1 << 0b000011);
                assert_eq!(nodes.len(), 1);
                match &*nodes[0] {
                    Node::BitmapIndexed { shift, .. } => assert_eq!(*shift, 6),
                    _ => panic!("expected a nested branch node"),
                }
            }
            _ => panic!("expected a branch node"),
        }
    }
}

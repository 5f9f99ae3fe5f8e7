// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::hamt::{
    iter::{Iter, Keys, Values},
    node::{Node, Removed},
};
use std::{
    collections::hash_map::DefaultHasher,
    fmt::{self, Debug},
    hash::{Hash, Hasher},
    sync::Arc,
};

/// An immutable hash map with structural sharing.
///
/// Every mutating operation returns a new map; the receiver is never touched,
/// so older versions remain valid and queryable indefinitely. Only the
/// `O(log n)` nodes on the path to the changed key are rebuilt, everything
/// else is shared between versions. Cloning a map is a constant-time
/// reference-count bump, which is what makes it a natural value type for
/// transactional references.
pub struct PersistentHashMap<K, V> {
    root: Option<Arc<Node<K, V>>>,
    count: usize,
}

fn hash_key<K: Hash>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl<K, V> PersistentHashMap<K, V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries. Overwriting an existing key does not change it.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Iterates over all entries in unspecified order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(self.root.as_deref())
    }

    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys::new(self.iter())
    }

    pub fn values(&self) -> Values<'_, K, V> {
        Values::new(self.iter())
    }
}

impl<K: Hash + Eq, V> PersistentHashMap<K, V> {
    pub fn get(&self, key: &K) -> Option<&V> {
        self.get_key_value(key).map(|(_, v)| v)
    }

    pub fn get_key_value(&self, key: &K) -> Option<(&K, &V)> {
        self.root.as_ref()?.find(key, hash_key(key))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get_key_value(key).is_some()
    }

    /// Returns a new map with `key` bound to `value`.
    pub fn insert(&self, key: K, value: V) -> Self {
        let hash = hash_key(&key);
        match &self.root {
            None => Self {
                root: Some(Arc::new(Node::Leaf { hash, key, value })),
                count: 1,
            },
            Some(root) => {
                let mut added = false;
                let root = root.assoc(0, hash, key, value, &mut added);
                Self {
                    root: Some(root),
                    count: self.count + usize::from(added),
                }
            }
        }
    }

    /// Returns a new map without `key`. Removing an absent key reuses the
    /// receiver's nodes wholesale.
    pub fn remove(&self, key: &K) -> Self {
        match &self.root {
            None => self.clone(),
            Some(root) => match root.without(hash_key(key), key) {
                Removed::NotFound => self.clone(),
                Removed::Empty => Self {
                    root: None,
                    count: 0,
                },
                Removed::Node(root) => Self {
                    root: Some(root),
                    count: self.count - 1,
                },
            },
        }
    }
}

impl<K, V> Clone for PersistentHashMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            count: self.count,
        }
    }
}

impl<K, V> Default for PersistentHashMap<K, V> {
    fn default() -> Self {
        Self {
            root: None,
            count: 0,
        }
    }
}

impl<K: Hash + Eq, V: PartialEq> PartialEq for PersistentHashMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.count == other.count && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl<K: Hash + Eq, V: Eq> Eq for PersistentHashMap<K, V> {}

impl<K: Debug, V: Debug> Debug for PersistentHashMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: Hash + Eq, V> FromIterator<(K, V)> for PersistentHashMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::default(), |map, (k, v)| map.insert(k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_map() {
        let map: PersistentHashMap<String, usize> = PersistentHashMap::new();
        assert_eq!(map.len(), 0);
        assert!(map.is_empty());
        assert_eq!(map.get(&"a".to_string()), None);
    }

    #[test]
    fn test_insert_get_remove() {
        let m0: PersistentHashMap<&str, usize> = PersistentHashMap::new();
        let m1 = m0.insert("a", 1);
        let m2 = m1.insert("b", 2);
        let m3 = m2.remove(&"a");

        assert_eq!(m3.get(&"b"), Some(&2));
        assert_eq!(m3.get(&"a"), None);
        assert_eq!(m3.len(), 1);

        // earlier versions are untouched
        assert_eq!(m1.get(&"a"), Some(&1));
        assert_eq!(m1.len(), 1);
        assert_eq!(m2.len(), 2);
        assert_eq!(m0.len(), 0);
    }

    #[test]
    fn test_overwrite_keeps_count() {
        let map = PersistentHashMap::new().insert("k", 1);
        let map = map.insert("k", 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&"k"), Some(&2));
    }

    #[test]
    fn test_remove_absent_key_is_identity() {
        let map = PersistentHashMap::new().insert("a", 1);
        let same = map.remove(&"missing");
        assert_eq!(same, map);
        assert_eq!(same.len(), 1);
    }

    #[test]
    fn test_content_equality() {
        let a: PersistentHashMap<&str, usize> =
            [("x", 1), ("y", 2)].into_iter().collect();
        let b: PersistentHashMap<&str, usize> =
            [("y", 2), ("x", 1)].into_iter().collect();
        assert_eq!(a, b);
        assert_ne!(a, b.insert("z", 3));
    }
}

//! Dense, first-seen-order indices for raw entity keys.
use std::collections::HashMap;
use std::hash::Hash;

/// Bidirectional mapping between raw keys and contiguous indices.
///
/// The first key passed to [`EntityIndex::index_of`] gets index 0, the next
/// new key gets 1, and so on. Keys are never removed, so an index, once
/// handed out, stays valid for the lifetime of the structure.
#[derive(Clone, Debug)]
pub struct EntityIndex<K = String> {
    positions: HashMap<K, usize>,
    keys: Vec<K>,
}

impl<K: Hash + Eq + Clone> Default for EntityIndex<K> {
    fn default() -> Self {
        EntityIndex {
            positions: HashMap::new(),
            keys: Vec::new(),
        }
    }
}

impl<K: Hash + Eq + Clone> EntityIndex<K> {
    /// Build an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the index of `key`, allocating the next free one if the key
    /// has not been seen before.
    pub fn index_of(&mut self, key: &K) -> usize {
        if let Some(&idx) = self.positions.get(key) {
            return idx;
        }

        let idx = self.keys.len();
        self.keys.push(key.clone());
        self.positions.insert(key.clone(), idx);

        idx
    }

    /// Look up `key` without allocating.
    pub fn get(&self, key: &K) -> Option<usize> {
        self.positions.get(key).cloned()
    }

    /// The key stored at `idx`.
    pub fn key(&self, idx: usize) -> Option<&K> {
        self.keys.get(idx)
    }

    /// All keys in index order.
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no key has been indexed yet.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterate over `(index, key)` pairs in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &K)> {
        self.keys.iter().enumerate()
    }
}

/// The user and item indices of one pipeline run.
#[derive(Clone, Debug, Default)]
pub struct Indices {
    /// Index over interaction sources.
    pub users: EntityIndex<String>,
    /// Index over interaction targets, real items first.
    pub items: EntityIndex<String>,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn first_seen_order() {
        let mut index = EntityIndex::new();

        let keys = ["b", "a", "b", "c", "a"];
        let assigned: Vec<usize> = keys
            .iter()
            .map(|key| index.index_of(&key.to_string()))
            .collect();

        assert_eq!(assigned, vec![0, 1, 0, 2, 1]);
        assert_eq!(index.keys(), &["b", "a", "c"]);
        assert_eq!(index.get(&"c".to_string()), Some(2));
        assert_eq!(index.get(&"d".to_string()), None);
        assert_eq!(index.key(1).map(|x| x.as_str()), Some("a"));
    }

    proptest! {
        #[test]
        fn reindexing_is_idempotent(keys in proptest::collection::vec("[a-e]{1,2}", 0..64)) {
            let mut first = EntityIndex::new();
            let mut second = EntityIndex::new();

            let a: Vec<usize> = keys.iter().map(|key| first.index_of(key)).collect();
            let b: Vec<usize> = keys.iter().map(|key| second.index_of(key)).collect();

            prop_assert_eq!(a, b);
        }

        #[test]
        fn indices_are_contiguous_and_bijective(keys in proptest::collection::vec("[a-z]{1,3}", 0..64)) {
            let mut index = EntityIndex::new();

            for key in &keys {
                index.index_of(key);
            }

            for (idx, key) in index.iter() {
                prop_assert_eq!(index.get(key), Some(idx));
            }

            let distinct: std::collections::HashSet<_> = keys.iter().collect();
            prop_assert_eq!(index.len(), distinct.len());
        }
    }
}

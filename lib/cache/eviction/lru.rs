//! Least-recently-used ordering for a count-bounded cache.

use std::hash::Hash;

use hashlink::LinkedHashMap;

/// Entries ordered from least to most recently used.
///
/// The index only orders and bounds; dropping an evicted value is the owner's business.
#[derive(Debug)]
pub struct LruIndex<K: Eq + Hash, V> {
    /// Front is the eviction candidate, back the most recent access.
    ordered: LinkedHashMap<K, V>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> LruIndex<K, V> {
    /// An empty index holding at most `capacity` entries once
    /// [`evict_over_capacity`](Self::evict_over_capacity) has run.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            ordered: LinkedHashMap::new(),
            capacity,
        }
    }

    /// The configured maximum.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert or replace `key` as the most recently used entry. Returns the replaced value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.ordered.remove(&key);
        self.ordered.insert(key, value);
        previous
    }

    /// Look up `key` and mark it most recently used.
    pub fn touch(&mut self, key: &K) -> Option<&V> {
        let value = self.ordered.remove(key)?;
        self.ordered.insert(key.clone(), value);
        self.ordered.back().map(|(_, v)| v)
    }

    /// Look up `key` without changing its recency.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.ordered.get(key)
    }

    /// Remove `key`.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.ordered.remove(key)
    }

    /// Remove every entry whose key matches `pred`.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&K) -> bool) -> Vec<V> {
        let doomed: Vec<K> = self.ordered.keys().filter(|k| pred(k)).cloned().collect();
        doomed
            .iter()
            .filter_map(|k| self.ordered.remove(k))
            .collect()
    }

    /// Pop least recently used entries until at most `capacity` remain. Returns them oldest first.
    pub fn evict_over_capacity(&mut self) -> Vec<(K, V)> {
        let excess = self.ordered.len().saturating_sub(self.capacity);
        (0..excess)
            .filter_map(|_| self.ordered.pop_front())
            .collect()
    }

    /// Remove everything, oldest first.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        std::iter::from_fn(|| self.ordered.pop_front()).collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Returns `true` if the index holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

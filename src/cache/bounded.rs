//! Size-bounded map that evicts the least-recently-inserted key.

use lru::LruCache;
use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// Insertion-ordered map with a hard size bound.
///
/// Eviction follows insertion recency, not access recency: reads never
/// reorder entries. Re-inserting an existing key moves it to the back, so an
/// entry that keeps getting refreshed is not the next one evicted.
///
/// Backed by a linked hash map, so every operation is O(1). Only the
/// non-promoting `LruCache` accessors are used for reads.
pub struct BoundedCache<K, V> {
    entries: LruCache<K, V>,
}

impl<K: Hash + Eq, V> BoundedCache<K, V> {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.entries.peek(key)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.entries.contains(key)
    }

    /// Insert `value`, evicting the oldest insertion first if the map is full.
    ///
    /// Returns the evicted key, if any.
    pub fn put(&mut self, key: K, value: V) -> Option<K> {
        // A re-put replaces in place and moves the key to the back.
        let refresh = self.entries.contains(&key);
        let displaced = self.entries.push(key, value);
        if refresh {
            return None;
        }
        displaced.map(|(k, _)| k)
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.entries.pop(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.entries.cap().get()
    }

    /// Entries from oldest to newest insertion.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().rev()
    }
}

impl<K: Hash + Eq, V> fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedCache")
            .field("len", &self.entries.len())
            .field("max_size", &self.entries.cap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_first_inserted_at_capacity() {
        let mut cache = BoundedCache::new(3);
        for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
            assert_eq!(cache.put(key, i), None);
        }

        assert_eq!(cache.put("d", 3), Some("a"));
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&"a"));
        assert!(cache.contains(&"b") && cache.contains(&"c") && cache.contains(&"d"));
    }

    #[test]
    fn eviction_boundary_keeps_exactly_max_size() {
        let max = 50;
        let mut cache = BoundedCache::new(max);
        for i in 0..=max {
            cache.put(i, ());
        }

        assert_eq!(cache.len(), max);
        assert!(!cache.contains(&0));
        assert!((1..=max).all(|i| cache.contains(&i)));
    }

    #[test]
    fn reput_moves_key_to_back() {
        let mut cache = BoundedCache::new(3);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);

        // Refreshing "a" protects it; "b" is now the oldest insertion.
        assert_eq!(cache.put("a", 10), None);
        assert_eq!(cache.put("d", 4), Some("b"));
        assert_eq!(cache.get(&"a"), Some(&10));
    }

    #[test]
    fn reads_do_not_affect_eviction_order() {
        let mut cache = BoundedCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.get(&"a"), Some(&1));

        assert_eq!(cache.put("c", 3), Some("a"));
    }

    #[test]
    fn iteration_is_oldest_first_and_tracks_reputs() {
        let mut cache = BoundedCache::new(4);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);
        cache.put("a", 4);
        let _ = cache.get(&"b");

        let order: Vec<_> = cache.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(order, [("b", 2), ("c", 3), ("a", 4)]);
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let mut cache = BoundedCache::new(0);
        assert_eq!(cache.max_size(), 1);
        cache.put("a", 1);
        assert_eq!(cache.put("b", 2), Some("a"));
    }

    #[test]
    fn remove_and_clear() {
        let mut cache = BoundedCache::new(4);
        cache.put("a", 1);
        cache.put("b", 2);

        assert_eq!(cache.remove(&"a"), Some(1));
        assert_eq!(cache.remove(&"a"), None);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}

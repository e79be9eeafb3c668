//! Bounded LRU cache with write-back on eviction.
//!
//! Entries are written back through a caller-supplied callback before they
//! leave the cache, so eviction never loses data. The callback runs with the
//! cache already borrowed mutably and cannot reach back into it, which rules
//! out recursive eviction.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

/// LRU cache whose evictions are written back by the caller.
pub struct WriteBackCache<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
}

impl<K: Hash + Eq + Clone, V> WriteBackCache<K, V> {
    /// Create a cache holding at most `capacity` entries (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Return the entry for `key`, loading it on a miss.
    ///
    /// If the cache is full, the least recently used entry is written back
    /// and evicted first. A failed write-back leaves that entry cached.
    pub fn get_or_load<E>(
        &mut self,
        key: &K,
        load: impl FnOnce() -> Result<V, E>,
        mut write_back: impl FnMut(&K, &V) -> Result<(), E>,
    ) -> Result<&mut V, E> {
        if !self.entries.contains(key) && self.entries.len() >= self.capacity() {
            self.evict_lru(&mut write_back)?;
        }
        self.entries.try_get_or_insert_mut(key.clone(), load)
    }

    /// Write back and evict every entry, least recently used first.
    pub fn drain<E>(
        &mut self,
        mut write_back: impl FnMut(&K, &V) -> Result<(), E>,
    ) -> Result<(), E> {
        while self.evict_lru(&mut write_back)? {}
        Ok(())
    }

    /// Entries from most to least recently used, without touching recency.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.entries.iter_mut()
    }

    fn evict_lru<E>(
        &mut self,
        write_back: &mut impl FnMut(&K, &V) -> Result<(), E>,
    ) -> Result<bool, E> {
        let Some((key, value)) = self.entries.peek_lru() else {
            return Ok(false);
        };
        write_back(key, value)?;
        self.entries.pop_lru();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Vec<(u32, String)>;

    fn load(value: &str) -> impl FnOnce() -> Result<String, String> + '_ {
        move || Ok(value.to_string())
    }

    #[test]
    fn test_evicts_least_recently_used_with_write_back() {
        let mut cache = WriteBackCache::new(2);
        let mut log: Log = Vec::new();
        let mut record = |k: &u32, v: &String| -> Result<(), String> {
            log.push((*k, v.clone()));
            Ok(())
        };

        cache.get_or_load(&1, load("one"), &mut record).expect("load 1");
        cache.get_or_load(&2, load("two"), &mut record).expect("load 2");
        // Touch 1 so that 2 becomes least recently used.
        cache.get_or_load(&1, load("unused"), &mut record).expect("hit 1");
        cache.get_or_load(&3, load("three"), &mut record).expect("load 3");

        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
        assert_eq!(log, vec![(2, "two".to_string())]);
    }

    #[test]
    fn test_hit_returns_cached_value() {
        let mut cache = WriteBackCache::new(4);
        let no_write_back = |_: &u32, _: &String| Ok(());
        cache
            .get_or_load(&1, load("first"), no_write_back)
            .expect("load")
            .push_str("-edited");
        let value = cache
            .get_or_load(&1, || Err("must not load".to_string()), no_write_back)
            .expect("hit");
        assert_eq!(value, "first-edited");
    }

    #[test]
    fn test_failed_write_back_keeps_entry() {
        let mut cache = WriteBackCache::new(1);
        cache
            .get_or_load(&1, load("one"), |_, _| Ok(()))
            .expect("load");
        let result = cache.get_or_load(&2, load("two"), |_, _| Err("disk full".to_string()));
        assert_eq!(result.err(), Some("disk full".to_string()));
        assert!(cache.contains(&1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_drain_writes_back_everything() {
        let mut cache = WriteBackCache::new(8);
        for (k, v) in [(1, "a"), (2, "b"), (3, "c")] {
            cache.get_or_load(&k, load(v), |_, _| Ok(())).expect("load");
        }
        let mut log: Log = Vec::new();
        cache
            .drain(|k, v| -> Result<(), String> {
                log.push((*k, v.clone()));
                Ok(())
            })
            .expect("drain");
        assert!(cache.is_empty());
        assert_eq!(
            log,
            vec![
                (1, "a".to_string()),
                (2, "b".to_string()),
                (3, "c".to_string())
            ]
        );
    }

    #[test]
    fn test_zero_capacity_holds_one_entry() {
        let cache: WriteBackCache<u32, String> = WriteBackCache::new(0);
        assert_eq!(cache.capacity(), 1);
    }
}

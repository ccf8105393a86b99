//! Bounded most-recently-used cache.
//!
//! Entries live in a slot arena threaded onto a recency chain with a
//! `newest` and an `oldest` end; looking an entry up moves it to the
//! newest end, and overflow pops the oldest. Eviction never happens
//! silently: `put`, `pop_lru`, `set_capacity`, and `drain` hand the
//! displaced pairs back to the caller, which is what lets the bucket
//! and tile stores write dirty state back to disk before dropping it.

use std::collections::HashMap;
use std::hash::Hash;

struct Slot<K, V> {
    key: K,
    value: V,
    /// Neighbor toward the `newest` end.
    newer: Option<usize>,
    /// Neighbor toward the `oldest` (eviction) end.
    older: Option<usize>,
}

pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    /// Vacated slot indices, reused before the arena grows.
    spare: Vec<usize>,
    newest: Option<usize>,
    oldest: Option<usize>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            spare: Vec::new(),
            newest: None,
            oldest: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the capacity. Overflowing entries are returned for the
    /// caller to dispose of (write back, usually).
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<(K, V)> {
        self.capacity = capacity.max(1);
        let mut evicted = Vec::new();
        while self.map.len() > self.capacity {
            if let Some(pair) = self.pop_lru() {
                evicted.push(pair);
            }
        }
        evicted
    }

    /// Look an entry up, refreshing its recency.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let slot = *self.map.get(key)?;
        self.touch(slot);
        self.slots[slot].as_ref().map(|s| &s.value)
    }

    /// Mutable lookup, refreshing recency.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = *self.map.get(key)?;
        self.touch(slot);
        self.slots[slot].as_mut().map(|s| &mut s.value)
    }

    /// Peek without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let slot = *self.map.get(key)?;
        self.slots[slot].as_ref().map(|s| &s.value)
    }

    /// Insert or update; returns the pair evicted when the insert
    /// overflows capacity.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&slot) = self.map.get(&key) {
            if let Some(s) = self.slots[slot].as_mut() {
                s.value = value;
            }
            self.touch(slot);
            return None;
        }
        let evicted = if self.map.len() >= self.capacity {
            self.pop_lru()
        } else {
            None
        };
        let fresh = Slot { key: key.clone(), value, newer: None, older: None };
        let slot = match self.spare.pop() {
            Some(idx) => {
                self.slots[idx] = Some(fresh);
                idx
            }
            None => {
                self.slots.push(Some(fresh));
                self.slots.len() - 1
            }
        };
        self.map.insert(key, slot);
        self.attach_newest(slot);
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.map.remove(key)?;
        self.detach(slot);
        self.spare.push(slot);
        self.slots[slot].take().map(|s| s.value)
    }

    /// Remove and return the entry at the oldest end.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        let slot = self.oldest?;
        self.detach(slot);
        self.spare.push(slot);
        let s = self.slots[slot].take()?;
        self.map.remove(&s.key);
        Some((s.key, s.value))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Clear the cache, returning every entry in eviction order.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let mut out = Vec::with_capacity(self.map.len());
        while let Some(pair) = self.pop_lru() {
            out.push(pair);
        }
        self.slots.clear();
        self.spare.clear();
        self.newest = None;
        self.oldest = None;
        out
    }

    /// Iterate over (key, value) pairs without touching recency.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(|s| (&s.key, &s.value)))
    }

    /// Iterate mutably over (key, value) pairs without touching recency.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.slots
            .iter_mut()
            .filter_map(|s| s.as_mut().map(|s| (&s.key, &mut s.value)))
    }

    /// Take a slot out of the recency chain, stitching its two
    /// neighbors (or the chain ends) together.
    fn detach(&mut self, slot: usize) {
        let (older, newer) = match &self.slots[slot] {
            Some(s) => (s.older, s.newer),
            None => return,
        };
        match newer {
            Some(n) => {
                if let Some(s) = self.slots[n].as_mut() {
                    s.older = older;
                }
            }
            None => self.newest = older,
        }
        match older {
            Some(o) => {
                if let Some(s) = self.slots[o].as_mut() {
                    s.newer = newer;
                }
            }
            None => self.oldest = newer,
        }
    }

    /// Hang a detached slot at the newest end of the chain.
    fn attach_newest(&mut self, slot: usize) {
        let displaced = self.newest;
        if let Some(s) = self.slots[slot].as_mut() {
            s.newer = None;
            s.older = displaced;
        }
        if let Some(d) = displaced {
            if let Some(s) = self.slots[d].as_mut() {
                s.newer = Some(slot);
            }
        }
        self.newest = Some(slot);
        self.oldest.get_or_insert(slot);
    }

    /// Refresh recency: re-hang the slot at the newest end unless it
    /// is already there.
    fn touch(&mut self, slot: usize) {
        if self.newest != Some(slot) {
            self.detach(slot);
            self.attach_newest(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Bucket-image stand-in.
    fn image(fill: u8) -> Vec<u8> {
        vec![fill; 8]
    }

    #[test]
    fn test_eviction_hands_back_oldest() {
        let mut cache: LruCache<u32, Vec<u8>> = LruCache::new(2);
        assert!(cache.put(10, image(1)).is_none());
        assert!(cache.put(11, image(2)).is_none());

        // Touching bucket 10 leaves 11 as the eviction candidate; the
        // displaced pair comes back so a store could flush it.
        cache.get(&10);
        let evicted = cache.put(12, image(3));
        assert_eq!(evicted, Some((11, image(2))));
        assert!(cache.contains(&10));
        assert!(!cache.contains(&11));
        assert!(cache.contains(&12));
    }

    #[test]
    fn test_pop_lru_follows_recency() {
        let mut cache: LruCache<u32, Vec<u8>> = LruCache::new(4);
        for id in 0..4u32 {
            cache.put(id, image(id as u8));
        }
        // A mutable lookup refreshes recency just like a read.
        cache.get_mut(&0).unwrap()[0] = 0xFF;

        assert_eq!(cache.pop_lru().unwrap().0, 1);
        assert_eq!(cache.pop_lru().unwrap().0, 2);
        assert_eq!(cache.pop_lru().unwrap().0, 3);
        let (id, bytes) = cache.pop_lru().unwrap();
        assert_eq!(id, 0);
        assert_eq!(bytes[0], 0xFF);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_update_in_place_keeps_one_entry() {
        let mut cache: LruCache<u32, Vec<u8>> = LruCache::new(2);
        cache.put(7, image(0));
        assert!(cache.put(7, image(9)).is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.peek(&7), Some(&image(9)));
    }

    #[test]
    fn test_slot_reuse_after_remove() {
        let mut cache: LruCache<u32, Vec<u8>> = LruCache::new(3);
        for id in 0..3u32 {
            cache.put(id, image(id as u8));
        }
        assert_eq!(cache.remove(&1), Some(image(1)));
        assert_eq!(cache.len(), 2);

        // A new entry fills the vacated slot; the chain stays sound
        // around the hole.
        cache.put(5, image(5));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.pop_lru().unwrap().0, 0);
        assert_eq!(cache.pop_lru().unwrap().0, 2);
        assert_eq!(cache.pop_lru().unwrap().0, 5);
    }

    #[test]
    fn test_shrink_capacity_evicts() {
        let mut cache: LruCache<u32, Vec<u8>> = LruCache::new(4);
        for id in 0..4u32 {
            cache.put(id, image(id as u8));
        }
        let evicted = cache.set_capacity(2);
        assert_eq!(cache.len(), 2);
        // Oldest entries went first.
        assert_eq!(evicted, vec![(0, image(0)), (1, image(1))]);
    }

    #[test]
    fn test_drain_returns_everything() {
        let mut cache: LruCache<u32, Vec<u8>> = LruCache::new(3);
        cache.put(1, image(1));
        cache.put(2, image(2));
        let drained = cache.drain();
        assert_eq!(drained.len(), 2);
        assert!(cache.is_empty());
        // The cache stays usable after a drain.
        cache.put(3, image(3));
        assert_eq!(cache.len(), 1);
    }
}

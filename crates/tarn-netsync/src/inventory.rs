//! Bounded most-recently-used set.
//!
//! Backs per-peer known inventory and the rejected transaction cache. When
//! full, inserting a new item evicts the least recently inserted or
//! refreshed one.
//!
//! # Design
//!
//! Each member maps to a monotonically increasing stamp; a [`BTreeMap`]
//! ordered by stamp gives the eviction order. Refreshing an item re-stamps
//! it, so both insert and evict are `O(log n)`.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Set of at most `capacity` items with least-recently-used eviction.
#[derive(Debug, Clone)]
pub struct RecencySet<T> {
    capacity: usize,
    stamps: HashMap<T, u64>,
    order: BTreeMap<u64, T>,
    next_stamp: u64,
}

impl<T: Eq + Hash + Clone> RecencySet<T> {
    /// Create an empty set. A zero capacity set never retains anything.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            stamps: HashMap::new(),
            order: BTreeMap::new(),
            next_stamp: 0,
        }
    }

    /// Insert `item`, or refresh it if already present.
    ///
    /// Returns `true` if the item was not present before.
    pub fn insert(&mut self, item: T) -> bool {
        if self.capacity == 0 {
            return true;
        }
        let stamp = self.next_stamp;
        self.next_stamp += 1;

        if let Some(old) = self.stamps.insert(item.clone(), stamp) {
            self.order.remove(&old);
            self.order.insert(stamp, item);
            return false;
        }

        self.order.insert(stamp, item);
        if self.stamps.len() > self.capacity {
            if let Some((_, oldest)) = self.order.pop_first() {
                self.stamps.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, item: &T) -> bool {
        self.stamps.contains_key(item)
    }

    /// Remove `item`. Returns `true` if it was present.
    pub fn remove(&mut self, item: &T) -> bool {
        match self.stamps.remove(item) {
            Some(stamp) => {
                self.order.remove(&stamp);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.stamps.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn insert_reports_novelty() {
        let mut set = RecencySet::new(4);
        assert!(set.insert(1));
        assert!(!set.insert(1));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn evicts_least_recent() {
        let mut set = RecencySet::new(3);
        for i in 0..3 {
            set.insert(i);
        }
        set.insert(3);
        assert!(!set.contains(&0));
        assert!(set.contains(&1) && set.contains(&2) && set.contains(&3));
    }

    #[test]
    fn refresh_protects_from_eviction() {
        let mut set = RecencySet::new(3);
        for i in 0..3 {
            set.insert(i);
        }
        set.insert(0);
        set.insert(3);
        assert!(set.contains(&0));
        assert!(!set.contains(&1));
    }

    #[test]
    fn remove_then_reinsert() {
        let mut set = RecencySet::new(2);
        set.insert("a");
        assert!(set.remove(&"a"));
        assert!(!set.remove(&"a"));
        assert!(set.insert("a"));
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut set = RecencySet::new(0);
        assert!(set.insert(7));
        assert!(set.insert(7));
        assert!(set.is_empty());
    }

    proptest! {
        /// The set never exceeds capacity and always holds the newest item.
        #[test]
        fn bounded_and_keeps_newest(cap in 1usize..16, items in prop::collection::vec(0u8..32, 0..200)) {
            let mut set = RecencySet::new(cap);
            for item in &items {
                set.insert(*item);
                prop_assert!(set.len() <= cap);
                prop_assert!(set.contains(item));
            }
        }
    }
}

//! Bounded pool of blocks whose parent is not yet connected.
//!
//! Entries are keyed by block hash, indexed by previous hash for resolution,
//! and ordered by expiration for eviction. Capacity is an entry count and
//! does not account for block size.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use libp2p::PeerId;
use tarn_core::types::{Block, Hash256};
use tracing::debug;

/// Longest lifetime an orphan may be given.
pub const MAX_ORPHAN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A pooled orphan block.
#[derive(Debug, Clone)]
pub struct OrphanEntry {
    pub block: Block,
    /// Peer the block arrived from; `None` for local submissions.
    pub from: Option<PeerId>,
    pub expires_at: Instant,
    stamp: u64,
}

/// Result of [`OrphanPool::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanInsert {
    /// Stored as a new entry; `evicted` was removed to make room.
    Added { evicted: Option<Hash256> },
    /// Already pooled; its expiration was pushed back.
    Refreshed,
}

#[derive(Debug)]
pub struct OrphanPool {
    max_entries: usize,
    ttl: Duration,
    entries: HashMap<Hash256, OrphanEntry>,
    by_prev: HashMap<Hash256, Vec<Hash256>>,
    expiry: BTreeMap<(Instant, u64), Hash256>,
    next_stamp: u64,
}

impl OrphanPool {
    /// Create a pool holding at most `max_entries` blocks (at least one).
    /// `ttl` is capped at [`MAX_ORPHAN_TTL`].
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl: ttl.min(MAX_ORPHAN_TTL),
            entries: HashMap::new(),
            by_prev: HashMap::new(),
            expiry: BTreeMap::new(),
            next_stamp: 0,
        }
    }

    fn stamp(&mut self) -> u64 {
        let s = self.next_stamp;
        self.next_stamp += 1;
        s
    }

    /// Pool `block`, evicting the entry closest to expiry if full.
    pub fn insert(&mut self, block: Block, from: Option<PeerId>, now: Instant) -> OrphanInsert {
        let hash = block.hash();
        let expires_at = now.checked_add(self.ttl).unwrap_or(now);

        if let Some(old) = self.entries.get(&hash).map(|e| (e.expires_at, e.stamp)) {
            let stamp = self.stamp();
            self.expiry.remove(&old);
            self.expiry.insert((expires_at, stamp), hash);
            if let Some(entry) = self.entries.get_mut(&hash) {
                entry.expires_at = expires_at;
                entry.stamp = stamp;
            }
            debug!(%hash, "orphan: refreshed");
            return OrphanInsert::Refreshed;
        }

        let evicted = if self.entries.len() >= self.max_entries {
            let oldest = self.expiry.first_key_value().map(|(_, h)| *h);
            if let Some(victim) = oldest {
                self.remove(&victim);
                debug!(%victim, "orphan: evicted to make room");
            }
            oldest
        } else {
            None
        };

        let stamp = self.stamp();
        self.by_prev.entry(block.header.prev_hash).or_default().push(hash);
        self.expiry.insert((expires_at, stamp), hash);
        self.entries.insert(
            hash,
            OrphanEntry {
                block,
                from,
                expires_at,
                stamp,
            },
        );
        debug!(%hash, pool = self.entries.len(), "orphan: added");
        OrphanInsert::Added { evicted }
    }

    pub fn get(&self, hash: &Hash256) -> Option<&OrphanEntry> {
        self.entries.get(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    /// Hashes of pooled blocks whose parent is `prev`, in arrival order.
    pub fn children_of(&self, prev: &Hash256) -> Vec<Hash256> {
        self.by_prev.get(prev).cloned().unwrap_or_default()
    }

    /// Remove and return an entry.
    pub fn remove(&mut self, hash: &Hash256) -> Option<OrphanEntry> {
        let entry = self.entries.remove(hash)?;
        self.expiry.remove(&(entry.expires_at, entry.stamp));
        let prev = entry.block.header.prev_hash;
        if let Some(siblings) = self.by_prev.get_mut(&prev) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.by_prev.remove(&prev);
            }
        }
        Some(entry)
    }

    /// Drop every entry whose expiration is at or before `now`.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<Hash256> {
        let mut purged = Vec::new();
        while let Some((&(expires_at, _), &hash)) = self.expiry.first_key_value() {
            if expires_at > now {
                break;
            }
            self.remove(&hash);
            purged.push(hash);
        }
        if !purged.is_empty() {
            debug!(count = purged.len(), "orphan: purged expired");
        }
        purged
    }

    /// Walk parent links inside the pool and return the earliest pooled
    /// ancestor of `hash` (the block whose parent we are missing).
    pub fn orphan_root(&self, hash: &Hash256) -> Hash256 {
        let mut root = *hash;
        let mut steps = 0;
        while let Some(entry) = self.entries.get(&root) {
            let prev = entry.block.header.prev_hash;
            if !self.entries.contains_key(&prev) || steps > self.entries.len() {
                break;
            }
            root = prev;
            steps += 1;
        }
        root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_prev.clear();
        self.expiry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tarn_core::types::BlockHeader;

    fn block(prev: Hash256, nonce: u32) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash: prev,
                merkle_root: Hash256::ZERO,
                timestamp: 1_580_662_895,
                bits: 0x207f_ffff,
                nonce,
            },
            transactions: vec![],
        }
    }

    fn pool(max: usize) -> OrphanPool {
        OrphanPool::new(max, Duration::from_secs(60))
    }

    // -------------------------------------------------------------------------
    // Insert / lookup
    // -------------------------------------------------------------------------

    #[test]
    fn insert_and_lookup() {
        let mut pool = pool(4);
        let b = block(Hash256([1; 32]), 0);
        let hash = b.hash();
        let from = PeerId::random();
        assert_eq!(pool.insert(b, Some(from), Instant::now()), OrphanInsert::Added { evicted: None });
        assert!(pool.contains(&hash));
        assert_eq!(pool.get(&hash).unwrap().from, Some(from));
        assert_eq!(pool.children_of(&Hash256([1; 32])), vec![hash]);
    }

    #[test]
    fn reinsert_refreshes_expiration() {
        let mut pool = pool(4);
        let now = Instant::now();
        let b = block(Hash256([1; 32]), 0);
        let hash = b.hash();
        pool.insert(b.clone(), None, now);
        let later = now + Duration::from_secs(30);
        assert_eq!(pool.insert(b, None, later), OrphanInsert::Refreshed);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(&hash).unwrap().expires_at, later + Duration::from_secs(60));
        assert_eq!(pool.children_of(&Hash256([1; 32])).len(), 1);
    }

    // -------------------------------------------------------------------------
    // Capacity
    // -------------------------------------------------------------------------

    #[test]
    fn full_pool_evicts_oldest() {
        let mut pool = pool(2);
        let now = Instant::now();
        let a = block(Hash256([1; 32]), 1);
        let b = block(Hash256([2; 32]), 2);
        let c = block(Hash256([3; 32]), 3);
        let (ha, hb) = (a.hash(), b.hash());
        pool.insert(a, None, now);
        pool.insert(b, None, now + Duration::from_secs(1));
        assert_eq!(
            pool.insert(c, None, now + Duration::from_secs(2)),
            OrphanInsert::Added { evicted: Some(ha) }
        );
        assert!(!pool.contains(&ha));
        assert!(pool.contains(&hb));
        assert!(pool.children_of(&Hash256([1; 32])).is_empty());
    }

    #[test]
    fn refreshed_entry_survives_eviction() {
        let mut pool = pool(2);
        let now = Instant::now();
        let a = block(Hash256([1; 32]), 1);
        let b = block(Hash256([2; 32]), 2);
        let (ha, hb) = (a.hash(), b.hash());
        pool.insert(a.clone(), None, now);
        pool.insert(b, None, now + Duration::from_secs(1));
        pool.insert(a, None, now + Duration::from_secs(2));
        let result = pool.insert(block(Hash256([3; 32]), 3), None, now + Duration::from_secs(3));
        assert_eq!(result, OrphanInsert::Added { evicted: Some(hb) });
        assert!(pool.contains(&ha));
    }

    // -------------------------------------------------------------------------
    // Expiry / removal
    // -------------------------------------------------------------------------

    #[test]
    fn huge_ttl_is_capped() {
        let mut pool = OrphanPool::new(4, Duration::MAX);
        let now = Instant::now();
        let b = block(Hash256([1; 32]), 0);
        let hash = b.hash();
        pool.insert(b, None, now);
        assert_eq!(pool.get(&hash).unwrap().expires_at, now + MAX_ORPHAN_TTL);
        assert!(pool.purge_expired(now + MAX_ORPHAN_TTL - Duration::from_secs(1)).is_empty());
        assert_eq!(pool.purge_expired(now + MAX_ORPHAN_TTL), vec![hash]);
    }

    #[test]
    fn purge_removes_only_expired() {
        let mut pool = pool(8);
        let now = Instant::now();
        let a = block(Hash256([1; 32]), 1);
        let b = block(Hash256([2; 32]), 2);
        let (ha, hb) = (a.hash(), b.hash());
        pool.insert(a, None, now);
        pool.insert(b, None, now + Duration::from_secs(30));

        assert!(pool.purge_expired(now + Duration::from_secs(59)).is_empty());
        assert_eq!(pool.purge_expired(now + Duration::from_secs(60)), vec![ha]);
        assert!(pool.contains(&hb));
    }

    #[test]
    fn remove_keeps_siblings() {
        let mut pool = pool(8);
        let parent = Hash256([9; 32]);
        let a = block(parent, 1);
        let b = block(parent, 2);
        let (ha, hb) = (a.hash(), b.hash());
        let now = Instant::now();
        pool.insert(a, None, now);
        pool.insert(b, None, now);
        assert!(pool.remove(&ha).is_some());
        assert_eq!(pool.children_of(&parent), vec![hb]);
        assert!(pool.remove(&ha).is_none());
    }

    #[test]
    fn orphan_root_follows_pooled_parents() {
        let mut pool = pool(8);
        let now = Instant::now();
        let b1 = block(Hash256([7; 32]), 1);
        let b2 = block(b1.hash(), 2);
        let b3 = block(b2.hash(), 3);
        let (h1, h3) = (b1.hash(), b3.hash());
        pool.insert(b3, None, now);
        pool.insert(b2, None, now);
        pool.insert(b1, None, now);
        assert_eq!(pool.orphan_root(&h3), h1);
        assert_eq!(pool.orphan_root(&h1), h1);
    }

    proptest! {
        /// Size never exceeds capacity; an insert into a full pool evicts
        /// exactly one entry, the one with the earliest expiration.
        #[test]
        fn capacity_holds(cap in 1usize..8, nonces in prop::collection::vec(0u32..24, 1..64)) {
            let mut pool = pool(cap);
            let start = Instant::now();
            for (i, nonce) in nonces.into_iter().enumerate() {
                let now = start + Duration::from_secs(i as u64);
                let b = block(Hash256([0xEE; 32]), nonce);
                let hash = b.hash();
                let was_full = pool.len() == cap && !pool.contains(&hash);
                let oldest = pool.expiry.first_key_value().map(|(_, h)| *h);
                let before = pool.len();
                match pool.insert(b, None, now) {
                    OrphanInsert::Added { evicted } => {
                        if was_full {
                            prop_assert_eq!(evicted, oldest);
                            prop_assert_eq!(pool.len(), before);
                        } else {
                            prop_assert_eq!(evicted, None);
                            prop_assert_eq!(pool.len(), before + 1);
                        }
                    }
                    OrphanInsert::Refreshed => prop_assert_eq!(pool.len(), before),
                }
                prop_assert!(pool.len() <= cap);
                prop_assert!(pool.contains(&hash));
            }
        }
    }
}

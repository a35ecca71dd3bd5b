//! Per-peer sync bookkeeping and the global request index.
//!
//! Every outstanding block or transaction request is recorded twice: in the
//! owning peer's `requested_*` set and in a global hash → owner index. The
//! index holds at most one owner per hash, so the same item is never fetched
//! from two peers at once. Clearing a request or deregistering a peer keeps
//! both views consistent.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use libp2p::PeerId;
use tarn_core::types::{Hash256, InvType, InvVect};
use tracing::debug;

use crate::error::RequestError;
use crate::inventory::RecencySet;

/// What a peer told us about itself when it connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Advertises full block service.
    pub full_node: bool,
    /// We dialed the connection.
    pub outbound: bool,
    /// Best height reported in the version handshake.
    pub starting_height: u64,
}

/// Sync state for one connected peer.
#[derive(Debug, Clone)]
pub struct PeerSyncState {
    pub info: PeerInfo,
    /// Eligible to become the sync peer.
    pub is_sync_candidate: bool,
    /// Best height we believe the peer has.
    pub height: u64,
    pub requested_blocks: HashSet<Hash256>,
    pub requested_txns: HashSet<Hash256>,
    /// Inventory the peer already has, for relay suppression.
    pub known_inventory: RecencySet<InvVect>,
    pub misbehavior: u32,
    pub connected_at: Instant,
    /// Registration order; breaks ties between peers connected at the same instant.
    pub sequence: u64,
}

impl PeerSyncState {
    fn requested(&self, kind: InvType) -> &HashSet<Hash256> {
        match kind {
            InvType::Block => &self.requested_blocks,
            InvType::Tx => &self.requested_txns,
        }
    }

    fn requested_mut(&mut self, kind: InvType) -> &mut HashSet<Hash256> {
        match kind {
            InvType::Block => &mut self.requested_blocks,
            InvType::Tx => &mut self.requested_txns,
        }
    }
}

/// Owner of an outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestEntry {
    pub peer: PeerId,
    pub requested_at: Instant,
}

/// Requests released when a peer goes away.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Released {
    pub blocks: Vec<Hash256>,
    pub txns: Vec<Hash256>,
}

/// Registry of connected peers plus the global request index.
#[derive(Debug)]
pub struct PeerTracker {
    peers: HashMap<PeerId, PeerSyncState>,
    block_index: HashMap<Hash256, RequestEntry>,
    tx_index: HashMap<Hash256, RequestEntry>,
    max_known_inventory: usize,
    next_sequence: u64,
}

impl PeerTracker {
    pub fn new(max_known_inventory: usize) -> Self {
        Self {
            peers: HashMap::new(),
            block_index: HashMap::new(),
            tx_index: HashMap::new(),
            max_known_inventory,
            next_sequence: 0,
        }
    }

    fn index(&self, kind: InvType) -> &HashMap<Hash256, RequestEntry> {
        match kind {
            InvType::Block => &self.block_index,
            InvType::Tx => &self.tx_index,
        }
    }

    fn index_mut(&mut self, kind: InvType) -> &mut HashMap<Hash256, RequestEntry> {
        match kind {
            InvType::Block => &mut self.block_index,
            InvType::Tx => &mut self.tx_index,
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register a newly connected peer.
    pub fn register(&mut self, info: PeerInfo, now: Instant) -> Result<&PeerSyncState, RequestError> {
        if self.peers.contains_key(&info.id) {
            return Err(RequestError::AlreadyRegistered(info.id));
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let state = PeerSyncState {
            info,
            is_sync_candidate: info.full_node && info.outbound,
            height: info.starting_height,
            requested_blocks: HashSet::new(),
            requested_txns: HashSet::new(),
            known_inventory: RecencySet::new(self.max_known_inventory),
            misbehavior: 0,
            connected_at: now,
            sequence,
        };
        debug!(peer = %info.id, candidate = state.is_sync_candidate, height = info.starting_height,
            "sync: peer registered");
        Ok(self.peers.entry(info.id).or_insert(state))
    }

    /// Remove a peer and release every request it owned.
    ///
    /// Returns `None` if the peer was not registered.
    pub fn deregister(&mut self, peer: &PeerId) -> Option<Released> {
        let state = self.peers.remove(peer)?;
        let mut released = Released::default();
        for hash in state.requested_blocks {
            self.block_index.remove(&hash);
            released.blocks.push(hash);
        }
        for hash in state.requested_txns {
            self.tx_index.remove(&hash);
            released.txns.push(hash);
        }
        debug!(%peer, blocks = released.blocks.len(), txns = released.txns.len(),
            "sync: peer deregistered");
        Some(released)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerSyncState> {
        self.peers.get(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerSyncState> {
        self.peers.values()
    }

    /// Raise our view of a peer's height. Never lowers it.
    pub fn update_height(&mut self, peer: &PeerId, height: u64) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.height = state.height.max(height);
        }
    }

    /// Replace our view of a peer's height, lowering it if needed.
    ///
    /// Used once a peer's header stream has ended below what it claimed.
    pub fn set_height(&mut self, peer: &PeerId, height: u64) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.height = height;
        }
    }

    /// Add misbehaviour points. Returns the new score, or `None` for unknown peers.
    pub fn add_misbehavior(&mut self, peer: &PeerId, points: u32) -> Option<u32> {
        let state = self.peers.get_mut(peer)?;
        state.misbehavior = state.misbehavior.saturating_add(points);
        Some(state.misbehavior)
    }

    // -------------------------------------------------------------------------
    // Request index
    // -------------------------------------------------------------------------

    /// Record that `hash` was requested from `peer`.
    ///
    /// Fails if another (or the same) peer already owns the hash.
    pub fn record_request(
        &mut self,
        peer: &PeerId,
        kind: InvType,
        hash: Hash256,
        now: Instant,
    ) -> Result<(), RequestError> {
        if let Some(entry) = self.index(kind).get(&hash) {
            return Err(RequestError::AlreadyRequested { hash, owner: entry.peer });
        }
        let state = self
            .peers
            .get_mut(peer)
            .ok_or(RequestError::UnknownPeer(*peer))?;
        state.requested_mut(kind).insert(hash);
        self.index_mut(kind).insert(hash, RequestEntry { peer: *peer, requested_at: now });
        Ok(())
    }

    /// Release the request for `hash`, returning its former owner.
    pub fn clear_request(&mut self, kind: InvType, hash: &Hash256) -> Option<RequestEntry> {
        let entry = self.index_mut(kind).remove(hash)?;
        if let Some(state) = self.peers.get_mut(&entry.peer) {
            state.requested_mut(kind).remove(hash);
        }
        Some(entry)
    }

    pub fn owner(&self, kind: InvType, hash: &Hash256) -> Option<&RequestEntry> {
        self.index(kind).get(hash)
    }

    pub fn is_requested(&self, kind: InvType, hash: &Hash256) -> bool {
        self.index(kind).contains_key(hash)
    }

    /// Number of outstanding requests of `kind` owned by `peer`.
    pub fn requests_of(&self, peer: &PeerId, kind: InvType) -> usize {
        self.peers.get(peer).map_or(0, |s| s.requested(kind).len())
    }

    /// Total outstanding requests of `kind`.
    pub fn outstanding(&self, kind: InvType) -> usize {
        self.index(kind).len()
    }

    /// Requests older than `timeout`, as `(kind, hash, owner)`.
    pub fn expired_requests(&self, now: Instant, timeout: Duration) -> Vec<(InvType, Hash256, PeerId)> {
        let expired = |kind: InvType, index: &HashMap<Hash256, RequestEntry>| {
            index
                .iter()
                .filter(move |(_, e)| now.saturating_duration_since(e.requested_at) > timeout)
                .map(move |(h, e)| (kind, *h, e.peer))
                .collect::<Vec<_>>()
        };
        let mut out = expired(InvType::Block, &self.block_index);
        out.extend(expired(InvType::Tx, &self.tx_index));
        out
    }

    // -------------------------------------------------------------------------
    // Known inventory
    // -------------------------------------------------------------------------

    /// Mark `inv` as known to `peer`. Returns `true` if it was not known before.
    pub fn mark_known(&mut self, peer: &PeerId, inv: InvVect) -> bool {
        self.peers
            .get_mut(peer)
            .is_some_and(|s| s.known_inventory.insert(inv))
    }

    pub fn knows(&self, peer: &PeerId, inv: &InvVect) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|s| s.known_inventory.contains(inv))
    }

    /// Peers that do not yet know `inv`, excluding `exclude`. Each returned
    /// peer is marked as knowing it.
    pub fn relay_targets(&mut self, inv: InvVect, exclude: Option<&PeerId>) -> Vec<PeerId> {
        let mut targets: Vec<(u64, PeerId)> = self
            .peers
            .values_mut()
            .filter_map(|s| {
                let fresh = Some(&s.info.id) != exclude && s.known_inventory.insert(inv);
                fresh.then_some((s.sequence, s.info.id))
            })
            .collect();
        targets.sort_unstable_by_key(|(seq, _)| *seq);
        targets.into_iter().map(|(_, id)| id).collect()
    }

    /// Check that every index entry is mirrored in its owner's set and vice versa.
    pub fn is_consistent(&self) -> bool {
        let forward = [InvType::Block, InvType::Tx].into_iter().all(|kind| {
            self.index(kind).iter().all(|(hash, entry)| {
                self.peers
                    .get(&entry.peer)
                    .is_some_and(|s| s.requested(kind).contains(hash))
            })
        });
        let backward = self.peers.values().all(|s| {
            [InvType::Block, InvType::Tx].into_iter().all(|kind| {
                s.requested(kind)
                    .iter()
                    .all(|h| self.index(kind).get(h).is_some_and(|e| e.peer == s.info.id))
            })
        });
        forward && backward
    }
}

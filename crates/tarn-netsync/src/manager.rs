//! Chain synchronization state machine.
//!
//! [`SyncManager`] owns all sync state (peer tracker, request index, orphan
//! pool, header download) and is driven one [`SyncEvent`] at a time. Each
//! call to [`SyncManager::handle`] returns the [`SyncAction`]s the transport
//! should carry out. The manager never performs I/O itself and never waits
//! for a reply: responses come back as later events.
//!
//! # Modes
//!
//! ```text
//! Idle ──▶ HeadersFirst ──▶ BlocksSync ──▶ Synced
//!   ▲            ▲               │            │
//!   └────────────┴── sync peer lost / reselect ┘
//! ```
//!
//! Block validation runs synchronously inside [`handle`](SyncManager::handle).
//! Blocks that arrive before their parent wait in the orphan pool and are
//! connected when the parent is, so the chain always commits in height order.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use libp2p::PeerId;
use tarn_core::error::BlockError;
use tarn_core::types::{Block, BlockHeader, Hash256, InvType, InvVect, Transaction};
use tracing::{debug, info, warn};

use crate::config::{SyncConfig, SyncContext};
use crate::error::DisconnectReason;
use crate::header_sync::HeaderSync;
use crate::inventory::RecencySet;
use crate::notify::NotifyBridge;
use crate::orphan::{OrphanInsert, OrphanPool};
use crate::peer::{PeerInfo, PeerTracker};
use crate::traits::{BlockVerdict, ChainTip, ChainValidator, FeeEstimator, TxMempool};

/// Misbehaviour points for delivering a block nobody asked for.
pub const UNSOLICITED_BLOCK_PENALTY: u32 = 20;
/// Misbehaviour points for delivering a transaction nobody asked for.
pub const UNSOLICITED_TX_PENALTY: u32 = 10;

/// Current phase of chain synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncMode {
    /// No sync candidate is connected.
    Idle,
    /// Downloading headers from the sync peer.
    HeadersFirst,
    /// Downloading block bodies for accepted headers.
    BlocksSync,
    /// Caught up with every candidate; steady-state relay.
    Synced,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::HeadersFirst => "headers-first",
            Self::BlocksSync => "blocks-sync",
            Self::Synced => "synced",
        };
        f.write_str(name)
    }
}

/// Input to the state machine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A peer completed its handshake.
    NewPeer(PeerInfo),
    /// A peer disconnected.
    DonePeer(PeerId),
    Headers { peer: PeerId, headers: Vec<BlockHeader> },
    Block { peer: PeerId, block: Block },
    Tx { peer: PeerId, tx: Transaction },
    Inv { peer: PeerId, inventory: Vec<InvVect> },
    /// The peer does not have items we asked for.
    NotFound { peer: PeerId, inventory: Vec<InvVect> },
    /// Stall watchdog and request timeout sweep.
    StallTick,
    /// Expired orphan sweep.
    OrphanSweep,
}

/// Output of the state machine, carried out by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Ask for headers following `locator`, up to `stop_hash` (zero for as many as allowed).
    RequestHeaders { peer: PeerId, locator: Vec<Hash256>, stop_hash: Hash256 },
    /// Ask for full blocks.
    RequestBlocks { peer: PeerId, hashes: Vec<Hash256> },
    /// Ask for transactions.
    RequestTransactions { peer: PeerId, hashes: Vec<Hash256> },
    /// Ask for an inventory of blocks following `locator`, up to `stop_hash`.
    RequestBlockInventory { peer: PeerId, locator: Vec<Hash256>, stop_hash: Hash256 },
    Disconnect { peer: PeerId, reason: DisconnectReason },
}

impl SyncAction {
    pub fn peer(&self) -> &PeerId {
        match self {
            Self::RequestHeaders { peer, .. }
            | Self::RequestBlocks { peer, .. }
            | Self::RequestTransactions { peer, .. }
            | Self::RequestBlockInventory { peer, .. }
            | Self::Disconnect { peer, .. } => peer,
        }
    }
}

/// Counters for every decision the manager makes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub peers_registered: u64,
    /// Disconnects keyed by [`DisconnectReason::kind`].
    pub disconnects: BTreeMap<&'static str, u64>,
    pub headers_accepted: u64,
    pub blocks_accepted: u64,
    pub blocks_rejected: u64,
    pub orphans_added: u64,
    pub orphans_evicted: u64,
    pub orphans_expired: u64,
    pub orphans_connected: u64,
    pub txns_accepted: u64,
    pub txns_rejected: u64,
    /// Announcements not fetched because another peer already owns the request.
    pub inv_suppressed: u64,
}

impl SyncStats {
    pub fn disconnects_for(&self, kind: &str) -> u64 {
        self.disconnects.get(kind).copied().unwrap_or(0)
    }

    pub fn total_disconnects(&self) -> u64 {
        self.disconnects.values().sum()
    }
}

/// The sync manager. See the module docs.
pub struct SyncManager {
    chain: Arc<dyn ChainValidator>,
    mempool: Arc<dyn TxMempool>,
    fee_estimator: Option<Arc<dyn FeeEstimator>>,
    bridge: NotifyBridge,
    config: SyncConfig,
    peers: PeerTracker,
    orphans: OrphanPool,
    headers: HeaderSync,
    rejected_txns: RecencySet<Hash256>,
    /// Peers that fed us a bad chain; never sync candidates again this session.
    rejected_peers: HashSet<PeerId>,
    /// Download blocks each peer has answered `notfound` for; not asked again.
    not_found: HashMap<Hash256, HashSet<PeerId>>,
    mode: SyncMode,
    sync_peer: Option<PeerId>,
    best: ChainTip,
    last_progress: Instant,
    shutdown: bool,
    stats: SyncStats,
}

impl SyncManager {
    pub fn new(ctx: SyncContext, now: Instant) -> Self {
        let best = ctx.chain.best_tip();
        let mut headers = HeaderSync::new(ctx.chain_params.clone(), ctx.config.checkpoints_enabled());
        headers.begin(best);
        Self {
            bridge: NotifyBridge::new(ctx.notifier),
            peers: PeerTracker::new(ctx.config.max_known_inventory),
            orphans: OrphanPool::new(ctx.config.max_orphan_blocks, ctx.config.orphan_ttl),
            rejected_txns: RecencySet::new(ctx.config.max_rejected_txns),
            rejected_peers: HashSet::new(),
            not_found: HashMap::new(),
            chain: ctx.chain,
            mempool: ctx.mempool,
            fee_estimator: ctx.fee_estimator,
            config: ctx.config,
            headers,
            mode: SyncMode::Idle,
            sync_peer: None,
            best,
            last_progress: now,
            shutdown: false,
            stats: SyncStats::default(),
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn sync_peer(&self) -> Option<PeerId> {
        self.sync_peer
    }

    /// Whether we believe we are caught up with the network.
    pub fn is_current(&self) -> bool {
        self.mode == SyncMode::Synced
    }

    /// Best chain tip as of the last event.
    pub fn best(&self) -> ChainTip {
        self.best
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn peers(&self) -> &PeerTracker {
        &self.peers
    }

    pub fn orphans(&self) -> &OrphanPool {
        &self.orphans
    }

    pub fn header_sync(&self) -> &HeaderSync {
        &self.headers
    }

    pub fn is_rejected(&self, peer: &PeerId) -> bool {
        self.rejected_peers.contains(peer)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown
    }

    // -------------------------------------------------------------------------
    // Entry points
    // -------------------------------------------------------------------------

    /// Process one event and return the resulting actions.
    pub fn handle(&mut self, event: SyncEvent, now: Instant) -> Vec<SyncAction> {
        let mut out = Vec::new();
        if self.shutdown {
            debug!("sync: ignoring event after shutdown");
            return out;
        }
        match event {
            SyncEvent::NewPeer(info) => self.on_new_peer(info, now, &mut out),
            SyncEvent::DonePeer(peer) => self.on_done_peer(peer, now, &mut out),
            SyncEvent::Headers { peer, headers } => self.on_headers(peer, headers, now, &mut out),
            SyncEvent::Block { peer, block } => self.on_block(peer, block, now, &mut out),
            SyncEvent::Tx { peer, tx } => self.on_tx(peer, tx, now, &mut out),
            SyncEvent::Inv { peer, inventory } => self.on_inv(peer, inventory, now, &mut out),
            SyncEvent::NotFound { peer, inventory } => self.on_not_found(peer, inventory, now, &mut out),
            SyncEvent::StallTick => self.on_stall_tick(now, &mut out),
            SyncEvent::OrphanSweep => self.on_orphan_sweep(now, &mut out),
        }
        out
    }

    /// Submit a locally produced block (e.g. mined or from RPC).
    pub fn process_local_block(&mut self, block: Block, now: Instant) -> (BlockVerdict, Vec<SyncAction>) {
        let mut out = Vec::new();
        self.headers.block_received(&block.hash());
        let verdict = self.submit_block(block, None, now, &mut out);
        self.request_blocks(now, &mut out);
        self.check_realized(now, &mut out);
        (verdict, out)
    }

    /// Stop processing events and release all peer state.
    pub fn shutdown(&mut self) {
        if self.shutdown {
            return;
        }
        self.shutdown = true;
        let ids: Vec<PeerId> = self.peers.iter().map(|s| s.info.id).collect();
        for peer in &ids {
            self.peers.deregister(peer);
        }
        self.orphans.clear();
        self.sync_peer = None;
        self.headers.begin(self.best);
        self.set_mode(SyncMode::Idle);
        info!(peers = ids.len(), "sync: manager shut down");
    }

    // -------------------------------------------------------------------------
    // Peer lifecycle
    // -------------------------------------------------------------------------

    fn on_new_peer(&mut self, info: PeerInfo, now: Instant, out: &mut Vec<SyncAction>) {
        if self.config.max_peers > 0 && self.peers.len() >= self.config.max_peers {
            self.disconnect(info.id, DisconnectReason::TooManyPeers, now, out);
            return;
        }
        if let Err(err) = self.peers.register(info, now) {
            warn!(%err, "sync: ignoring peer registration");
            return;
        }
        self.stats.peers_registered += 1;
        info!(peer = %info.id, height = info.starting_height, outbound = info.outbound, "sync: new peer");

        if self.sync_peer.is_none() {
            self.start_sync(now, out);
        }
    }

    fn on_done_peer(&mut self, peer: PeerId, now: Instant, out: &mut Vec<SyncAction>) {
        let Some(released) = self.peers.deregister(&peer) else {
            debug!(%peer, "sync: done for unknown peer");
            return;
        };
        info!(%peer, "sync: peer gone");
        let mut released_blocks = false;
        for hash in &released.blocks {
            released_blocks |= self.headers.release(hash);
        }
        let lost_sync = self.sync_peer == Some(peer);
        if lost_sync {
            self.sync_peer = None;
        }
        self.after_peer_loss(lost_sync, released_blocks, now, out);
    }

    /// Pick a sync peer if any candidate is ahead of us.
    ///
    /// Candidates are outbound full nodes not rejected this session. The
    /// highest reported height wins; ties go to the earliest connection.
    fn start_sync(&mut self, now: Instant, out: &mut Vec<SyncAction>) {
        self.best = self.chain.best_tip();
        self.headers.begin(self.best);
        self.not_found.clear();

        let mut any_candidate = false;
        let mut chosen: Option<(u64, Instant, u64, PeerId)> = None;
        for state in self.peers.iter() {
            if !state.is_sync_candidate || self.rejected_peers.contains(&state.info.id) {
                continue;
            }
            any_candidate = true;
            if state.height <= self.best.height {
                continue;
            }
            let better = match chosen {
                None => true,
                Some((height, at, seq, _)) => {
                    state.height > height
                        || (state.height == height
                            && (state.connected_at, state.sequence) < (at, seq))
                }
            };
            if better {
                chosen = Some((state.height, state.connected_at, state.sequence, state.info.id));
            }
        }

        match chosen {
            Some((height, _, _, peer)) => {
                self.sync_peer = Some(peer);
                self.last_progress = now;
                self.set_mode(SyncMode::HeadersFirst);
                info!(%peer, peer_height = height, our_height = self.best.height,
                    "sync: selected sync peer");
                out.push(SyncAction::RequestHeaders {
                    peer,
                    locator: self.chain.block_locator(),
                    stop_hash: Hash256::ZERO,
                });
            }
            None if any_candidate => self.set_mode(SyncMode::Synced),
            None => self.set_mode(SyncMode::Idle),
        }
    }

    fn set_mode(&mut self, mode: SyncMode) {
        if self.mode != mode {
            info!(from = %self.mode, to = %mode, height = self.best.height, "sync: mode change");
            self.mode = mode;
        }
    }

    fn is_syncing(&self) -> bool {
        matches!(self.mode, SyncMode::HeadersFirst | SyncMode::BlocksSync)
    }

    // -------------------------------------------------------------------------
    // Disconnects
    // -------------------------------------------------------------------------

    fn disconnect(&mut self, peer: PeerId, reason: DisconnectReason, now: Instant, out: &mut Vec<SyncAction>) {
        self.disconnect_many(vec![(peer, reason)], now, out);
    }

    /// Disconnect a set of peers, then reselect or refill once.
    fn disconnect_many(
        &mut self,
        victims: Vec<(PeerId, DisconnectReason)>,
        now: Instant,
        out: &mut Vec<SyncAction>,
    ) {
        let mut seen = HashSet::new();
        let mut lost_sync = false;
        let mut released_blocks = false;
        for (peer, reason) in victims {
            if !seen.insert(peer) {
                continue;
            }
            warn!(%peer, %reason, "sync: disconnecting peer");
            *self.stats.disconnects.entry(reason.kind()).or_default() += 1;
            out.push(SyncAction::Disconnect { peer, reason });

            if let Some(released) = self.peers.deregister(&peer) {
                for hash in &released.blocks {
                    released_blocks |= self.headers.release(hash);
                }
            }
            if self.sync_peer == Some(peer) {
                self.sync_peer = None;
                lost_sync = true;
            }
        }
        self.after_peer_loss(lost_sync, released_blocks, now, out);
    }

    fn after_peer_loss(&mut self, lost_sync: bool, released_blocks: bool, now: Instant, out: &mut Vec<SyncAction>) {
        if lost_sync {
            info!(height = self.best.height, "sync: lost sync peer, reselecting");
            self.start_sync(now, out);
        } else if released_blocks {
            self.request_blocks(now, out);
        }
    }

    /// Disconnect the sync peer and bar it from candidacy for this session.
    fn reject_sync_peer(&mut self, peer: PeerId, reason: DisconnectReason, now: Instant, out: &mut Vec<SyncAction>) {
        self.rejected_peers.insert(peer);
        self.disconnect(peer, reason, now, out);
    }

    fn penalize(&mut self, peer: PeerId, points: u32, now: Instant, out: &mut Vec<SyncAction>) {
        let Some(score) = self.peers.add_misbehavior(&peer, points) else {
            return;
        };
        debug!(%peer, score, points, "sync: misbehaviour recorded");
        if score >= self.config.misbehavior_threshold {
            self.disconnect(peer, DisconnectReason::Misbehavior(score), now, out);
        }
    }

    // -------------------------------------------------------------------------
    // Headers and block download
    // -------------------------------------------------------------------------

    fn on_headers(&mut self, peer: PeerId, headers: Vec<BlockHeader>, now: Instant, out: &mut Vec<SyncAction>) {
        if self.sync_peer != Some(peer) || self.mode != SyncMode::HeadersFirst {
            if self.peers.contains(&peer) {
                self.disconnect(peer, DisconnectReason::UnsolicitedHeaders, now, out);
            }
            return;
        }

        let outcome = match self.headers.process_batch(&headers) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.reject_sync_peer(peer, err.into(), now, out);
                return;
            }
        };

        self.stats.headers_accepted += outcome.accepted as u64;
        if outcome.accepted > 0 {
            self.last_progress = now;
        }
        if !outcome.complete {
            out.push(SyncAction::RequestHeaders {
                peer,
                locator: vec![self.headers.tip().hash],
                stop_hash: Hash256::ZERO,
            });
            return;
        }

        info!(%peer, tip = outcome.tip_height, blocks = self.headers.pending_len(),
            "sync: header download complete");
        // The peer has nothing past this tip, whatever height it announced.
        self.peers.set_height(&peer, outcome.tip_height);
        self.set_mode(SyncMode::BlocksSync);
        self.request_blocks(now, out);
        self.check_realized(now, out);
    }

    /// Fill the block download window in ascending height order.
    ///
    /// The sync peer is asked first; other candidates that reported a height
    /// at or above a block's height share the load round-robin.
    fn request_blocks(&mut self, now: Instant, out: &mut Vec<SyncAction>) {
        if self.mode != SyncMode::BlocksSync {
            return;
        }
        let Some(sync_peer) = self.sync_peer else {
            return;
        };

        let mut helpers: Vec<(u64, PeerId, u64)> = self
            .peers
            .iter()
            .filter(|s| s.info.id != sync_peer && s.is_sync_candidate)
            .filter(|s| !self.rejected_peers.contains(&s.info.id))
            .map(|s| (s.sequence, s.info.id, s.height))
            .collect();
        helpers.sort_unstable_by_key(|(seq, _, _)| *seq);
        let mut order = vec![(sync_peer, u64::MAX)];
        order.extend(helpers.into_iter().map(|(_, id, height)| (id, height)));
        let mut batches: Vec<Vec<Hash256>> = vec![Vec::new(); order.len()];

        let mut cursor = 0;
        while self.headers.in_flight_len() < self.config.max_blocks_in_flight {
            let Some((height, hash)) = self.headers.peek_pending() else {
                break;
            };
            if self.chain.have_block(&hash) {
                self.headers.block_connected(&hash);
                continue;
            }
            if self.peers.is_requested(InvType::Block, &hash) {
                self.headers.mark_requested(&hash);
                continue;
            }

            let mut assigned = false;
            for step in 0..order.len() {
                let idx = (cursor + step) % order.len();
                let (peer, peer_height) = order[idx];
                if peer_height < height
                    || self.peers.requests_of(&peer, InvType::Block) >= self.config.max_blocks_in_flight_per_peer
                    || self.not_found.get(&hash).is_some_and(|peers| peers.contains(&peer))
                {
                    continue;
                }
                if self.peers.record_request(&peer, InvType::Block, hash, now).is_err() {
                    continue;
                }
                self.headers.mark_requested(&hash);
                batches[idx].push(hash);
                cursor = idx + 1;
                assigned = true;
                break;
            }
            if !assigned {
                break;
            }
        }

        for ((peer, _), hashes) in order.into_iter().zip(batches) {
            if hashes.is_empty() {
                continue;
            }
            debug!(%peer, count = hashes.len(), "sync: requesting blocks");
            out.push(SyncAction::RequestBlocks { peer, hashes });
        }
    }

    fn check_realized(&mut self, now: Instant, out: &mut Vec<SyncAction>) {
        if self.mode == SyncMode::BlocksSync && self.headers.is_realized() {
            self.finish_sync(now, out);
        }
    }

    /// The header set is fully connected: release the sync peer and look for
    /// anyone still ahead.
    fn finish_sync(&mut self, now: Instant, out: &mut Vec<SyncAction>) {
        self.best = self.chain.best_tip();
        if let Some(peer) = self.sync_peer.take() {
            self.peers.update_height(&peer, self.best.height);
            info!(%peer, height = self.best.height, hash = %self.best.hash, "sync: chain synchronized");
        }
        self.set_mode(SyncMode::Synced);
        self.start_sync(now, out);
    }

    // -------------------------------------------------------------------------
    // Blocks
    // -------------------------------------------------------------------------

    fn on_block(&mut self, peer: PeerId, block: Block, now: Instant, out: &mut Vec<SyncAction>) {
        let hash = block.hash();
        let solicited = self
            .peers
            .owner(InvType::Block, &hash)
            .is_some_and(|e| e.peer == peer);
        if !solicited {
            debug!(%peer, %hash, "sync: unsolicited block");
            self.penalize(peer, UNSOLICITED_BLOCK_PENALTY, now, out);
            return;
        }
        self.peers.clear_request(InvType::Block, &hash);
        self.peers.mark_known(&peer, InvVect::block(hash));
        self.headers.block_received(&hash);
        self.not_found.remove(&hash);

        self.submit_block(block, Some(peer), now, out);
        self.request_blocks(now, out);
        self.check_realized(now, out);
    }

    /// Hand a block to the chain engine and react to the verdict.
    fn submit_block(
        &mut self,
        block: Block,
        source: Option<PeerId>,
        now: Instant,
        out: &mut Vec<SyncAction>,
    ) -> BlockVerdict {
        let hash = block.hash();
        let in_download = self.headers.contains(&hash);
        let verdict = self.chain.process_block(&block, source.as_ref());
        match &verdict {
            BlockVerdict::Accepted { height } => {
                debug!(%hash, height, "sync: block accepted");
                self.stats.blocks_accepted += 1;
                self.last_progress = now;
                self.headers.block_connected(&hash);
                self.block_accepted(&block, *height, source.as_ref());
                self.connect_orphans(hash, now, out);
            }
            BlockVerdict::Orphan => self.pool_orphan(block, source, in_download, now, out),
            BlockVerdict::Invalid(err) => {
                self.stats.blocks_rejected += 1;
                warn!(%hash, %err, "sync: block rejected");
                self.invalid_block(hash, source, err.clone(), in_download, now, out);
            }
            BlockVerdict::Duplicate => {
                debug!(%hash, "sync: duplicate block");
                self.headers.block_connected(&hash);
            }
        }
        verdict
    }

    /// Side effects of a newly connected block.
    fn block_accepted(&mut self, block: &Block, height: u64, source: Option<&PeerId>) {
        let hash = block.hash();
        self.best = self.chain.best_tip();

        let unlocked = self.mempool.block_connected(block);
        if !unlocked.is_empty() {
            if let Some(fee) = &self.fee_estimator {
                unlocked.iter().for_each(|d| fee.observe_transaction(d));
            }
            self.bridge.announce_transactions(&mut self.peers, &unlocked, None);
        }
        self.bridge.transactions_confirmed(block);
        if let Some(fee) = &self.fee_estimator {
            fee.register_block(block, height);
        }

        if let Some(peer) = source {
            self.peers.update_height(peer, height);
        }
        if !self.is_syncing() {
            self.bridge.update_peer_heights(&hash, height, source);
        }
        if self.mode == SyncMode::Synced {
            let relayed = self.bridge.relay_block(&mut self.peers, &block.header, source);
            debug!(%hash, relayed, "sync: relayed block");
        }
    }

    fn pool_orphan(
        &mut self,
        block: Block,
        source: Option<PeerId>,
        in_download: bool,
        now: Instant,
        out: &mut Vec<SyncAction>,
    ) {
        let hash = block.hash();
        let prev = block.header.prev_hash;
        if let OrphanInsert::Added { evicted } = self.orphans.insert(block, source, now) {
            self.stats.orphans_added += 1;
            info!(%hash, %prev, pool = self.orphans.len(), "orphan: pooled block");
            if let Some(victim) = evicted {
                self.stats.orphans_evicted += 1;
                if self.headers.release(&victim) {
                    self.request_blocks(now, out);
                }
            }
        }

        // Blocks from the header download wait for their parent, which is
        // already queued.
        if in_download {
            return;
        }
        let Some(peer) = source.filter(|p| self.peers.contains(p)) else {
            return;
        };
        let root = self.orphans.orphan_root(&hash);
        debug!(%peer, %root, "orphan: requesting missing ancestors");
        out.push(SyncAction::RequestBlockInventory {
            peer,
            locator: self.chain.block_locator(),
            stop_hash: root,
        });
    }

    /// Connect pooled descendants of `parent`, transitively.
    fn connect_orphans(&mut self, parent: Hash256, now: Instant, out: &mut Vec<SyncAction>) {
        let mut queue = VecDeque::from([parent]);
        while let Some(parent) = queue.pop_front() {
            for child in self.orphans.children_of(&parent) {
                let Some(entry) = self.orphans.remove(&child) else {
                    continue;
                };
                match self.chain.process_block(&entry.block, entry.from.as_ref()) {
                    BlockVerdict::Accepted { height } => {
                        info!(hash = %child, height, "orphan: connected");
                        self.stats.orphans_connected += 1;
                        self.stats.blocks_accepted += 1;
                        self.last_progress = now;
                        self.headers.block_connected(&child);
                        self.block_accepted(&entry.block, height, entry.from.as_ref());
                        queue.push_back(child);
                    }
                    BlockVerdict::Orphan => {
                        warn!(hash = %child, "orphan: still unconnected after parent accepted");
                        self.orphans.insert(entry.block, entry.from, now);
                    }
                    BlockVerdict::Invalid(err) => {
                        self.stats.blocks_rejected += 1;
                        warn!(hash = %child, %err, "orphan: rejected");
                        let in_download = self.headers.contains(&child);
                        self.invalid_block(child, entry.from, err, in_download, now, out);
                    }
                    BlockVerdict::Duplicate => {
                        self.headers.block_connected(&child);
                    }
                }
            }
        }
    }

    /// Disconnect the sender of an invalid block. If the block came from the
    /// header download, the sync peer that supplied those headers is rejected
    /// too.
    fn invalid_block(
        &mut self,
        hash: Hash256,
        source: Option<PeerId>,
        err: BlockError,
        in_download: bool,
        now: Instant,
        out: &mut Vec<SyncAction>,
    ) {
        let mut victims = Vec::new();
        if let Some(peer) = source.filter(|p| self.peers.contains(p)) {
            victims.push((peer, DisconnectReason::InvalidBlock(err)));
        }
        if in_download {
            if let Some(sync_peer) = self.sync_peer {
                self.rejected_peers.insert(sync_peer);
                victims.push((sync_peer, DisconnectReason::InvalidChain(hash)));
            }
        }
        self.disconnect_many(victims, now, out);
    }

    // -------------------------------------------------------------------------
    // Transactions and inventory
    // -------------------------------------------------------------------------

    fn on_tx(&mut self, peer: PeerId, tx: Transaction, now: Instant, out: &mut Vec<SyncAction>) {
        let txid = tx.txid();
        let solicited = self
            .peers
            .owner(InvType::Tx, &txid)
            .is_some_and(|e| e.peer == peer);
        if !solicited {
            debug!(%peer, %txid, "sync: unsolicited transaction");
            self.penalize(peer, UNSOLICITED_TX_PENALTY, now, out);
            return;
        }
        self.peers.clear_request(InvType::Tx, &txid);
        self.peers.mark_known(&peer, InvVect::tx(txid));
        if self.rejected_txns.contains(&txid) {
            debug!(%peer, %txid, "sync: ignoring previously rejected transaction");
            return;
        }

        match self.mempool.process_transaction(&tx, Some(&peer)) {
            Ok(accepted) => {
                self.stats.txns_accepted += 1;
                debug!(%peer, %txid, unlocked = accepted.len().saturating_sub(1), "sync: transaction accepted");
                if let Some(fee) = &self.fee_estimator {
                    accepted.iter().for_each(|d| fee.observe_transaction(d));
                }
                self.bridge.announce_transactions(&mut self.peers, &accepted, Some(&peer));
            }
            Err(reason) => {
                self.stats.txns_rejected += 1;
                self.rejected_txns.insert(txid);
                debug!(%peer, %txid, %reason, "sync: transaction rejected");
            }
        }
    }

    fn on_inv(&mut self, peer: PeerId, inventory: Vec<InvVect>, now: Instant, out: &mut Vec<SyncAction>) {
        if !self.peers.contains(&peer) {
            debug!(%peer, "sync: inventory from unknown peer");
            return;
        }
        for inv in &inventory {
            self.peers.mark_known(&peer, *inv);
        }
        let syncing = self.is_syncing();
        if syncing && self.sync_peer != Some(peer) {
            debug!(%peer, count = inventory.len(), "sync: ignoring inventory from non-sync peer");
            return;
        }

        let mut blocks = Vec::new();
        let mut txns = Vec::new();
        for inv in inventory {
            match inv.kind {
                InvType::Tx => {
                    if self.rejected_txns.contains(&inv.hash) || self.mempool.have_transaction(&inv.hash) {
                        continue;
                    }
                    if self.peers.is_requested(InvType::Tx, &inv.hash) {
                        self.stats.inv_suppressed += 1;
                        debug!(%peer, hash = %inv.hash, "sync: transaction already requested");
                        continue;
                    }
                    if self.peers.requests_of(&peer, InvType::Tx) >= self.config.max_requested_txns_per_peer {
                        debug!(%peer, "sync: transaction request cap reached");
                        continue;
                    }
                    if self.peers.record_request(&peer, InvType::Tx, inv.hash, now).is_ok() {
                        txns.push(inv.hash);
                    }
                }
                InvType::Block => {
                    // Block download during initial sync is driven by headers.
                    if syncing || self.chain.have_block(&inv.hash) {
                        continue;
                    }
                    if self.orphans.contains(&inv.hash) {
                        let root = self.orphans.orphan_root(&inv.hash);
                        out.push(SyncAction::RequestBlockInventory {
                            peer,
                            locator: self.chain.block_locator(),
                            stop_hash: root,
                        });
                        continue;
                    }
                    if self.peers.is_requested(InvType::Block, &inv.hash) {
                        self.stats.inv_suppressed += 1;
                        continue;
                    }
                    if self.peers.requests_of(&peer, InvType::Block) >= self.config.max_requested_blocks_per_peer {
                        debug!(%peer, "sync: block request cap reached");
                        continue;
                    }
                    if self.peers.record_request(&peer, InvType::Block, inv.hash, now).is_ok() {
                        blocks.push(inv.hash);
                    }
                }
            }
        }

        if !blocks.is_empty() {
            out.push(SyncAction::RequestBlocks { peer, hashes: blocks });
        }
        if !txns.is_empty() {
            out.push(SyncAction::RequestTransactions { peer, hashes: txns });
        }
    }

    fn on_not_found(&mut self, peer: PeerId, inventory: Vec<InvVect>, now: Instant, out: &mut Vec<SyncAction>) {
        let mut released_blocks = false;
        for inv in inventory {
            let owned = self
                .peers
                .owner(inv.kind, &inv.hash)
                .is_some_and(|e| e.peer == peer);
            if !owned {
                continue;
            }
            self.peers.clear_request(inv.kind, &inv.hash);
            debug!(%peer, %inv, "sync: peer does not have requested item");
            if inv.kind == InvType::Block && self.headers.release(&inv.hash) {
                self.not_found.entry(inv.hash).or_default().insert(peer);
                released_blocks = true;
            }
        }
        if released_blocks {
            self.request_blocks(now, out);
        }
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    fn on_stall_tick(&mut self, now: Instant, out: &mut Vec<SyncAction>) {
        let mut victims: Vec<(PeerId, DisconnectReason)> = Vec::new();
        let mut expired = self.peers.expired_requests(now, self.config.request_timeout);
        expired.sort_unstable_by_key(|(_, hash, _)| *hash);
        for (kind, hash, peer) in expired {
            if victims.iter().any(|(p, _)| *p == peer) {
                continue;
            }
            warn!(%peer, %hash, ?kind, "sync: request timed out");
            victims.push((peer, DisconnectReason::RequestTimeout(hash)));
        }

        if let Some(sync_peer) = self.sync_peer {
            let idle_for = now.saturating_duration_since(self.last_progress);
            if self.is_syncing() && idle_for > self.config.stall_timeout {
                warn!(peer = %sync_peer, idle_secs = idle_for.as_secs(), "sync: sync peer stalled");
                victims.push((sync_peer, DisconnectReason::Stalled));
            }
        }

        if !victims.is_empty() {
            self.disconnect_many(victims, now, out);
        }
    }

    fn on_orphan_sweep(&mut self, now: Instant, out: &mut Vec<SyncAction>) {
        let expired = self.orphans.purge_expired(now);
        if expired.is_empty() {
            return;
        }
        self.stats.orphans_expired += expired.len() as u64;
        info!(count = expired.len(), pool = self.orphans.len(), "orphan: expired blocks dropped");
        let mut released = false;
        for hash in &expired {
            released |= self.headers.release(hash);
        }
        if released {
            self.request_blocks(now, out);
        }
    }
}

impl fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncManager")
            .field("mode", &self.mode)
            .field("sync_peer", &self.sync_peer)
            .field("best", &self.best)
            .field("peers", &self.peers.len())
            .field("orphans", &self.orphans.len())
            .finish()
    }
}

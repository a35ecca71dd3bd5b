//! Shared test helpers: in-memory collaborators, chain builders and a
//! manager harness.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use libp2p::PeerId;
use parking_lot::Mutex;
use tarn_core::chaincfg::ChainParams;
use tarn_core::error::{BlockError, TxRejectReason};
use tarn_core::mempool::TxDesc;
use tarn_core::merkle::merkle_root;
use tarn_core::pow::{check_proof_of_work, mine_header};
use tarn_core::types::{Block, BlockHeader, Hash256, InvVect, OutPoint, Transaction, TxInput, TxOutput};
use tarn_netsync::{
    BlockVerdict, ChainTip, ChainValidator, FeeEstimator, PeerDispatcher, PeerInfo, PeerNotifier, RelayPayload,
    SyncAction, SyncConfig, SyncContext, SyncEvent, SyncManager, TxMempool,
};
use tracing_subscriber::EnvFilter;

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Chain builders
// ---------------------------------------------------------------------------

/// Coinbase with a unique script per `(tag, height)`, so forks built with
/// different tags never share block hashes.
pub fn make_coinbase(tag: u8, height: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature_script: [vec![tag], height.to_le_bytes().to_vec()].concat(),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOutput { value: 50, pk_script: vec![0x51] }],
        lock_time: 0,
    }
}

/// Transaction spending a made-up outpoint derived from `seed`.
pub fn make_tx(seed: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint { txid: Hash256([seed; 32]), index: 0 },
            signature_script: vec![seed],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOutput { value: 1_000, pk_script: vec![0x51] }],
        lock_time: 0,
    }
}

/// Regtest proof-of-work limit; about every other nonce satisfies it.
pub const REGTEST_BITS: u32 = 0x207f_ffff;

/// Mine a regtest block at `height` on top of `prev`.
pub fn make_block(prev: Hash256, height: u64, tag: u8, extra: Vec<Transaction>) -> Block {
    let mut transactions = vec![make_coinbase(tag, height)];
    transactions.extend(extra);
    let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    let mut header = BlockHeader {
        version: 1,
        prev_hash: prev,
        merkle_root: merkle_root(&txids),
        timestamp: 1_580_662_895 + height as u32,
        bits: REGTEST_BITS,
        nonce: 0,
    };
    assert!(mine_header(&mut header, u32::MAX), "regtest target is always reachable");
    Block { header, transactions }
}

/// `len` linked blocks starting at `start_height` on top of `prev`.
pub fn build_chain(prev: Hash256, start_height: u64, len: usize, tag: u8) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(len);
    let mut prev = prev;
    for i in 0..len as u64 {
        let block = make_block(prev, start_height + i, tag, vec![]);
        prev = block.hash();
        blocks.push(block);
    }
    blocks
}

pub fn headers_of(blocks: &[Block]) -> Vec<BlockHeader> {
    blocks.iter().map(|b| b.header.clone()).collect()
}

pub fn hashes_of(blocks: &[Block]) -> Vec<Hash256> {
    blocks.iter().map(Block::hash).collect()
}

// ---------------------------------------------------------------------------
// MemoryChain
// ---------------------------------------------------------------------------

struct ChainInner {
    heights: HashMap<Hash256, u64>,
    parents: HashMap<Hash256, Hash256>,
    tip: ChainTip,
    invalid: HashSet<Hash256>,
    connected: Vec<u64>,
}

/// In-memory chain engine: checks proof of work, merkle root and coinbase,
/// connects blocks whose parent is known, and reports the rest as orphans.
pub struct MemoryChain {
    pow_limit_bits: u32,
    inner: Mutex<ChainInner>,
}

impl MemoryChain {
    pub fn new(params: &ChainParams) -> Self {
        let genesis = params.genesis_hash();
        let inner = ChainInner {
            heights: HashMap::from([(genesis, 0)]),
            parents: HashMap::new(),
            tip: ChainTip { height: 0, hash: genesis },
            invalid: HashSet::new(),
            connected: Vec::new(),
        };
        Self {
            pow_limit_bits: params.pow_limit_bits(),
            inner: Mutex::new(inner),
        }
    }

    /// Make every future submission of `hash` fail validation.
    pub fn mark_invalid(&self, hash: Hash256) {
        self.inner.lock().invalid.insert(hash);
    }

    /// Heights in the order blocks were connected.
    pub fn connected_heights(&self) -> Vec<u64> {
        self.inner.lock().connected.clone()
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<u64> {
        self.inner.lock().heights.get(hash).copied()
    }

    fn validate(&self, block: &Block) -> Result<(), BlockError> {
        check_proof_of_work(&block.header, self.pow_limit_bits)?;
        if block.coinbase().is_none() {
            return Err(BlockError::NoCoinbase);
        }
        let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();
        if merkle_root(&txids) != block.header.merkle_root {
            return Err(BlockError::InvalidMerkleRoot);
        }
        Ok(())
    }
}

impl ChainValidator for MemoryChain {
    fn process_block(&self, block: &Block, _source: Option<&PeerId>) -> BlockVerdict {
        let hash = block.hash();
        {
            let inner = self.inner.lock();
            if inner.heights.contains_key(&hash) {
                return BlockVerdict::Duplicate;
            }
            if inner.invalid.contains(&hash) {
                return BlockVerdict::Invalid(BlockError::Consensus("marked invalid".into()));
            }
        }
        if let Err(err) = self.validate(block) {
            return BlockVerdict::Invalid(err);
        }

        let mut inner = self.inner.lock();
        let Some(parent_height) = inner.heights.get(&block.header.prev_hash).copied() else {
            return BlockVerdict::Orphan;
        };
        let height = parent_height + 1;
        inner.heights.insert(hash, height);
        inner.parents.insert(hash, block.header.prev_hash);
        inner.connected.push(height);
        if height > inner.tip.height {
            inner.tip = ChainTip { height, hash };
        }
        BlockVerdict::Accepted { height }
    }

    fn have_block(&self, hash: &Hash256) -> bool {
        self.inner.lock().heights.contains_key(hash)
    }

    fn best_tip(&self) -> ChainTip {
        self.inner.lock().tip
    }

    fn block_locator(&self) -> Vec<Hash256> {
        let inner = self.inner.lock();
        let mut path = vec![inner.tip.hash];
        while let Some(parent) = path.last().and_then(|h| inner.parents.get(h)) {
            path.push(*parent);
        }
        let mut locator = Vec::new();
        let (mut idx, mut step) = (0, 1);
        while idx < path.len() {
            locator.push(path[idx]);
            if locator.len() >= 10 {
                step *= 2;
            }
            idx += step;
        }
        if let Some(genesis) = path.last() {
            if locator.last() != Some(genesis) {
                locator.push(*genesis);
            }
        }
        locator
    }
}

// ---------------------------------------------------------------------------
// MemoryMempool
// ---------------------------------------------------------------------------

/// Mempool double: admits any transaction not explicitly rejected.
#[derive(Default)]
pub struct MemoryMempool {
    pool: Mutex<HashMap<Hash256, TxDesc>>,
    reject: Mutex<HashSet<Hash256>>,
    submissions: Mutex<Vec<Hash256>>,
    unlocked_on_block: Mutex<Vec<Transaction>>,
}

impl MemoryMempool {
    pub fn reject(&self, txid: Hash256) {
        self.reject.lock().insert(txid);
    }

    /// Every txid handed to `process_transaction`, in order.
    pub fn submissions(&self) -> Vec<Hash256> {
        self.submissions.lock().clone()
    }

    /// Transactions to report as newly acceptable on the next connected block.
    pub fn unlock_on_next_block(&self, txs: Vec<Transaction>) {
        *self.unlocked_on_block.lock() = txs;
    }

    pub fn len(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.lock().is_empty()
    }
}

impl TxMempool for MemoryMempool {
    fn process_transaction(&self, tx: &Transaction, _source: Option<&PeerId>) -> Result<Vec<TxDesc>, TxRejectReason> {
        let txid = tx.txid();
        self.submissions.lock().push(txid);
        if self.reject.lock().contains(&txid) {
            return Err(TxRejectReason::Policy("rejected by test".into()));
        }
        let mut pool = self.pool.lock();
        if pool.contains_key(&txid) {
            return Err(TxRejectReason::DoubleSpend(format!("already have {txid}")));
        }
        let desc = TxDesc::new(tx.clone(), 0, 1_000, 250);
        pool.insert(txid, desc.clone());
        Ok(vec![desc])
    }

    fn have_transaction(&self, txid: &Hash256) -> bool {
        self.pool.lock().contains_key(txid)
    }

    fn block_connected(&self, block: &Block) -> Vec<TxDesc> {
        let mut pool = self.pool.lock();
        for tx in &block.transactions {
            pool.remove(&tx.txid());
        }
        let unlocked: Vec<TxDesc> = std::mem::take(&mut *self.unlocked_on_block.lock())
            .into_iter()
            .map(|tx| TxDesc::new(tx, 0, 1_000, 250))
            .collect();
        for desc in &unlocked {
            pool.insert(desc.txid, desc.clone());
        }
        unlocked
    }
}

// ---------------------------------------------------------------------------
// Recorders
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    pub announced: Mutex<Vec<Hash256>>,
    pub relays: Mutex<Vec<(InvVect, Vec<PeerId>)>>,
    pub heights: Mutex<Vec<(Hash256, u64)>>,
    pub confirmed: Mutex<Vec<Hash256>>,
}

impl PeerNotifier for RecordingNotifier {
    fn announce_new_transactions(&self, txs: &[TxDesc]) {
        self.announced.lock().extend(txs.iter().map(|d| d.txid));
    }
    fn update_peer_heights(&self, hash: &Hash256, height: u64, _source: Option<&PeerId>) {
        self.heights.lock().push((*hash, height));
    }
    fn relay_inventory(&self, inv: &InvVect, _payload: RelayPayload, targets: &[PeerId]) {
        self.relays.lock().push((*inv, targets.to_vec()));
    }
    fn transaction_confirmed(&self, tx: &Transaction) {
        self.confirmed.lock().push(tx.txid());
    }
}

#[derive(Default)]
pub struct RecordingFeeEstimator {
    pub observed: Mutex<Vec<Hash256>>,
    pub blocks: Mutex<Vec<u64>>,
}

impl FeeEstimator for RecordingFeeEstimator {
    fn observe_transaction(&self, desc: &TxDesc) {
        self.observed.lock().push(desc.txid);
    }
    fn register_block(&self, _block: &Block, height: u64) {
        self.blocks.lock().push(height);
    }
}

/// Transport double collecting every action the manager emits.
#[derive(Default)]
pub struct RecordingDispatcher {
    actions: Mutex<Vec<SyncAction>>,
}

impl RecordingDispatcher {
    pub fn take(&self) -> Vec<SyncAction> {
        std::mem::take(&mut *self.actions.lock())
    }

    pub fn snapshot(&self) -> Vec<SyncAction> {
        self.actions.lock().clone()
    }
}

impl PeerDispatcher for RecordingDispatcher {
    fn dispatch(&self, action: SyncAction) {
        self.actions.lock().push(action);
    }
}

// ---------------------------------------------------------------------------
// Action filters
// ---------------------------------------------------------------------------

pub fn disconnects(actions: &[SyncAction]) -> Vec<(PeerId, &'static str)> {
    actions
        .iter()
        .filter_map(|a| match a {
            SyncAction::Disconnect { peer, reason } => Some((*peer, reason.kind())),
            _ => None,
        })
        .collect()
}

pub fn block_requests(actions: &[SyncAction]) -> Vec<(PeerId, Vec<Hash256>)> {
    actions
        .iter()
        .filter_map(|a| match a {
            SyncAction::RequestBlocks { peer, hashes } => Some((*peer, hashes.clone())),
            _ => None,
        })
        .collect()
}

pub fn tx_requests(actions: &[SyncAction]) -> Vec<(PeerId, Vec<Hash256>)> {
    actions
        .iter()
        .filter_map(|a| match a {
            SyncAction::RequestTransactions { peer, hashes } => Some((*peer, hashes.clone())),
            _ => None,
        })
        .collect()
}

pub fn header_requests(actions: &[SyncAction]) -> Vec<(PeerId, Vec<Hash256>)> {
    actions
        .iter()
        .filter_map(|a| match a {
            SyncAction::RequestHeaders { peer, locator, .. } => Some((*peer, locator.clone())),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Node harness
// ---------------------------------------------------------------------------

/// Collaborators wired to a fresh context.
pub struct Collaborators {
    pub params: Arc<ChainParams>,
    pub chain: Arc<MemoryChain>,
    pub mempool: Arc<MemoryMempool>,
    pub notifier: Arc<RecordingNotifier>,
    pub fees: Arc<RecordingFeeEstimator>,
}

impl Collaborators {
    pub fn new(params: ChainParams) -> Self {
        let chain = Arc::new(MemoryChain::new(&params));
        Self {
            params: Arc::new(params),
            chain,
            mempool: Arc::new(MemoryMempool::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            fees: Arc::new(RecordingFeeEstimator::default()),
        }
    }

    pub fn context(&self, config: SyncConfig) -> SyncContext {
        SyncContext {
            notifier: self.notifier.clone(),
            chain: self.chain.clone(),
            mempool: self.mempool.clone(),
            chain_params: self.params.clone(),
            fee_estimator: Some(self.fees.clone()),
            config,
        }
    }
}

/// A [`SyncManager`] with in-memory collaborators and a manual clock.
pub struct TestNode {
    pub manager: SyncManager,
    pub deps: Collaborators,
    pub now: Instant,
}

impl TestNode {
    pub fn new(params: ChainParams, config: SyncConfig) -> Self {
        init_tracing();
        let deps = Collaborators::new(params);
        let now = Instant::now();
        let manager = SyncManager::new(deps.context(config), now);
        Self { manager, deps, now }
    }

    pub fn regtest() -> Self {
        Self::new(ChainParams::regtest(), SyncConfig::regtest())
    }

    pub fn genesis(&self) -> Hash256 {
        self.deps.params.genesis_hash()
    }

    pub fn send(&mut self, event: SyncEvent) -> Vec<SyncAction> {
        self.manager.handle(event, self.now)
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Register a full-node peer reporting `height`. Returns its id and the
    /// actions its arrival caused.
    pub fn connect(&mut self, height: u64, outbound: bool) -> (PeerId, Vec<SyncAction>) {
        let id = PeerId::random();
        let actions = self.send(SyncEvent::NewPeer(PeerInfo {
            id,
            full_node: true,
            outbound,
            starting_height: height,
        }));
        (id, actions)
    }

    /// Deliver every block the manager asked `peer` for, following up on
    /// new requests, until it asks that peer for nothing more. Returns the
    /// remaining actions for other peers.
    pub fn serve_blocks(&mut self, peer: PeerId, blocks: &[Block], mut actions: Vec<SyncAction>) -> Vec<SyncAction> {
        let by_hash: HashMap<Hash256, &Block> = blocks.iter().map(|b| (b.hash(), b)).collect();
        let mut others = Vec::new();
        while !actions.is_empty() {
            let mut next = Vec::new();
            for action in actions {
                match action {
                    SyncAction::RequestBlocks { peer: p, hashes } if p == peer => {
                        for hash in hashes {
                            if let Some(block) = by_hash.get(&hash) {
                                next.extend(self.send(SyncEvent::Block { peer, block: (*block).clone() }));
                            }
                        }
                    }
                    other => others.push(other),
                }
            }
            actions = next;
        }
        others
    }
}

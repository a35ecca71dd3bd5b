//! Collaborator interfaces consumed by the sync manager.
//!
//! Implementations are owned elsewhere in the node (chain engine, mempool,
//! server, transport). Every method is synchronous and must not call back
//! into the sync manager.

use libp2p::PeerId;
use tarn_core::error::{BlockError, TxRejectReason};
use tarn_core::mempool::TxDesc;
use tarn_core::types::{Block, BlockHeader, Hash256, InvVect, Transaction};

use crate::manager::SyncAction;

/// Best block of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub height: u64,
    pub hash: Hash256,
}

/// Outcome of submitting a block to the chain engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockVerdict {
    /// Connected to the chain at `height`.
    Accepted { height: u64 },
    /// Parent unknown; nothing was connected.
    Orphan,
    /// Failed validation.
    Invalid(BlockError),
    /// Already known.
    Duplicate,
}

/// Chain validation engine.
pub trait ChainValidator: Send + Sync {
    /// Validate and, if possible, connect `block`. `source` is the peer it came from.
    fn process_block(&self, block: &Block, source: Option<&PeerId>) -> BlockVerdict;

    /// Whether a block with this hash is known (main chain, side chain, or invalid).
    fn have_block(&self, hash: &Hash256) -> bool;

    /// Current best chain tip.
    fn best_tip(&self) -> ChainTip;

    /// Block locator for the best chain, newest first.
    fn block_locator(&self) -> Vec<Hash256>;
}

/// Transaction pool.
pub trait TxMempool: Send + Sync {
    /// Validate and admit `tx`. On success returns the accepted transaction
    /// first, followed by any pool orphans it made acceptable.
    fn process_transaction(
        &self,
        tx: &Transaction,
        source: Option<&PeerId>,
    ) -> Result<Vec<TxDesc>, TxRejectReason>;

    /// Whether the pool (or its orphan pool) holds this transaction.
    fn have_transaction(&self, txid: &Hash256) -> bool;

    /// Drop transactions confirmed by `block`. Returns transactions that
    /// became acceptable as a result.
    fn block_connected(&self, block: &Block) -> Vec<TxDesc>;
}

/// Fee estimator fed with relay and confirmation events.
pub trait FeeEstimator: Send + Sync {
    /// A transaction entered the mempool.
    fn observe_transaction(&self, desc: &TxDesc);

    /// A block was connected at `height`.
    fn register_block(&self, block: &Block, height: u64);
}

/// Data attached to a relayed inventory item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayPayload {
    /// Header of a relayed block.
    Header(BlockHeader),
    /// Descriptor of a relayed transaction.
    Transaction(TxDesc),
}

/// Outbound notifications to the server and its peers.
///
/// All calls are fire-and-forget.
pub trait PeerNotifier: Send + Sync {
    /// Transactions newly admitted to the mempool. Peer relay happens
    /// separately through [`relay_inventory`](Self::relay_inventory).
    fn announce_new_transactions(&self, txs: &[TxDesc]);

    /// The best chain moved to `hash` at `height`; `source` delivered the block.
    fn update_peer_heights(&self, hash: &Hash256, height: u64, source: Option<&PeerId>);

    /// Announce `inv` to `targets`.
    fn relay_inventory(&self, inv: &InvVect, payload: RelayPayload, targets: &[PeerId]);

    /// A transaction was confirmed in a connected block.
    fn transaction_confirmed(&self, tx: &Transaction);
}

/// Transport that carries manager requests to peers.
pub trait PeerDispatcher: Send + Sync {
    fn dispatch(&self, action: SyncAction);
}

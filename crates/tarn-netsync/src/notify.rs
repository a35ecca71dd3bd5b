//! Adapter from manager decisions to [`PeerNotifier`] calls.
//!
//! Relay targets are computed here from each peer's known inventory, so an
//! item is announced at most once per peer and never back to the peer it
//! came from.

use std::sync::Arc;

use libp2p::PeerId;
use tarn_core::mempool::TxDesc;
use tarn_core::types::{Block, BlockHeader, Hash256, InvVect};
use tracing::debug;

use crate::peer::PeerTracker;
use crate::traits::{PeerNotifier, RelayPayload};

#[derive(Clone)]
pub struct NotifyBridge {
    notifier: Arc<dyn PeerNotifier>,
}

impl NotifyBridge {
    pub fn new(notifier: Arc<dyn PeerNotifier>) -> Self {
        Self { notifier }
    }

    /// Announce newly admitted transactions and relay each one to peers
    /// that have not seen it. Returns the number of relay messages sent.
    pub fn announce_transactions(
        &self,
        peers: &mut PeerTracker,
        txs: &[TxDesc],
        origin: Option<&PeerId>,
    ) -> usize {
        if txs.is_empty() {
            return 0;
        }
        self.notifier.announce_new_transactions(txs);

        let mut relayed = 0;
        for desc in txs {
            let inv = InvVect::tx(desc.txid);
            if let Some(origin) = origin {
                peers.mark_known(origin, inv);
            }
            let targets = peers.relay_targets(inv, origin);
            if targets.is_empty() {
                continue;
            }
            relayed += targets.len();
            self.notifier
                .relay_inventory(&inv, RelayPayload::Transaction(desc.clone()), &targets);
        }
        debug!(txs = txs.len(), relayed, "sync: announced transactions");
        relayed
    }

    /// Relay a newly connected block header. Returns the number of targets.
    pub fn relay_block(
        &self,
        peers: &mut PeerTracker,
        header: &BlockHeader,
        origin: Option<&PeerId>,
    ) -> usize {
        let inv = InvVect::block(header.hash());
        if let Some(origin) = origin {
            peers.mark_known(origin, inv);
        }
        let targets = peers.relay_targets(inv, origin);
        if !targets.is_empty() {
            self.notifier
                .relay_inventory(&inv, RelayPayload::Header(header.clone()), &targets);
        }
        targets.len()
    }

    pub fn update_peer_heights(&self, hash: &Hash256, height: u64, source: Option<&PeerId>) {
        self.notifier.update_peer_heights(hash, height, source);
    }

    /// Signal confirmation of every non-coinbase transaction in `block`.
    pub fn transactions_confirmed(&self, block: &Block) {
        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            self.notifier.transaction_confirmed(tx);
        }
    }
}

impl std::fmt::Debug for NotifyBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyBridge").finish_non_exhaustive()
    }
}

//! Headers-first download against a single sync peer.
//!
//! The controller is anchored at the local best block. Each header batch
//! from the sync peer is checked as a whole before any of it is kept:
//!
//! 1. every header must link to the previously accepted one,
//! 2. every header must satisfy the proof-of-work rule,
//! 3. a header at the height of the next checkpoint must carry the
//!    checkpoint hash.
//!
//! Accepted headers feed an ascending-height block download queue. A block
//! moves from *pending* to *in flight* when requested, to *awaiting* when
//! received but not yet connected (orphaned behind an earlier block), and
//! leaves the set once connected. The header set is *realized* when header
//! download is complete and every header's block has been connected.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tarn_core::chaincfg::{ChainParams, Checkpoint};
use tarn_core::pow::check_proof_of_work;
use tarn_core::types::{BlockHeader, Hash256};
use tracing::{debug, info};

use crate::error::HeaderError;
use crate::traits::ChainTip;

/// Result of an accepted header batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub accepted: usize,
    pub tip_height: u64,
    /// The batch was shorter than a full page: the peer has nothing more.
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockStage {
    Pending,
    InFlight,
    Awaiting,
}

#[derive(Debug)]
pub struct HeaderSync {
    params: Arc<ChainParams>,
    enforce_checkpoints: bool,
    tip: ChainTip,
    next_checkpoint: Option<Checkpoint>,
    headers_complete: bool,
    pending: BTreeMap<u64, Hash256>,
    stages: HashMap<Hash256, (u64, BlockStage)>,
    in_flight: usize,
}

impl HeaderSync {
    pub fn new(params: Arc<ChainParams>, enforce_checkpoints: bool) -> Self {
        let genesis = ChainTip {
            height: 0,
            hash: params.genesis_hash(),
        };
        let mut sync = Self {
            params,
            enforce_checkpoints,
            tip: genesis,
            next_checkpoint: None,
            headers_complete: false,
            pending: BTreeMap::new(),
            stages: HashMap::new(),
            in_flight: 0,
        };
        sync.begin(genesis);
        sync
    }

    /// Discard all header state and re-anchor at `anchor`.
    pub fn begin(&mut self, anchor: ChainTip) {
        self.tip = anchor;
        self.next_checkpoint = if self.enforce_checkpoints {
            self.params.next_checkpoint_after(anchor.height).copied()
        } else {
            None
        };
        self.headers_complete = false;
        self.pending.clear();
        self.stages.clear();
        self.in_flight = 0;
        debug!(height = anchor.height, hash = %anchor.hash, "headers: anchored");
    }

    /// Last accepted header (or the anchor).
    pub fn tip(&self) -> ChainTip {
        self.tip
    }

    pub fn next_checkpoint(&self) -> Option<&Checkpoint> {
        self.next_checkpoint.as_ref()
    }

    pub fn headers_complete(&self) -> bool {
        self.headers_complete
    }

    /// Validate and accept a batch from the sync peer.
    ///
    /// Nothing is kept unless the whole batch is valid.
    pub fn process_batch(&mut self, headers: &[BlockHeader]) -> Result<BatchOutcome, HeaderError> {
        let max = self.params.max_headers_per_msg();
        if headers.len() > max {
            return Err(HeaderError::Oversized { got: headers.len(), max });
        }

        let mut prev = self.tip;
        let mut checkpoint = self.next_checkpoint;
        let mut accepted = Vec::with_capacity(headers.len());
        for header in headers {
            let height = prev.height + 1;
            let hash = header.hash();
            if header.prev_hash != prev.hash {
                return Err(HeaderError::BrokenLinkage { height, hash, expected: prev.hash });
            }
            check_proof_of_work(header, self.params.pow_limit_bits())
                .map_err(|source| HeaderError::ProofOfWork { height, source })?;
            if let Some(cp) = checkpoint.filter(|cp| cp.height == height) {
                if cp.hash != hash {
                    return Err(HeaderError::CheckpointMismatch { height, expected: cp.hash, got: hash });
                }
                info!(height, %hash, "headers: checkpoint verified");
                checkpoint = self.params.next_checkpoint_after(height).copied();
            }
            accepted.push((height, hash));
            prev = ChainTip { height, hash };
        }

        for (height, hash) in &accepted {
            self.pending.insert(*height, *hash);
            self.stages.insert(*hash, (*height, BlockStage::Pending));
        }
        self.tip = prev;
        self.next_checkpoint = checkpoint;
        let complete = headers.len() < max;
        if complete {
            self.headers_complete = true;
        }
        debug!(count = accepted.len(), tip = prev.height, complete, "headers: batch accepted");
        Ok(BatchOutcome {
            accepted: accepted.len(),
            tip_height: prev.height,
            complete,
        })
    }

    // -------------------------------------------------------------------------
    // Block download queue
    // -------------------------------------------------------------------------

    /// Lowest-height pending block, without taking it.
    pub fn peek_pending(&self) -> Option<(u64, Hash256)> {
        self.pending.first_key_value().map(|(h, hash)| (*h, *hash))
    }

    /// Move a pending block to in flight.
    pub fn mark_requested(&mut self, hash: &Hash256) -> bool {
        match self.stages.get_mut(hash) {
            Some((height, stage)) if *stage == BlockStage::Pending => {
                self.pending.remove(height);
                *stage = BlockStage::InFlight;
                self.in_flight += 1;
                true
            }
            _ => false,
        }
    }

    /// A block from the set arrived. Returns `true` if it belongs to the set.
    pub fn block_received(&mut self, hash: &Hash256) -> bool {
        match self.stages.get_mut(hash) {
            Some((height, stage)) => {
                match *stage {
                    BlockStage::Pending => {
                        self.pending.remove(height);
                    }
                    BlockStage::InFlight => self.in_flight -= 1,
                    BlockStage::Awaiting => {}
                }
                *stage = BlockStage::Awaiting;
                true
            }
            None => false,
        }
    }

    /// A block from the set was connected to the chain.
    pub fn block_connected(&mut self, hash: &Hash256) -> bool {
        match self.stages.remove(hash) {
            Some((height, BlockStage::Pending)) => {
                self.pending.remove(&height);
                true
            }
            Some((_, BlockStage::InFlight)) => {
                self.in_flight -= 1;
                true
            }
            Some((_, BlockStage::Awaiting)) => true,
            None => false,
        }
    }

    /// Put a block back in the pending queue (request lost or orphan dropped).
    pub fn release(&mut self, hash: &Hash256) -> bool {
        match self.stages.get_mut(hash) {
            Some((height, stage)) if *stage != BlockStage::Pending => {
                if *stage == BlockStage::InFlight {
                    self.in_flight -= 1;
                }
                *stage = BlockStage::Pending;
                self.pending.insert(*height, *hash);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.stages.contains_key(hash)
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<u64> {
        self.stages.get(hash).map(|(h, _)| *h)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight
    }

    /// Header download finished and every block connected.
    pub fn is_realized(&self) -> bool {
        self.headers_complete && self.stages.is_empty()
    }
}

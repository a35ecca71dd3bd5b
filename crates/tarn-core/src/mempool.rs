//! Mempool-facing descriptors.
//!
//! The mempool itself is an external collaborator; sync only needs the
//! normalized record it hands back for relay and fee estimation.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::types::{Hash256, Transaction};

/// Fee rate precision: fees are expressed per 1000 bytes.
const FEE_RATE_UNIT: u128 = 1_000;

/// A transaction accepted into the mempool, ready for relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDesc {
    /// The accepted transaction.
    pub tx: Transaction,
    /// Precomputed transaction ID.
    pub txid: Hash256,
    /// Chain height when the transaction entered the pool.
    pub height: u64,
    /// Absolute fee in base units.
    pub fee: u64,
    /// Serialized size in bytes, as measured by the mempool.
    pub size: usize,
    /// Time the transaction entered the pool.
    pub added: SystemTime,
}

impl TxDesc {
    /// Build a descriptor, computing the txid once.
    pub fn new(tx: Transaction, height: u64, fee: u64, size: usize) -> Self {
        let txid = tx.txid();
        Self {
            tx,
            txid,
            height,
            fee,
            size,
            added: SystemTime::now(),
        }
    }

    /// Fee per 1000 bytes. Zero-size descriptors report `u64::MAX`.
    pub fn fee_per_kb(&self) -> u64 {
        if self.size == 0 {
            return u64::MAX;
        }
        let rate = self.fee as u128 * FEE_RATE_UNIT / self.size as u128;
        rate.min(u64::MAX as u128) as u64
    }
}

//! Sync manager configuration and collaborator handles.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tarn_core::chaincfg::ChainParams;

use crate::error::SyncError;
use crate::orphan::MAX_ORPHAN_TTL;
use crate::traits::{ChainValidator, FeeEstimator, PeerNotifier, TxMempool};

/// Tunables for the sync manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Skip checkpoint verification during header sync.
    pub disable_checkpoints: bool,
    /// Maximum number of registered peers. Zero means unlimited.
    pub max_peers: usize,
    /// Outstanding block requests allowed per peer during block download.
    pub max_blocks_in_flight_per_peer: usize,
    /// Outstanding block requests allowed across all peers during block download.
    pub max_blocks_in_flight: usize,
    /// Inventory-driven block requests allowed per peer.
    pub max_requested_blocks_per_peer: usize,
    /// Inventory-driven transaction requests allowed per peer.
    pub max_requested_txns_per_peer: usize,
    /// No progress for this long drops the sync peer.
    pub stall_timeout: Duration,
    /// An unanswered request older than this disconnects its owner.
    pub request_timeout: Duration,
    /// How often the stall watchdog fires.
    pub stall_check_interval: Duration,
    /// Orphan pool capacity in blocks.
    pub max_orphan_blocks: usize,
    /// Lifetime of an orphan block in the pool.
    pub orphan_ttl: Duration,
    /// How often expired orphans are purged.
    pub orphan_sweep_interval: Duration,
    /// Per-peer known inventory capacity.
    pub max_known_inventory: usize,
    /// Capacity of the rejected transaction cache.
    pub max_rejected_txns: usize,
    /// Misbehaviour score at which a peer is disconnected.
    pub misbehavior_threshold: u32,
    /// Capacity of the event channel feeding the manager.
    pub event_queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            disable_checkpoints: false,
            max_peers: 125,
            max_blocks_in_flight_per_peer: 16,
            max_blocks_in_flight: 1024,
            max_requested_blocks_per_peer: 500,
            max_requested_txns_per_peer: 5000,
            stall_timeout: Duration::from_secs(3 * 60),
            request_timeout: Duration::from_secs(2 * 60),
            stall_check_interval: Duration::from_secs(30),
            max_orphan_blocks: 100,
            orphan_ttl: Duration::from_secs(60 * 60),
            orphan_sweep_interval: Duration::from_secs(5 * 60),
            max_known_inventory: 1000,
            max_rejected_txns: 1000,
            misbehavior_threshold: 100,
            event_queue_capacity: 1024,
        }
    }
}

impl SyncConfig {
    /// Configuration preset for mainnet.
    pub fn mainnet() -> Self {
        Self::default()
    }

    /// Configuration preset for regression tests: short timers, small pools.
    pub fn regtest() -> Self {
        Self {
            max_peers: 8,
            stall_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            stall_check_interval: Duration::from_secs(1),
            orphan_ttl: Duration::from_secs(60),
            orphan_sweep_interval: Duration::from_secs(10),
            event_queue_capacity: 256,
            ..Self::default()
        }
    }

    /// Whether checkpoint verification is active.
    pub fn checkpoints_enabled(&self) -> bool {
        !self.disable_checkpoints
    }

    /// Reject settings the event loop cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.event_queue_capacity == 0 {
            return Err(SyncError::Config("event_queue_capacity must be positive".into()));
        }
        if self.stall_check_interval.is_zero() || self.orphan_sweep_interval.is_zero() {
            return Err(SyncError::Config("timer intervals must be positive".into()));
        }
        if self.max_blocks_in_flight == 0 || self.max_blocks_in_flight_per_peer == 0 {
            return Err(SyncError::Config("block download windows must be positive".into()));
        }
        if self.orphan_ttl > MAX_ORPHAN_TTL {
            return Err(SyncError::Config(format!(
                "orphan_ttl must be at most {}s",
                MAX_ORPHAN_TTL.as_secs()
            )));
        }
        Ok(())
    }
}

/// Everything the sync manager needs from the rest of the node.
#[derive(Clone)]
pub struct SyncContext {
    /// Target for relay and peer-height notifications.
    pub notifier: Arc<dyn PeerNotifier>,
    /// Chain validation engine.
    pub chain: Arc<dyn ChainValidator>,
    /// Transaction pool.
    pub mempool: Arc<dyn TxMempool>,
    /// Network parameters; the checkpoint trust anchor.
    pub chain_params: Arc<ChainParams>,
    /// Optional fee estimator fed with relayed and confirmed transactions.
    pub fee_estimator: Option<Arc<dyn FeeEstimator>>,
    /// Tunables.
    pub config: SyncConfig,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("network", &self.chain_params.network())
            .field("fee_estimator", &self.fee_estimator.is_some())
            .field("config", &self.config)
            .finish()
    }
}

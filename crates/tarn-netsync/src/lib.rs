//! # tarn-netsync — chain synchronization for Tarn nodes.
//!
//! Tracks per-peer sync state, drives headers-first initial block download
//! against a single sync peer, pools orphan blocks until their parents
//! connect, and relays newly accepted blocks and transactions.
//!
//! The core is [`SyncManager`], a sans-IO state machine: it consumes
//! [`SyncEvent`]s and returns [`SyncAction`]s. [`SyncHandle::start`] runs it
//! on a tokio task behind a command channel with stall and orphan-sweep
//! timers. The chain engine, mempool and transport plug in through the
//! traits in [`traits`].

pub mod config;
pub mod error;
pub mod header_sync;
pub mod inventory;
pub mod manager;
pub mod notify;
pub mod orphan;
pub mod peer;
pub mod service;
pub mod traits;

pub use config::{SyncConfig, SyncContext};
pub use error::{DisconnectReason, HeaderError, RequestError, SyncError};
pub use header_sync::{BatchOutcome, HeaderSync};
pub use inventory::RecencySet;
pub use manager::{SyncAction, SyncEvent, SyncManager, SyncMode, SyncStats};
pub use notify::NotifyBridge;
pub use orphan::{OrphanEntry, OrphanInsert, OrphanPool};
pub use peer::{PeerInfo, PeerSyncState, PeerTracker, Released, RequestEntry};
pub use service::{SyncHandle, SyncSnapshot};
pub use traits::{
    BlockVerdict, ChainTip, ChainValidator, FeeEstimator, PeerDispatcher, PeerNotifier, RelayPayload, TxMempool,
};

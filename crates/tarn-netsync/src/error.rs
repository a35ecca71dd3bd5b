//! Error types for the sync core.

use libp2p::PeerId;
use tarn_core::error::BlockError;
use tarn_core::types::Hash256;
use thiserror::Error;

/// Reasons a header batch is rejected. Any of these disqualifies the sender.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("batch of {got} headers exceeds page size {max}")] Oversized { got: usize, max: usize },
    #[error("header {hash} at height {height} does not connect to {expected}")]
    BrokenLinkage { height: u64, hash: Hash256, expected: Hash256 },
    #[error("header at height {height}: {source}")] ProofOfWork { height: u64, source: BlockError },
    #[error("checkpoint mismatch at height {height}: expected {expected}, got {got}")]
    CheckpointMismatch { height: u64, expected: Hash256, got: Hash256 },
}

/// Bookkeeping failures in the peer tracker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("unknown peer {0}")] UnknownPeer(PeerId),
    #[error("peer {0} already registered")] AlreadyRegistered(PeerId),
    #[error("{hash} already requested from {owner}")] AlreadyRequested { hash: Hash256, owner: PeerId },
}

/// Errors surfaced to users of the sync handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("sync manager stopped")] Stopped,
    #[error("invalid configuration: {0}")] Config(String),
}

/// Why the manager asked for a peer to be disconnected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    #[error("bad headers: {0}")] BadHeaders(#[from] HeaderError),
    #[error("unsolicited headers")] UnsolicitedHeaders,
    #[error("invalid block: {0}")] InvalidBlock(BlockError),
    #[error("header chain led to invalid block {0}")] InvalidChain(Hash256),
    #[error("sync peer stalled")] Stalled,
    #[error("request for {0} timed out")] RequestTimeout(Hash256),
    #[error("too many peers")] TooManyPeers,
    #[error("misbehaviour score {0}")] Misbehavior(u32),
}

impl DisconnectReason {
    /// Short stable label used as a counter key.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadHeaders(_) => "bad_headers",
            Self::UnsolicitedHeaders => "unsolicited_headers",
            Self::InvalidBlock(_) => "invalid_block",
            Self::InvalidChain(_) => "invalid_chain",
            Self::Stalled => "stalled",
            Self::RequestTimeout(_) => "request_timeout",
            Self::TooManyPeers => "too_many_peers",
            Self::Misbehavior(_) => "misbehavior",
        }
    }

    /// Whether the peer broke protocol rules (as opposed to being slow or surplus).
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::BadHeaders(_)
                | Self::UnsolicitedHeaders
                | Self::InvalidBlock(_)
                | Self::InvalidChain(_)
                | Self::Misbehavior(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_mismatch_message() {
        let err = HeaderError::CheckpointMismatch {
            height: 100,
            expected: Hash256([0xAA; 32]),
            got: Hash256([0xBB; 32]),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("checkpoint mismatch at height 100"));
        assert!(msg.contains(&"aa".repeat(32)));
    }

    #[test]
    fn disconnect_reason_wraps_header_error() {
        let reason: DisconnectReason = HeaderError::Oversized { got: 2001, max: 2000 }.into();
        assert_eq!(reason.kind(), "bad_headers");
        assert!(reason.is_protocol_violation());
        assert_eq!(reason.to_string(), "bad headers: batch of 2001 headers exceeds page size 2000");
    }

    #[test]
    fn slow_peers_are_not_violations() {
        assert!(!DisconnectReason::Stalled.is_protocol_violation());
        assert!(!DisconnectReason::RequestTimeout(Hash256::ZERO).is_protocol_violation());
        assert!(!DisconnectReason::TooManyPeers.is_protocol_violation());
    }
}

//! Error types for the Tarn protocol.
use thiserror::Error;

/// Reasons a block or header fails consensus checks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("invalid proof of work")] InvalidPoW,
    #[error("target bits {0:#010x} above network limit")] TargetAboveLimit(u32),
    #[error("invalid prev hash")] InvalidPrevHash,
    #[error("invalid merkle root")] InvalidMerkleRoot,
    #[error("checkpoint mismatch at height {height}")] CheckpointMismatch { height: u64 },
    #[error("timestamp too far: {0}")] TimestampTooFar(u32),
    #[error("no coinbase")] NoCoinbase,
    #[error("consensus rule violated: {0}")] Consensus(String),
}

/// Reason category for a transaction the mempool refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxRejectReason {
    #[error("policy: {0}")] Policy(String),
    #[error("double spend of {0}")] DoubleSpend(String),
    #[error("fee too low: {fee} < {min}")] FeeTooLow { fee: u64, min: u64 },
    #[error("orphan input: {0}")] OrphanInput(String),
}

/// Errors raised while building chain parameters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainParamsError {
    #[error("checkpoints not strictly increasing at height {0}")] UnorderedCheckpoints(u64),
    #[error("unknown network: {0}")] UnknownNetwork(String),
}

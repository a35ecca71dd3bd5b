//! Core protocol types: hashes, transactions, blocks, inventory vectors.
//!
//! Header and transaction hashes are double SHA-256 over an explicit
//! little-endian byte layout, so every node derives identical identifiers
//! without depending on a particular wire codec.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte hash value.
///
/// Used for transaction IDs, block header hashes, and merkle roots.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Used as the genesis previous hash.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Double SHA-256 of `data`.
    pub fn double_sha256(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        Self(Sha256::digest(first).into())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl OutPoint {
    /// The null outpoint, spent by coinbase inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u32::MAX,
        }
    }

    /// Check if this is the null outpoint (coinbase marker).
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxInput {
    /// The outpoint being spent. Null outpoint for coinbase.
    pub previous_output: OutPoint,
    /// Unlocking script. Arbitrary data for coinbase inputs.
    pub signature_script: Vec<u8>,
    /// Input sequence number.
    pub sequence: u32,
}

/// A transaction output, creating a new spendable amount.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxOutput {
    /// Value in base units.
    pub value: u64,
    /// Locking script.
    pub pk_script: Vec<u8>,
}

/// A transaction transferring value between scripts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// Protocol version.
    pub version: u32,
    /// Inputs consuming previous outputs.
    pub inputs: Vec<TxInput>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
    /// Block height or timestamp before which this tx is invalid.
    pub lock_time: u32,
}

/// Append `n` as a Bitcoin CompactSize integer.
///
/// Values below `0xfd` take one byte; larger values get a `0xfd`, `0xfe` or
/// `0xff` marker followed by a little-endian u16, u32 or u64.
pub fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

impl Transaction {
    /// Legacy Bitcoin serialization used for hashing.
    ///
    /// Input and output counts and script lengths are CompactSize integers.
    fn hash_bytes(&self) -> Vec<u8> {
        fn put_var(buf: &mut Vec<u8>, bytes: &[u8]) {
            write_compact_size(buf, bytes.len() as u64);
            buf.extend_from_slice(bytes);
        }

        let mut data = Vec::with_capacity(64 + self.inputs.len() * 48 + self.outputs.len() * 40);
        data.extend_from_slice(&self.version.to_le_bytes());
        write_compact_size(&mut data, self.inputs.len() as u64);
        for input in &self.inputs {
            data.extend_from_slice(input.previous_output.txid.as_bytes());
            data.extend_from_slice(&input.previous_output.index.to_le_bytes());
            put_var(&mut data, &input.signature_script);
            data.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_compact_size(&mut data, self.outputs.len() as u64);
        for output in &self.outputs {
            data.extend_from_slice(&output.value.to_le_bytes());
            put_var(&mut data, &output.pk_script);
        }
        data.extend_from_slice(&self.lock_time.to_le_bytes());
        data
    }

    /// Compute the transaction ID (double SHA-256 of the canonical layout).
    pub fn txid(&self) -> Hash256 {
        Hash256::double_sha256(&self.hash_bytes())
    }

    /// Check if this is a coinbase transaction (single input with null outpoint).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Sum of all output values. Returns None on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }
}

/// Block header containing the proof-of-work puzzle.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u32,
    /// Hash of the previous block header.
    pub prev_hash: Hash256,
    /// Merkle root of the block's transactions.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u32,
    /// Compact difficulty target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl BlockHeader {
    /// Header size in bytes when serialized for hashing.
    pub const HASH_SIZE: usize = 4 + 32 + 32 + 4 + 4 + 4;

    /// Fixed 80-byte layout: version || prev_hash || merkle_root ||
    /// timestamp || bits || nonce, integers little-endian.
    pub fn header_bytes(&self) -> [u8; Self::HASH_SIZE] {
        let mut data = [0u8; Self::HASH_SIZE];
        data[0..4].copy_from_slice(&self.version.to_le_bytes());
        data[4..36].copy_from_slice(self.prev_hash.as_bytes());
        data[36..68].copy_from_slice(self.merkle_root.as_bytes());
        data[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        data[72..76].copy_from_slice(&self.bits.to_le_bytes());
        data[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        data
    }

    /// Compute the block header hash (double SHA-256 of [`header_bytes`](Self::header_bytes)).
    pub fn hash(&self) -> Hash256 {
        Hash256::double_sha256(&self.header_bytes())
    }
}

/// A complete block: header plus transactions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Block header with proof-of-work.
    pub header: BlockHeader,
    /// Ordered list of transactions. First transaction must be coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The block hash (hash of its header).
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Get the coinbase transaction, if the block is non-empty.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }
}

/// Kind of item referenced by an inventory vector.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvType {
    /// A transaction, identified by txid.
    Tx,
    /// A block, identified by header hash.
    Block,
}

/// An announcement of an item a peer claims to have, without the payload.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InvVect {
    /// What the hash refers to.
    pub kind: InvType,
    /// Identifier of the announced item.
    pub hash: Hash256,
}

impl InvVect {
    /// Inventory vector for a transaction.
    pub fn tx(hash: Hash256) -> Self {
        Self {
            kind: InvType::Tx,
            hash,
        }
    }

    /// Inventory vector for a block.
    pub fn block(hash: Hash256) -> Self {
        Self {
            kind: InvType::Block,
            hash,
        }
    }
}

impl fmt::Display for InvVect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            InvType::Tx => write!(f, "tx {}", self.hash),
            InvType::Block => write!(f, "block {}", self.hash),
        }
    }
}

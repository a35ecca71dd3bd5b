//! Per-network chain parameters: genesis block, checkpoints, proof-of-work limit.
//!
//! A [`ChainParams`] value is built once at startup and shared read-only
//! (typically as `Arc<ChainParams>`). It is the trust anchor for sync:
//! checkpoints pin known-good block hashes at fixed heights so that a peer
//! cannot feed us an alternative history below them.
//!
//! All networks share the same genesis coinbase transaction and differ in
//! header timestamp, difficulty bits, and nonce. Genesis hashes and merkle
//! roots are fixed per network and never recomputed at startup.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::ChainParamsError;
use crate::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};

/// Maximum number of headers a peer may return in one page.
pub const MAX_HEADERS_PER_MSG: usize = 2000;

/// Message embedded in the genesis coinbase signature script.
pub const GENESIS_MESSAGE: &[u8] =
    b"Trustless Rewards For Sustainable Energy Adoption - UN SDGs 7 9 11 13 , 2/02/2020";

/// Genesis coinbase output value in base units.
pub const GENESIS_REWARD: u64 = 0x1_2a05_f200;

/// Opcode-level prefix of the genesis signature script, before the message push.
const GENESIS_SCRIPT_PREFIX: [u8; 9] = [0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04, 0x4c, 0x51];

/// Pay-to-pubkey script of the genesis output.
const GENESIS_PK_SCRIPT: [u8; 67] = [
    0x41, 0x04, 0xf9, 0x22, 0x79, 0x3e, 0x1e, 0x9f, 0xd9, 0x53, 0x40, 0x3b, 0x47, 0x5b, 0xbf,
    0xe8, 0xea, 0x32, 0x16, 0xb8, 0xb7, 0x08, 0x16, 0x68, 0x53, 0xc0, 0x2f, 0x3f, 0x6b, 0x95,
    0x23, 0x2c, 0xf9, 0xe3, 0x6b, 0xcc, 0x29, 0x91, 0xdb, 0xef, 0x13, 0x88, 0xf4, 0x2b, 0x5a,
    0x72, 0x70, 0x0e, 0xc8, 0x37, 0x6a, 0x79, 0xee, 0x4f, 0xfc, 0x00, 0x23, 0x55, 0xee, 0x39,
    0x0d, 0x19, 0x2b, 0x27, 0xc9, 0x71, 0xac,
];

// Genesis anchors, in internal byte order. Peers link block 1 to these
// hashes; they are pinned rather than recomputed from the header.

const MAINNET_GENESIS_HASH: Hash256 = Hash256([
    0x8a, 0xd6, 0xe3, 0x24, 0xbe, 0xc1, 0x30, 0xd4,
    0x48, 0xe3, 0x08, 0x85, 0x6d, 0x11, 0xa9, 0xd4,
    0xb5, 0xfd, 0x19, 0xc2, 0x04, 0x80, 0x07, 0x9a,
    0x00, 0xe8, 0xca, 0xc9, 0x42, 0x61, 0x00, 0x00,
]);

const REGTEST_GENESIS_HASH: Hash256 = Hash256([
    0x8f, 0x82, 0x13, 0x61, 0x10, 0x80, 0xc7, 0xa9,
    0xf0, 0xd9, 0xd2, 0x85, 0x4e, 0xef, 0x83, 0x0a,
    0xde, 0xdc, 0x04, 0xdf, 0x2d, 0x1a, 0xfa, 0x5b,
    0x3e, 0xd0, 0x20, 0x18, 0x01, 0x30, 0xc3, 0xc4,
]);

const TESTNET3_GENESIS_HASH: Hash256 = Hash256([
    0x07, 0xc5, 0xe2, 0x09, 0x09, 0x0e, 0xc6, 0x0d,
    0xb9, 0x4f, 0xca, 0xfc, 0xb9, 0xcc, 0xcc, 0xc5,
    0x12, 0x1e, 0x13, 0x3e, 0x4b, 0x9e, 0xe6, 0xaa,
    0x80, 0x88, 0x95, 0x78, 0x7d, 0x15, 0x00, 0x00,
]);

const SIMNET_GENESIS_HASH: Hash256 = Hash256([
    0xf6, 0x7a, 0xd7, 0x69, 0x5d, 0x9b, 0x66, 0x2a,
    0x72, 0xff, 0x3d, 0x8e, 0xdb, 0xbb, 0x2d, 0xe0,
    0xbf, 0xa6, 0x7b, 0x13, 0x97, 0x4b, 0xb9, 0x91,
    0x0d, 0x11, 0x6d, 0x5c, 0xbd, 0x86, 0x3e, 0x68,
]);

const SIGNET_GENESIS_HASH: Hash256 = Hash256([
    0xf6, 0x1e, 0xee, 0x3b, 0x63, 0xa3, 0x80, 0xa4,
    0x77, 0xa0, 0x63, 0xaf, 0x32, 0xb2, 0xbb, 0xc9,
    0x7c, 0x9f, 0xf9, 0xf0, 0x1f, 0x2c, 0x42, 0x25,
    0xe9, 0x73, 0x98, 0x81, 0x08, 0x00, 0x00, 0x00,
]);

const GENESIS_MERKLE_ROOT: Hash256 = Hash256([
    0xab, 0x4c, 0x83, 0xb8, 0xe4, 0x5c, 0x5b, 0xdb,
    0x44, 0x23, 0x2f, 0x17, 0xea, 0x6a, 0xf5, 0xc0,
    0x2e, 0xe0, 0x40, 0x97, 0x14, 0xc1, 0xe0, 0x9b,
    0xd8, 0xed, 0x12, 0x09, 0xb7, 0x4c, 0x04, 0xb8,
]);

const REGTEST_GENESIS_MERKLE_ROOT: Hash256 = Hash256([
    0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2,
    0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f, 0x61,
    0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32,
    0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e, 0x5e, 0x4a,
]);

/// The genesis coinbase, shared by every network.
static GENESIS_COINBASE: LazyLock<Transaction> = LazyLock::new(|| {
    let mut signature_script = GENESIS_SCRIPT_PREFIX.to_vec();
    signature_script.extend_from_slice(GENESIS_MESSAGE);
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature_script,
            sequence: u32::MAX,
        }],
        outputs: vec![TxOutput {
            value: GENESIS_REWARD,
            pk_script: GENESIS_PK_SCRIPT.to_vec(),
        }],
        lock_time: 0,
    }
});

/// Network the node participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NetworkType {
    /// Production network.
    #[default]
    Mainnet,
    /// Local regression-test network with a trivial proof-of-work limit.
    Regtest,
    /// Public test network (version 3).
    Testnet3,
    /// Simulation network for private test deployments.
    Simnet,
    /// Signed-block test network.
    Signet,
}

impl NetworkType {
    /// All known networks.
    pub const ALL: [NetworkType; 5] = [
        Self::Mainnet,
        Self::Regtest,
        Self::Testnet3,
        Self::Simnet,
        Self::Signet,
    ];

    /// Human-readable network name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Regtest => "regtest",
            Self::Testnet3 => "testnet3",
            Self::Simnet => "simnet",
            Self::Signet => "signet",
        }
    }

    /// Four-byte network identifier prepended to P2P messages.
    pub fn magic_bytes(&self) -> [u8; 4] {
        match self {
            Self::Mainnet => [0xf9, 0xbe, 0xb4, 0xd9],
            Self::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
            Self::Testnet3 => [0x0b, 0x11, 0x09, 0x07],
            Self::Simnet => [0x16, 0x1c, 0x14, 0x12],
            Self::Signet => [0x0a, 0x03, 0xcf, 0x40],
        }
    }

    /// Easiest allowed target, in compact form.
    pub fn pow_limit_bits(&self) -> u32 {
        match self {
            Self::Mainnet | Self::Testnet3 => 0x1f00_ffff,
            Self::Regtest | Self::Simnet => 0x207f_ffff,
            Self::Signet => 0x1e03_77ae,
        }
    }

    /// Hash of this network's genesis block.
    pub fn genesis_hash(&self) -> Hash256 {
        match self {
            Self::Mainnet => MAINNET_GENESIS_HASH,
            Self::Regtest => REGTEST_GENESIS_HASH,
            Self::Testnet3 => TESTNET3_GENESIS_HASH,
            Self::Simnet => SIMNET_GENESIS_HASH,
            Self::Signet => SIGNET_GENESIS_HASH,
        }
    }

    /// Merkle root carried in this network's genesis header.
    pub fn genesis_merkle_root(&self) -> Hash256 {
        match self {
            Self::Regtest => REGTEST_GENESIS_MERKLE_ROOT,
            _ => GENESIS_MERKLE_ROOT,
        }
    }

    /// Genesis header fields `(timestamp, bits, nonce)`.
    fn genesis_header_fields(&self) -> (u32, u32, u32) {
        match self {
            Self::Mainnet => (1_580_658_322, 0x1f00_ffff, 0xf9f8),
            Self::Regtest => (1_580_662_895, 0x207f_ffff, 1),
            Self::Testnet3 => (1_580_661_362, 0x1f00_ffff, 0x2_6331),
            Self::Simnet => (1_401_292_357, 0x207f_ffff, 2),
            Self::Signet => (1_598_918_400, 0x1e03_77ae, 52_613_770),
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NetworkType {
    type Err = ChainParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|n| n.name() == s)
            .ok_or_else(|| ChainParamsError::UnknownNetwork(s.to_string()))
    }
}

/// A trusted `(height, hash)` pair compiled into the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Block height pinned by this checkpoint.
    pub height: u64,
    /// Expected block hash at `height`.
    pub hash: Hash256,
}

/// Build the genesis block for a network.
pub fn genesis_block(network: NetworkType) -> Block {
    let (timestamp, bits, nonce) = network.genesis_header_fields();
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: network.genesis_merkle_root(),
            timestamp,
            bits,
            nonce,
        },
        transactions: vec![GENESIS_COINBASE.clone()],
    }
}

/// Immutable per-network constants.
#[derive(Debug, Clone)]
pub struct ChainParams {
    network: NetworkType,
    genesis_block: Block,
    genesis_hash: Hash256,
    checkpoints: Vec<Checkpoint>,
    pow_limit_bits: u32,
    max_headers_per_msg: usize,
}

impl ChainParams {
    /// Parameters for `network` with no checkpoints.
    ///
    /// No network ships compiled-in checkpoints yet; private deployments add
    /// their own with [`with_checkpoints`](Self::with_checkpoints).
    pub fn for_network(network: NetworkType) -> Self {
        Self {
            network,
            genesis_block: genesis_block(network),
            genesis_hash: network.genesis_hash(),
            checkpoints: Vec::new(),
            pow_limit_bits: network.pow_limit_bits(),
            max_headers_per_msg: MAX_HEADERS_PER_MSG,
        }
    }

    /// Mainnet parameters.
    pub fn mainnet() -> Self {
        Self::for_network(NetworkType::Mainnet)
    }

    /// Regression-test parameters.
    pub fn regtest() -> Self {
        Self::for_network(NetworkType::Regtest)
    }

    /// Replace the checkpoint list.
    ///
    /// # Errors
    ///
    /// Returns [`ChainParamsError::UnorderedCheckpoints`] unless heights are
    /// strictly increasing.
    pub fn with_checkpoints(mut self, checkpoints: Vec<Checkpoint>) -> Result<Self, ChainParamsError> {
        for pair in checkpoints.windows(2) {
            if pair[1].height <= pair[0].height {
                return Err(ChainParamsError::UnorderedCheckpoints(pair[1].height));
            }
        }
        self.checkpoints = checkpoints;
        Ok(self)
    }

    /// Override the header page size (private networks and tests).
    pub fn with_max_headers_per_msg(mut self, max: usize) -> Self {
        self.max_headers_per_msg = max.max(1);
        self
    }

    pub fn network(&self) -> NetworkType {
        self.network
    }

    pub fn genesis_block(&self) -> &Block {
        &self.genesis_block
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_hash
    }

    /// Checkpoints in increasing height order.
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn pow_limit_bits(&self) -> u32 {
        self.pow_limit_bits
    }

    pub fn max_headers_per_msg(&self) -> usize {
        self.max_headers_per_msg
    }

    /// The checkpoint pinned at exactly `height`, if any.
    pub fn checkpoint_at(&self, height: u64) -> Option<&Checkpoint> {
        self.checkpoints
            .binary_search_by_key(&height, |c| c.height)
            .ok()
            .map(|i| &self.checkpoints[i])
    }

    /// The first checkpoint strictly above `height`.
    pub fn next_checkpoint_after(&self, height: u64) -> Option<&Checkpoint> {
        let idx = self.checkpoints.partition_point(|c| c.height <= height);
        self.checkpoints.get(idx)
    }

    /// The highest checkpoint, if any.
    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }
}

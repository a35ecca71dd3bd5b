//! Double SHA-256 merkle root over transaction IDs.
//!
//! Internal nodes hash `left || right`; odd-length layers are padded by
//! duplicating the last element. An empty tree produces [`Hash256::ZERO`].

use crate::types::Hash256;

/// Hash two child nodes into their parent.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    Hash256::double_sha256(&data)
}

/// Compute the merkle root of `leaves` (typically transaction IDs).
///
/// A single leaf is its own root.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }

    let mut current = leaves.to_vec();
    while current.len() > 1 {
        current = current
            .chunks(2)
            .map(|pair| node_hash(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    current[0]
}

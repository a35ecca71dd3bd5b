//! Proof-of-work target arithmetic.
//!
//! # Compact target semantics
//!
//! The `bits` field of [`BlockHeader`] is the Bitcoin compact encoding of a
//! 256-bit target: the high byte is a base-256 exponent, the low 23 bits are
//! the mantissa, and bit 23 is a sign bit. Negative, zero, and overflowing
//! encodings are invalid.
//!
//! A header satisfies the proof-of-work rule when its decoded target is no
//! higher than the network limit and its hash, read as a little-endian
//! 256-bit integer, is at most that target. Targets are held here as
//! big-endian byte arrays so that plain array ordering is numeric ordering.
//!
//! Difficulty retargeting is not checked here; that belongs to full chain
//! validation.

use crate::error::BlockError;
use crate::types::{BlockHeader, Hash256};

/// Sign bit of the compact encoding.
const COMPACT_SIGN_BIT: u32 = 0x0080_0000;

/// Mask selecting the 23-bit mantissa.
const COMPACT_MANTISSA_MASK: u32 = 0x007f_ffff;

/// Decode compact `bits` into a big-endian 256-bit target.
///
/// Returns `None` for negative, zero, or overflowing encodings.
pub fn compact_to_target(bits: u32) -> Option<[u8; 32]> {
    let exponent = (bits >> 24) as usize;
    let mut mantissa = bits & COMPACT_MANTISSA_MASK;

    if bits & COMPACT_SIGN_BIT != 0 && mantissa != 0 {
        return None;
    }

    let mut le = [0u8; 32];
    if exponent <= 3 {
        mantissa >>= 8 * (3 - exponent);
        le[0..4].copy_from_slice(&mantissa.to_le_bytes());
    } else {
        let shift = exponent - 3;
        for (i, byte) in mantissa.to_le_bytes()[0..3].iter().enumerate() {
            if *byte == 0 {
                continue;
            }
            let pos = shift + i;
            if pos >= 32 {
                return None;
            }
            le[pos] = *byte;
        }
    }

    if le.iter().all(|b| *b == 0) {
        return None;
    }
    le.reverse();
    Some(le)
}

/// Returns `true` if `hash`, read as a little-endian integer, is at most `target`.
pub fn hash_meets_target(hash: &Hash256, target: &[u8; 32]) -> bool {
    let mut be = hash.0;
    be.reverse();
    be <= *target
}

/// Check a header against the proof-of-work rule for a network whose
/// easiest allowed target is `pow_limit_bits`.
///
/// # Errors
///
/// - [`BlockError::InvalidPoW`] if the header's bits do not decode or its
///   hash is above the target.
/// - [`BlockError::TargetAboveLimit`] if the header claims an easier target
///   than the network allows.
pub fn check_proof_of_work(header: &BlockHeader, pow_limit_bits: u32) -> Result<(), BlockError> {
    let target = compact_to_target(header.bits).ok_or(BlockError::InvalidPoW)?;
    let limit = compact_to_target(pow_limit_bits).ok_or(BlockError::InvalidPoW)?;
    if target > limit {
        return Err(BlockError::TargetAboveLimit(header.bits));
    }
    if !hash_meets_target(&header.hash(), &target) {
        return Err(BlockError::InvalidPoW);
    }
    Ok(())
}

/// Search nonces `0..=max_nonce` until the header satisfies its own target.
///
/// Modifies `header.nonce` in place. Returns `false` if no nonce in range
/// works or the bits do not decode.
pub fn mine_header(header: &mut BlockHeader, max_nonce: u32) -> bool {
    let Some(target) = compact_to_target(header.bits) else {
        return false;
    };
    for nonce in 0..=max_nonce {
        header.nonce = nonce;
        if hash_meets_target(&header.hash(), &target) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn header(bits: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: Hash256([0x42; 32]),
            merkle_root: Hash256::ZERO,
            timestamp: 1_580_662_895,
            bits,
            nonce: 0,
        }
    }

    // ------------------------------------------------------------------
    // compact_to_target
    // ------------------------------------------------------------------

    #[test]
    fn decodes_bitcoin_genesis_bits() {
        let t = compact_to_target(0x1d00_ffff).unwrap();
        let mut expected = [0u8; 32];
        expected[4] = 0xff;
        expected[5] = 0xff;
        assert_eq!(t, expected);
    }

    #[test]
    fn decodes_regtest_limit() {
        let t = compact_to_target(0x207f_ffff).unwrap();
        assert_eq!(&t[0..3], &[0x7f, 0xff, 0xff]);
        assert!(t[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn decodes_mainnet_limit() {
        let t = compact_to_target(0x1f00_ffff).unwrap();
        assert_eq!(&t[0..4], &[0x00, 0x00, 0xff, 0xff]);
    }

    #[test]
    fn small_exponent_shifts_mantissa_down() {
        // exponent 1: only the top mantissa byte survives.
        let t = compact_to_target(0x0112_3456).unwrap();
        assert_eq!(t[31], 0x12);
        assert!(t[..31].iter().all(|b| *b == 0));
    }

    #[test]
    fn rejects_negative_zero_and_overflow() {
        assert!(compact_to_target(0x01fe_dcba).is_none(), "negative");
        assert!(compact_to_target(0x0400_0000).is_none(), "zero mantissa");
        assert!(compact_to_target(0xff12_3456).is_none(), "overflow");
        assert!(compact_to_target(0x2300_ffff).is_none(), "overflow at 35 bytes");
    }

    // ------------------------------------------------------------------
    // check_proof_of_work
    // ------------------------------------------------------------------

    #[test]
    fn mined_header_passes() {
        let mut h = header(0x207f_ffff);
        assert!(mine_header(&mut h, 1_000));
        assert!(check_proof_of_work(&h, 0x207f_ffff).is_ok());
    }

    #[test]
    fn target_above_limit_rejected() {
        let mut h = header(0x207f_ffff);
        assert!(mine_header(&mut h, 1_000));
        assert_eq!(
            check_proof_of_work(&h, 0x1f00_ffff),
            Err(BlockError::TargetAboveLimit(0x207f_ffff))
        );
    }

    #[test]
    fn hard_target_rejects_unmined_header() {
        // A target with 8 leading zero bytes is essentially unreachable for nonce 0.
        let h = header(0x1800_ffff);
        assert_eq!(check_proof_of_work(&h, 0x207f_ffff), Err(BlockError::InvalidPoW));
    }

    #[test]
    fn undecodable_bits_rejected() {
        let h = header(0x01fe_dcba);
        assert_eq!(check_proof_of_work(&h, 0x207f_ffff), Err(BlockError::InvalidPoW));
    }

    proptest! {
        /// Any target that passes the check also passes every easier target.
        #[test]
        fn easier_target_never_rejects(nonce in any::<u32>()) {
            let mut h = header(0x207f_ffff);
            h.nonce = nonce;
            let hash = h.hash();
            let hard = compact_to_target(0x1f00_ffff).unwrap();
            let easy = compact_to_target(0x207f_ffff).unwrap();
            if hash_meets_target(&hash, &hard) {
                prop_assert!(hash_meets_target(&hash, &easy));
            }
        }
    }
}

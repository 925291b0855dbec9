//! Block header value type, the compact-target ("bits") encoding, and the
//! minimal transaction value used for inventory/confidence tracking.

use std::cmp::Ordering;
use std::fmt;

use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A 32-byte double-SHA256 digest.
///
/// Bytes are stored in the same order SHA256d produces them (the order used
/// on the wire and in Merkle computations). `Display`/`Debug` print the
/// conventional big-endian hex form (byte-reversed), matching how Bitcoin
/// tooling prints block/tx hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash256(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `SHA256(SHA256(data))`.
    pub fn hash(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        Hash256(out)
    }

    /// Interpret the digest as a little-endian 256-bit unsigned integer, the
    /// representation used when comparing a header hash against a target.
    pub fn to_uint(&self) -> BigUint {
        let mut be = self.0;
        be.reverse();
        BigUint::from_bytes_be(&be)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        write!(f, "{}", hex::encode(reversed))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self)
    }
}

/// The 32-bit "bits" field: a floating-point-style encoding of a 256-bit
/// proof-of-work target. `mantissa = bits & 0x00FFFFFF`, `exponent = bits >> 24`.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactTarget(pub u32);

impl CompactTarget {
    pub fn new(bits: u32) -> Self {
        CompactTarget(bits)
    }

    /// Raw 24-bit mantissa. Bit 23 is a sign flag in the original
    /// floating-point encoding; header targets are never negative, so it is
    /// treated as part of the magnitude here.
    pub fn raw_mantissa(&self) -> u32 {
        self.0 & 0x00ff_ffff
    }

    pub fn exponent(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Decode into a 256-bit unsigned target: `mantissa << (8*(exponent-3))`
    /// for `exponent > 3`, or a right-shift for `exponent <= 3`.
    pub fn decode(&self) -> BigUint {
        let mantissa = BigUint::from(self.raw_mantissa());
        let exponent = self.exponent();
        if exponent <= 3 {
            mantissa >> (8 * (3 - exponent) as usize)
        } else {
            mantissa << (8 * (exponent - 3) as usize)
        }
    }

    /// Canonical re-encoding of a 256-bit target into compact form, with the
    /// same sign-bit handling as the reference implementation: if the high
    /// bit of the 24-bit mantissa would be set, shift down by a byte and
    /// bump the exponent so the value is never read as "negative".
    pub fn encode(target: &BigUint) -> Self {
        if target.is_zero() {
            return CompactTarget(0);
        }

        let bytes = target.to_bytes_be();
        let mut size = bytes.len() as u32;
        let mut padded = [0u8; 3];
        let mut compact: u32 = if bytes.len() <= 3 {
            let start = 3 - bytes.len();
            padded[start..].copy_from_slice(&bytes);
            u32::from_be_bytes([0, padded[0], padded[1], padded[2]])
        } else {
            padded.copy_from_slice(&bytes[0..3]);
            u32::from_be_bytes([0, padded[0], padded[1], padded[2]])
        };

        if compact & 0x0080_0000 != 0 {
            compact >>= 8;
            size += 1;
        }

        CompactTarget(compact | (size << 24))
    }
}

impl fmt::Debug for CompactTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompactTarget(0x{:08x})", self.0)
    }
}

/// An 80-byte Bitcoin-family proof-of-work header.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: CompactTarget,
    pub nonce: u32,
}

impl BlockHeader {
    /// Serialize to the canonical 80-byte wire representation.
    pub fn to_bytes(&self) -> [u8; 80] {
        let mut out = [0u8; 80];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&self.prev_hash.0);
        out[36..68].copy_from_slice(&self.merkle_root.0);
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.0.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; 80]) -> Self {
        let mut version_b = [0u8; 4];
        version_b.copy_from_slice(&bytes[0..4]);
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&bytes[4..36]);
        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(&bytes[36..68]);
        let mut time_b = [0u8; 4];
        time_b.copy_from_slice(&bytes[68..72]);
        let mut bits_b = [0u8; 4];
        bits_b.copy_from_slice(&bytes[72..76]);
        let mut nonce_b = [0u8; 4];
        nonce_b.copy_from_slice(&bytes[76..80]);

        BlockHeader {
            version: i32::from_le_bytes(version_b),
            prev_hash: Hash256(prev),
            merkle_root: Hash256(merkle),
            time: u32::from_le_bytes(time_b),
            bits: CompactTarget(u32::from_le_bytes(bits_b)),
            nonce: u32::from_le_bytes(nonce_b),
        }
    }

    pub fn block_hash(&self) -> Hash256 {
        Hash256::hash(&self.to_bytes())
    }
}

impl fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHeader")
            .field("hash", &self.block_hash())
            .field("prev_hash", &self.prev_hash)
            .field("time", &self.time)
            .field("bits", &self.bits)
            .field("nonce", &self.nonce)
            .finish()
    }
}

/// An opaque, hash-addressed transaction. Script/UTXO semantics are out of
/// scope here; the node only needs to track confidence and forward payloads.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        Hash256::hash(&self.payload)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transaction({})", self.txid())
    }
}

/// `chain_work` accrues as a 256-bit unsigned integer: `work(bits) = 2^256 /
/// (target(bits) + 1)`, the expected number of hashes to find a block at
/// that difficulty.
pub fn target_to_work(bits: CompactTarget) -> BigUint {
    let target = bits.decode();
    let denom = &target + BigUint::from(1u32);
    let two_256 = BigUint::from(1u32) << 256;
    two_256 / denom
}

pub fn hash_meets_target(hash: &Hash256, target: &BigUint) -> bool {
    hash.to_uint().cmp(target) != Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x1d00ffff)]
    #[case(0x1c123456)]
    #[case(0x207fffff)]
    #[case(0x1b0404cb)]
    fn compact_round_trip_for_canonical_values(#[case] bits: u32) {
        let target = CompactTarget(bits).decode();
        let reencoded = CompactTarget::encode(&target);
        assert_eq!(reencoded.0, bits, "bits=0x{bits:08x}");
    }

    #[test]
    fn zero_compact_decodes_to_zero() {
        assert_eq!(CompactTarget(0).decode(), BigUint::zero());
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let header = BlockHeader {
            version: 1,
            prev_hash: Hash256([1u8; 32]),
            merkle_root: Hash256([2u8; 32]),
            time: 1_231_006_505,
            bits: CompactTarget(0x1d00ffff),
            nonce: 2083236893,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 80);
        let restored = BlockHeader::from_bytes(&bytes);
        assert_eq!(header, restored);
    }

    #[test]
    fn hash_display_is_byte_reversed_hex() {
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        let h = Hash256(bytes);
        let s = h.to_string();
        assert!(s.starts_with("01"));
    }

    #[test]
    fn work_increases_as_target_shrinks() {
        let easy = target_to_work(CompactTarget(0x1d00ffff));
        let hard = target_to_work(CompactTarget(0x1c00ffff));
        assert!(hard > easy);
    }
}

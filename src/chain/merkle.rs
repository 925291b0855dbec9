//! Merkle-root computation and BIP37-style partial Merkle tree (PMT)
//! decoding, used both to validate a block's own transaction set and to
//! verify SPV inclusion proofs carried in `MerkleBlock` messages.

use thiserror::Error;

use crate::chain::header::Hash256;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MerkleError {
    #[error("merkle tree requires at least one leaf")]
    Empty,
    #[error("malformed partial merkle tree: {0}")]
    Malformed(&'static str),
}

/// Fold leaves pairwise with SHA256d; duplicate the last node when a level
/// has an odd count (the standard Bitcoin Merkle-tree construction).
pub fn merkle_root(leaves: &[Hash256]) -> Result<Hash256, MerkleError> {
    if leaves.is_empty() {
        return Err(MerkleError::Empty);
    }
    let mut level: Vec<Hash256> = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = *level.last().expect("non-empty");
            level.push(last);
        }
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks_exact(2) {
            next.push(hash_pair(&pair[0], &pair[1]));
        }
        level = next;
    }
    Ok(level[0])
}

fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    Hash256::hash(&buf)
}

/// Number of nodes at a given tree height, counting from the leaves
/// (`height == 0`) upward, for `tx_count` total leaves.
fn calc_tree_width(tx_count: u32, height: u32) -> u32 {
    (tx_count + (1 << height) - 1) >> height
}

fn tree_height(tx_count: u32) -> u32 {
    let mut height = 0;
    while calc_tree_width(tx_count, height) > 1 {
        height += 1;
    }
    height
}

struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn next_bit(&mut self) -> Result<bool, MerkleError> {
        let byte_idx = self.pos / 8;
        if byte_idx >= self.bytes.len() {
            return Err(MerkleError::Malformed("flag bits exhausted"));
        }
        let bit = (self.bytes[byte_idx] >> (self.pos % 8)) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    /// Number of *whole bytes* of flag bits consumed so far, rounding up —
    /// used to check that decoding consumed exactly the bits the sender
    /// claimed modulo byte padding.
    fn bits_consumed(&self) -> usize {
        self.pos
    }
}

/// A partial Merkle tree: enough hashes and flag bits to prove a subset of
/// transactions are included in a block without shipping the whole block.
#[derive(Debug, Clone)]
pub struct PartialMerkleTree {
    pub tx_count: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
}

impl PartialMerkleTree {
    pub fn new(tx_count: u32, hashes: Vec<Hash256>, flags: Vec<u8>) -> Self {
        Self {
            tx_count,
            hashes,
            flags,
        }
    }

    /// Decode the tree, returning the reconstructed Merkle root and the
    /// matched transaction hashes in left-to-right order. Fails `Malformed`
    /// unless decoding consumes exactly all hashes and all flag bits
    /// (modulo byte padding in the final flag byte).
    pub fn extract_matches(&self) -> Result<(Hash256, Vec<Hash256>), MerkleError> {
        if self.tx_count == 0 {
            return Err(MerkleError::Malformed("zero transaction count"));
        }
        let height = tree_height(self.tx_count);
        let mut bits = BitReader::new(&self.flags);
        let mut hash_idx = 0usize;
        let mut matches = Vec::new();

        let root = self.traverse(height, 0, &mut bits, &mut hash_idx, &mut matches)?;

        if hash_idx != self.hashes.len() {
            return Err(MerkleError::Malformed("not all hashes consumed"));
        }
        // Remaining bits, if any, must be padding zero bits in the final byte.
        let consumed = bits.bits_consumed();
        let total_bits = self.flags.len() * 8;
        for i in consumed..total_bits {
            let byte_idx = i / 8;
            let bit = (self.flags[byte_idx] >> (i % 8)) & 1;
            if bit != 0 {
                return Err(MerkleError::Malformed("non-zero padding bit"));
            }
        }

        Ok((root, matches))
    }

    fn traverse(
        &self,
        height: u32,
        pos: u32,
        bits: &mut BitReader,
        hash_idx: &mut usize,
        matches: &mut Vec<Hash256>,
    ) -> Result<Hash256, MerkleError> {
        let flag = bits.next_bit()?;

        if height == 0 || !flag {
            let h = *self
                .hashes
                .get(*hash_idx)
                .ok_or(MerkleError::Malformed("hash list exhausted"))?;
            *hash_idx += 1;
            if height == 0 && flag {
                matches.push(h);
            }
            return Ok(h);
        }

        // Interior node flagged as "contains a match": recurse. The right
        // child only exists if its position is within the tree's width at
        // the child height; otherwise the left child is duplicated, exactly
        // as in a full Merkle-root fold. Bounding the right recursion to
        // `pos*2+1 < width` is what keeps a malicious peer from forcing the
        // decoder to read a right branch that doesn't exist (the classic
        // duplicated-right-branch malleability vector).
        let left = self.traverse(height - 1, pos * 2, bits, hash_idx, matches)?;
        let width = calc_tree_width(self.tx_count, height - 1);
        let right = if pos * 2 + 1 < width {
            self.traverse(height - 1, pos * 2 + 1, bits, hash_idx, matches)?
        } else {
            left
        };
        Ok(hash_pair(&left, &right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(b: u8) -> Hash256 {
        Hash256([b; 32])
    }

    #[test]
    fn merkle_root_single_leaf_is_itself() {
        let leaves = [h(1)];
        assert_eq!(merkle_root(&leaves).unwrap(), leaves[0]);
    }

    #[test]
    fn merkle_root_duplicates_last_on_odd_count() {
        let leaves = [h(1), h(2), h(3)];
        let with_dup = merkle_root(&[h(1), h(2), h(3), h(3)]).unwrap();
        let odd = merkle_root(&leaves).unwrap();
        assert_eq!(with_dup, odd);
    }

    #[test]
    fn merkle_root_empty_errors() {
        assert_eq!(merkle_root(&[]), Err(MerkleError::Empty));
    }

    #[test]
    fn pmt_round_trips_full_tree() {
        // 4 leaves, all matched: build the real tree, then build a PMT with
        // every leaf flagged and check the root matches and all are matched.
        let leaves = [h(1), h(2), h(3), h(4)];
        let root = merkle_root(&leaves).unwrap();

        // height 2 tree: root(flag=1) -> two interior nodes (flag=1 each) -> four leaves (flag=1)
        // flags bitstream, LSB-first within each byte: [1,1,1,1,1,1,1] then pad
        let flags = vec![0b0111_1111];
        let hashes = leaves.to_vec();
        let pmt = PartialMerkleTree::new(4, hashes, flags);
        let (decoded_root, matched) = pmt.extract_matches().unwrap();
        assert_eq!(decoded_root, root);
        assert_eq!(matched, leaves.to_vec());
    }

    #[test]
    fn pmt_prunes_unmatched_branch() {
        // 4 leaves; only leaf 0 matches. Tree:
        //        root (1)
        //       /         \
        //    A(1)          B(0) -> one hash (subtree hash), no recursion
        //   /    \
        // L0(1)  L1(0)
        let leaves = [h(10), h(11), h(12), h(13)];
        let expected_root = merkle_root(&leaves).unwrap();

        let b_hash = hash_pair(&leaves[2], &leaves[3]);
        let hashes = vec![leaves[0], leaves[1], b_hash];
        // bits, LSB first: root=1, A=1, L0=1, L1=0, B=0
        let mut flags_byte = 0u8;
        flags_byte |= 1 << 0; // root
        flags_byte |= 1 << 1; // A
        flags_byte |= 1 << 2; // L0 matched
                              // bit 3 (L1) = 0, bit 4 (B) = 0
        let pmt = PartialMerkleTree::new(4, hashes, vec![flags_byte]);
        let (root, matched) = pmt.extract_matches().unwrap();
        assert_eq!(root, expected_root);
        assert_eq!(matched, vec![leaves[0]]);
    }

    #[test]
    fn pmt_rejects_leftover_hashes() {
        let leaves = [h(1), h(2)];
        let extra = h(99);
        let flags = vec![0b0000_0111];
        let pmt = PartialMerkleTree::new(2, vec![leaves[0], leaves[1], extra], flags);
        assert!(matches!(
            pmt.extract_matches(),
            Err(MerkleError::Malformed(_))
        ));
    }

    #[test]
    fn pmt_rejects_non_zero_padding() {
        let leaves = [h(1), h(2)];
        // correct traversal consumes 3 bits (root=1, left=0, right=0) but we
        // set a non-zero bit in the padding region.
        let flags = vec![0b1000_0001];
        let pmt = PartialMerkleTree::new(2, vec![leaves[0]], flags);
        assert!(matches!(
            pmt.extract_matches(),
            Err(MerkleError::Malformed(_))
        ));
    }
}

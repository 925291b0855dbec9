//! The append-only header store: a `StoredBlock` per accepted header, a
//! `ChainStore` contract any backend (in-memory or persistent) implements,
//! and the common-ancestor walk used for reorg handling.

use std::collections::HashMap;
use std::time::Instant;

use arc_swap::ArcSwap;
use num_bigint::BigUint;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::chain::header::{BlockHeader, Hash256};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("block not found: {0}")]
    NotFound(Hash256),
    #[error("parent not found for header with prev_hash {0}")]
    MissingParent(Hash256),
    #[error("header already stored: {0}")]
    Duplicate(Hash256),
    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A header plus the chain metadata derived from its ancestry: height and
/// cumulative work, both computed once at insertion time so lookups never
/// re-walk the chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredBlock {
    pub header: BlockHeader,
    pub height: u64,
    #[serde(with = "work_as_bytes")]
    pub cumulative_work: BigUint,
}

impl StoredBlock {
    pub fn hash(&self) -> Hash256 {
        self.header.block_hash()
    }
}

mod work_as_bytes {
    use num_bigint::BigUint;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_bytes(&value.to_bytes_be())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<BigUint, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        Ok(BigUint::from_bytes_be(&bytes))
    }
}

/// Storage contract for the header chain. Implementations must make `put`
/// durable before returning (write-then-fsync for a persistent backend) so
/// that `head` never points at a block a crash could have lost.
pub trait ChainStore: Send + Sync {
    fn get(&self, hash: &Hash256) -> Result<StoredBlock>;
    fn contains(&self, hash: &Hash256) -> bool;
    fn put(&self, block: StoredBlock) -> Result<()>;
    fn head(&self) -> StoredBlock;
    fn set_head(&self, hash: &Hash256) -> Result<()>;

    /// Walk back `n` blocks from `from`, inclusive of `from`. Returns fewer
    /// than `n+1` entries only at genesis.
    fn walk_back(&self, from: &Hash256, n: u64) -> Result<Vec<StoredBlock>> {
        let start = Instant::now();
        let mut out = Vec::with_capacity((n + 1) as usize);
        let mut cursor = self.get(from)?;
        out.push(cursor.clone());
        for _ in 0..n {
            if cursor.header.prev_hash.is_zero() {
                break;
            }
            cursor = self.get(&cursor.header.prev_hash)?;
            out.push(cursor.clone());
        }
        let elapsed = start.elapsed();
        if elapsed.as_millis() > 50 {
            warn!(?elapsed, steps = n, "walk_back exceeded expected latency");
        }
        Ok(out)
    }

    /// Find the highest common ancestor of two chain tips, used to compute
    /// the blocks to disconnect/connect during a reorg.
    fn find_fork_point(&self, a: &Hash256, b: &Hash256) -> Result<StoredBlock> {
        let mut block_a = self.get(a)?;
        let mut block_b = self.get(b)?;

        while block_a.height > block_b.height {
            block_a = self.get(&block_a.header.prev_hash)?;
        }
        while block_b.height > block_a.height {
            block_b = self.get(&block_b.header.prev_hash)?;
        }
        while block_a.hash() != block_b.hash() {
            block_a = self.get(&block_a.header.prev_hash)?;
            block_b = self.get(&block_b.header.prev_hash)?;
        }
        Ok(block_a)
    }
}

/// In-memory `ChainStore`: a plain map guarded by a `RwLock` for writes, with
/// the current tip exposed through an `ArcSwap` so readers never block on
/// the map lock just to learn the head.
pub struct InMemoryChainStore {
    blocks: RwLock<HashMap<Hash256, StoredBlock>>,
    head: ArcSwap<StoredBlock>,
}

impl InMemoryChainStore {
    pub fn new(genesis: StoredBlock) -> Self {
        let hash = genesis.hash();
        let mut map = HashMap::new();
        map.insert(hash, genesis.clone());
        Self {
            blocks: RwLock::new(map),
            head: ArcSwap::new(std::sync::Arc::new(genesis)),
        }
    }
}

impl ChainStore for InMemoryChainStore {
    fn get(&self, hash: &Hash256) -> Result<StoredBlock> {
        self.blocks
            .read()
            .get(hash)
            .cloned()
            .ok_or(StoreError::NotFound(*hash))
    }

    fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.read().contains_key(hash)
    }

    fn put(&self, block: StoredBlock) -> Result<()> {
        let hash = block.hash();
        let mut map = self.blocks.write();
        if map.contains_key(&hash) {
            return Ok(());
        }
        if !block.header.prev_hash.is_zero() && !map.contains_key(&block.header.prev_hash) {
            return Err(StoreError::MissingParent(block.header.prev_hash));
        }
        map.insert(hash, block);
        Ok(())
    }

    fn head(&self) -> StoredBlock {
        (**self.head.load()).clone()
    }

    fn set_head(&self, hash: &Hash256) -> Result<()> {
        let block = self.get(hash)?;
        self.head.store(std::sync::Arc::new(block));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::header::CompactTarget;

    fn genesis() -> StoredBlock {
        StoredBlock {
            header: BlockHeader {
                version: 1,
                prev_hash: Hash256::ZERO,
                merkle_root: Hash256([1u8; 32]),
                time: 0,
                bits: CompactTarget(0x207fffff),
                nonce: 0,
            },
            height: 0,
            cumulative_work: BigUint::from(1u32),
        }
    }

    fn child_of(parent: &StoredBlock, nonce: u32) -> StoredBlock {
        let header = BlockHeader {
            version: 1,
            prev_hash: parent.hash(),
            merkle_root: Hash256([2u8; 32]),
            time: parent.header.time + 600,
            bits: parent.header.bits,
            nonce,
        };
        StoredBlock {
            header,
            height: parent.height + 1,
            cumulative_work: &parent.cumulative_work + BigUint::from(1u32),
        }
    }

    #[test]
    fn put_treats_duplicate_as_idempotent_success_and_rejects_orphan() {
        let g = genesis();
        let store = InMemoryChainStore::new(g.clone());
        assert!(store.put(g.clone()).is_ok());
        assert_eq!(store.get(&g.hash()).unwrap().hash(), g.hash());

        let orphan = child_of(&child_of(&genesis(), 1), 2);
        assert!(matches!(store.put(orphan), Err(StoreError::MissingParent(_))));
    }

    #[test]
    fn walk_back_stops_at_genesis() {
        let g = genesis();
        let store = InMemoryChainStore::new(g.clone());
        let c1 = child_of(&g, 1);
        store.put(c1.clone()).unwrap();

        let chain = store.walk_back(&c1.hash(), 10).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].hash(), g.hash());
    }

    #[test]
    fn find_fork_point_on_diverging_chains() {
        let g = genesis();
        let store = InMemoryChainStore::new(g.clone());
        let a1 = child_of(&g, 1);
        let b1 = child_of(&g, 2);
        store.put(a1.clone()).unwrap();
        store.put(b1.clone()).unwrap();
        let a2 = child_of(&a1, 3);
        store.put(a2.clone()).unwrap();

        let fork = store.find_fork_point(&a2.hash(), &b1.hash()).unwrap();
        assert_eq!(fork.hash(), g.hash());
    }

    #[test]
    fn set_head_updates_without_locking_the_map() {
        let g = genesis();
        let store = InMemoryChainStore::new(g.clone());
        let c1 = child_of(&g, 1);
        store.put(c1.clone()).unwrap();
        store.set_head(&c1.hash()).unwrap();
        assert_eq!(store.head().hash(), c1.hash());
    }
}

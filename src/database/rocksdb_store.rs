//! RocksDB-backed `ChainStore`: headers live in one column family keyed by
//! block hash, the head pointer in a second tiny column family so moving it
//! never touches header data. Selected behind the `persistent` feature;
//! `chain::store::InMemoryChainStore` remains the default.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, DB};

use crate::chain::header::Hash256;
use crate::chain::store::{ChainStore, Result, StoreError, StoredBlock};

const CF_HEADERS: &str = "headers";
const CF_META: &str = "meta";
const HEAD_KEY: &[u8] = b"head";

pub struct RocksDbChainStore {
    db: Arc<DB>,
    head_cache: RwLock<Hash256>,
}

impl RocksDbChainStore {
    /// Open (or create) the store at `path`. If the database is empty,
    /// `genesis` is inserted and set as head; if it already holds data,
    /// `genesis` is ignored and the existing head is loaded instead.
    pub fn open(path: impl AsRef<Path>, genesis: StoredBlock) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_HEADERS, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, path, cfs).map_err(backend_err)?;

        let genesis_hash = genesis.hash();
        {
            let meta_cf = db.cf_handle(CF_META).expect("declared above");
            if db.get_cf(meta_cf, HEAD_KEY).map_err(backend_err)?.is_none() {
                let headers_cf = db.cf_handle(CF_HEADERS).expect("declared above");
                let bytes = bincode::serialize(&genesis).map_err(backend_err)?;
                db.put_cf(headers_cf, genesis_hash.as_bytes(), bytes).map_err(backend_err)?;
                db.put_cf(meta_cf, HEAD_KEY, genesis_hash.as_bytes()).map_err(backend_err)?;
            }
        }

        let db = Arc::new(db);
        let head = Self::read_head(&db)?;
        Ok(Self {
            db,
            head_cache: RwLock::new(head),
        })
    }

    fn read_head(db: &DB) -> Result<Hash256> {
        let meta_cf = db.cf_handle(CF_META).expect("opened in constructor");
        let bytes = db
            .get_cf(meta_cf, HEAD_KEY)
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::Backend("head pointer missing".to_string()))?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        Ok(Hash256(hash))
    }

    fn headers_cf(&self) -> &ColumnFamily {
        self.db.cf_handle(CF_HEADERS).expect("opened in constructor")
    }

    fn meta_cf(&self) -> &ColumnFamily {
        self.db.cf_handle(CF_META).expect("opened in constructor")
    }
}

fn backend_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl ChainStore for RocksDbChainStore {
    fn get(&self, hash: &Hash256) -> Result<StoredBlock> {
        let bytes = self
            .db
            .get_cf(self.headers_cf(), hash.as_bytes())
            .map_err(backend_err)?
            .ok_or(StoreError::NotFound(*hash))?;
        bincode::deserialize(&bytes).map_err(backend_err)
    }

    fn contains(&self, hash: &Hash256) -> bool {
        matches!(self.db.get_cf(self.headers_cf(), hash.as_bytes()), Ok(Some(_)))
    }

    fn put(&self, block: StoredBlock) -> Result<()> {
        let hash = block.hash();
        if self.contains(&hash) {
            return Ok(());
        }
        if !block.header.prev_hash.is_zero() && !self.contains(&block.header.prev_hash) {
            return Err(StoreError::MissingParent(block.header.prev_hash));
        }
        let bytes = bincode::serialize(&block).map_err(backend_err)?;
        self.db.put_cf(self.headers_cf(), hash.as_bytes(), bytes).map_err(backend_err)?;
        Ok(())
    }

    fn head(&self) -> StoredBlock {
        let hash = *self.head_cache.read();
        self.get(&hash).expect("head always points at a stored block")
    }

    fn set_head(&self, hash: &Hash256) -> Result<()> {
        let block = self.get(hash)?;
        self.db.put_cf(self.meta_cf(), HEAD_KEY, hash.as_bytes()).map_err(backend_err)?;
        *self.head_cache.write() = block.hash();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::header::{BlockHeader, CompactTarget};
    use num_bigint::BigUint;

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

    #[test]
    fn open_twice_reuses_existing_head() {
        let dir = tempfile::tempdir().unwrap();
        let g = genesis();
        {
            let store = RocksDbChainStore::open(dir.path(), g.clone()).unwrap();
            assert_eq!(store.head().hash(), g.hash());
        }
        let reopened = RocksDbChainStore::open(dir.path(), g.clone()).unwrap();
        assert_eq!(reopened.head().hash(), g.hash());
    }

    #[test]
    fn put_and_set_head_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let g = genesis();
        let store = RocksDbChainStore::open(dir.path(), g.clone()).unwrap();

        let child_header = BlockHeader {
            version: 1,
            prev_hash: g.hash(),
            merkle_root: Hash256([2u8; 32]),
            time: 600,
            bits: g.header.bits,
            nonce: 7,
        };
        let child = StoredBlock {
            header: child_header,
            height: 1,
            cumulative_work: &g.cumulative_work + BigUint::from(1u32),
        };
        store.put(child.clone()).unwrap();
        store.set_head(&child.hash()).unwrap();
        assert_eq!(store.head().hash(), child.hash());
    }
}

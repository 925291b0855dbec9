//! Storage backend selection for the header chain. `chain::store` defines
//! the `ChainStore` contract and the always-available in-memory backend;
//! this module adds the persistent RocksDB backend behind the `persistent`
//! feature, selected at node startup by `NodeConfig`.

#[cfg(feature = "persistent")]
pub mod rocksdb_store;

pub use crate::chain::store::{ChainStore, InMemoryChainStore, StoreError, StoredBlock};

#[cfg(feature = "persistent")]
pub use rocksdb_store::RocksDbChainStore;

//! Top-level error aggregation. Each subsystem defines its own error enum
//! (`network::wire::WireError`, `chain::validator::ValidationError`,
//! `database::StoreError`, `config::ConfigError`); this module glues them
//! into one type for callers that cross module boundaries (the binary,
//! integration tests, the peer group actor).

use thiserror::Error;

use crate::chain::validator::ValidationError;
use crate::config::ConfigError;
use crate::database::StoreError;
use crate::network::wire::WireError;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("wire codec error: {0}")]
    Wire(#[from] WireError),

    #[error("header validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("chain store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("peer error: {0}")]
    Peer(String),

    #[error("sync error: {0}")]
    Sync(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;

//! Typed events surfaced to the embedder: a single broadcast stream the
//! caller reads instead of registering per-kind callbacks. Each variant is
//! self-describing.

use std::net::SocketAddr;

use crate::chain::header::{Hash256, Transaction};
use crate::chain::store::StoredBlock;

#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected { addr: SocketAddr, peer_count: usize },
    PeerDisconnected { addr: SocketAddr, peer_count: usize },
    PeersDiscovered { addrs: Vec<SocketAddr> },

    ChainDownloadStarted { peer: SocketAddr, height: u64 },
    BlockDownloaded { peer: SocketAddr, block: Box<StoredBlock>, blocks_left: u64 },
    ReorgOccurred { old_head: Hash256, new_head: Hash256, common_ancestor: Hash256 },

    TransactionSeen { peer: SocketAddr, tx: Box<Transaction> },
    ConfidenceChanged { txid: Hash256, broadcast_peers: usize },

    FilterRecomputed { rebroadcast: bool },
}

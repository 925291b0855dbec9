//! Binary entry point: loads configuration, opens the chain store, wires up
//! the peer group and chain downloader, and logs node events until the
//! process receives a shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use num_bigint::BigUint;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use btpc_header_node::chain::header::{BlockHeader, CompactTarget, Hash256};
use btpc_header_node::chain::store::{ChainStore, InMemoryChainStore, StoredBlock};
use btpc_header_node::config::NodeConfig;
use btpc_header_node::events::NodeEvent;
use btpc_header_node::network::downloader::{Downloader, NullFilterWatcher};
use btpc_header_node::network::group;

#[derive(Parser, Debug)]
#[command(name = "btpc-header-node", about = "Bitcoin-family header-chain P2P node")]
struct Cli {
    /// Path to a TOML config file layered over the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// The node doesn't model a real genesis block (out of scope: consensus
/// payload, script/UTXO); it bootstraps the chain store with a synthetic
/// root at the network's starting difficulty so header validation and
/// retargeting have a well-defined ancestor to walk back to.
fn synthetic_genesis(params: &btpc_header_node::config::NetworkParameters) -> StoredBlock {
    let bits = CompactTarget::encode(&params.max_target);
    StoredBlock {
        header: BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            time: 0,
            bits,
            nonce: 0,
        },
        height: 0,
        cumulative_work: BigUint::from(1u32),
    }
}

/// Opens the RocksDB-backed store under `persistent`, falling back to the
/// in-memory store otherwise. Both are seeded with the same synthetic
/// genesis; `RocksDbChainStore::open` ignores it once a database already
/// exists on disk.
#[cfg(feature = "persistent")]
fn open_store(
    config: &NodeConfig,
    params: &btpc_header_node::config::NetworkParameters,
) -> anyhow::Result<Arc<dyn ChainStore>> {
    use btpc_header_node::database::RocksDbChainStore;
    let store = RocksDbChainStore::open(&config.database.data_dir, synthetic_genesis(params))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "persistent"))]
fn open_store(
    _config: &NodeConfig,
    params: &btpc_header_node::config::NetworkParameters,
) -> anyhow::Result<Arc<dyn ChainStore>> {
    Ok(Arc::new(InMemoryChainStore::new(synthetic_genesis(params))))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = NodeConfig::load(cli.config.as_ref())?;
    let params = config.network_parameters();
    info!(network = ?params.id, port = params.default_port, "starting node");

    let store: Arc<dyn ChainStore> = open_store(&config, &params)?;

    let (events_tx, _events_rx) = tokio::sync::broadcast::channel::<NodeEvent>(256);
    let my_best_height = store.head().height as i32;

    let (group_handle, downloader_rx) = group::spawn(params.clone(), config.clone(), my_best_height, events_tx.clone());

    let downloader = Downloader::new(
        store.clone(),
        params.clone(),
        group_handle.clone(),
        Arc::new(NullFilterWatcher),
        events_tx.clone(),
        false,
        config.fast_catchup_time_secs as u32,
    );
    tokio::spawn(downloader.run(downloader_rx));

    let mut event_log = events_tx.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_log.recv().await {
            info!(?event, "node event");
        }
    });

    info!("node running, press ctrl-c to stop");
    signal::ctrl_c().await?;
    info!("shutdown signal received, exiting");
    Ok(())
}

use std::path::PathBuf;
use std::time::Duration;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::header::Hash256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NetworkId {
    #[default]
    Mainnet,
    Testnet3,
    Signet,
}

/// Which difficulty-exception rule a network's retarget boundary obeys,
/// selected on `NetworkParameters` instead of a per-network subclass
/// override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DifficultyPolicy {
    #[default]
    Standard,
    TestnetMinDifficulty,
    SigNetChallenge,
}

/// Everything a network's consensus rules and wire framing depend on. One
/// value per network, passed explicitly wherever it's needed instead of a
/// global singleton.
#[derive(Debug, Clone)]
pub struct NetworkParameters {
    pub id: NetworkId,
    pub magic: u32,
    pub default_port: u16,
    pub genesis_hash: Hash256,
    pub dns_seeds: Vec<String>,
    pub retarget_interval: u64,
    pub target_timespan_secs: u64,
    pub target_spacing_secs: u64,
    pub max_target: BigUint,
    pub difficulty_policy: DifficultyPolicy,
}

impl NetworkParameters {
    pub fn mainnet() -> Self {
        Self {
            id: NetworkId::Mainnet,
            magic: 0xD9B4_BEF9,
            default_port: 8333,
            genesis_hash: Hash256::ZERO,
            dns_seeds: vec![
                "seed.bitcoin.sipa.be".to_string(),
                "dnsseed.bitcoin.dashjr.org".to_string(),
                "seed.bitcoinstats.com".to_string(),
                "seed.bitcoin.jonasschnelli.ch".to_string(),
                "seed.btc.petertodd.org".to_string(),
            ],
            retarget_interval: 2016,
            target_timespan_secs: 14 * 24 * 60 * 60,
            target_spacing_secs: 600,
            max_target: max_target_mainnet(),
            difficulty_policy: DifficultyPolicy::Standard,
        }
    }

    pub fn testnet() -> Self {
        Self {
            id: NetworkId::Testnet3,
            magic: 0x0709_110B,
            default_port: 18333,
            genesis_hash: Hash256::ZERO,
            dns_seeds: vec![
                "testnet-seed.bitcoin.jonasschnelli.ch".to_string(),
                "seed.tbtc.petertodd.org".to_string(),
            ],
            retarget_interval: 2016,
            target_timespan_secs: 14 * 24 * 60 * 60,
            target_spacing_secs: 600,
            max_target: max_target_mainnet(),
            difficulty_policy: DifficultyPolicy::TestnetMinDifficulty,
        }
    }

    pub fn signet() -> Self {
        Self {
            id: NetworkId::Signet,
            magic: 0x0A03_CF40,
            default_port: 38333,
            genesis_hash: Hash256::ZERO,
            dns_seeds: vec!["seed.signet.bitcoin.sprovoost.nl".to_string()],
            retarget_interval: 2016,
            target_timespan_secs: 14 * 24 * 60 * 60,
            target_spacing_secs: 600,
            max_target: max_target_signet(),
            difficulty_policy: DifficultyPolicy::SigNetChallenge,
        }
    }

    pub fn for_id(id: NetworkId) -> Self {
        match id {
            NetworkId::Mainnet => Self::mainnet(),
            NetworkId::Testnet3 => Self::testnet(),
            NetworkId::Signet => Self::signet(),
        }
    }
}

/// `MAX_TARGET` derived from the canonical compact encoding rather than
/// typed out as raw bytes, so it can never silently diverge from
/// `CompactTarget::decode`.
fn max_target_mainnet() -> BigUint {
    crate::chain::header::CompactTarget(0x1d00ffff).decode()
}

fn max_target_signet() -> BigUint {
    crate::chain::header::CompactTarget(0x1e0377ae).decode()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub data_dir: PathBuf,
    pub cache_size_mb: usize,
    pub max_open_files: i32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_size_mb: 512,
            max_open_files: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<PathBuf>,
    pub enable_console: bool,
    pub enable_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: Some(PathBuf::from("logs/btpc-header-node.log")),
            enable_console: true,
            enable_file: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network: NetworkId,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub connect_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub use_localhost_peer_when_possible: bool,
    pub fast_catchup_time_secs: u64,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("./data"))
            .join("btpc-header-node");

        Self {
            network: NetworkId::Mainnet,
            data_dir,
            max_connections: 12,
            connect_timeout_ms: 5_000,
            ping_interval_ms: 120_000,
            use_localhost_peer_when_possible: true,
            fast_catchup_time_secs: 0,
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        if self.ping_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.ping_interval_ms))
        }
    }

    pub fn network_parameters(&self) -> NetworkParameters {
        NetworkParameters::for_id(self.network)
    }

    /// Layer defaults, an optional TOML file, then `BTPC_`-prefixed
    /// environment variables, in that order of increasing precedence.
    pub fn load(file: Option<&PathBuf>) -> Result<Self, ConfigError> {
        let defaults = NodeConfig::default();
        let defaults_value =
            config::Config::try_from(&defaults).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults_value);

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path.as_path()).required(false));
        }

        builder = builder.add_source(config::Environment::with_prefix("BTPC").separator("__"));

        let merged = builder
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        merged
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_file(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content).map_err(ConfigError::Io)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_mainnet() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.network, NetworkId::Mainnet);
        assert_eq!(cfg.network_parameters().default_port, 8333);
    }

    #[test]
    fn testnet_uses_min_difficulty_policy() {
        let params = NetworkParameters::testnet();
        assert_eq!(params.difficulty_policy, DifficultyPolicy::TestnetMinDifficulty);
    }

    #[test]
    fn zero_ping_interval_disables_keepalive() {
        let mut cfg = NodeConfig::default();
        cfg.ping_interval_ms = 0;
        assert!(cfg.ping_interval().is_none());
    }

    #[test]
    fn config_round_trips_through_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = NodeConfig::default();
        cfg.to_file(&path).unwrap();
        let loaded = NodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.network, cfg.network);
        assert_eq!(loaded.max_connections, cfg.max_connections);
    }
}

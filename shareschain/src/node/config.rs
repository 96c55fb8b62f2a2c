//! Node Configuration
//!
//! Configuration options for a Shareschain node: network selection, data
//! directory, forging parameters, mempool bound and derived-table trimming.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_FORGING_DELAY, MIN_MAX_ROLLBACK};
use crate::crypto;
use crate::types::GenesisAllocation;
use crate::ChainConfig;

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Mainnet
    Mainnet,
    /// Testnet
    Testnet,
    /// Local development
    Devnet,
}

impl Default for Network {
    fn default() -> Self {
        Self::Testnet
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Devnet => write!(f, "devnet"),
        }
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "devnet" | "dev" | "local" => Ok(Network::Devnet),
            _ => Err(format!("Unknown network: {}", s)),
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Network type (mainnet, testnet, devnet)
    pub network: Network,

    /// Data directory
    pub data_dir: PathBuf,

    /// Log level
    pub log_level: String,

    /// Run without peers
    pub offline: bool,

    /// Blocks that can be rolled back (at least 720)
    pub max_rollback: i32,

    /// Seconds to wait past a hit time to collect transactions (at most 14)
    pub forging_delay: i32,

    /// Seconds to move ahead after losing a forging race
    pub forging_speedup: i32,

    /// Maximum number of accounts forging on this node
    pub max_forgers: usize,

    /// Hex public key allowed to forge with a zero hit on testnet
    pub fake_forging_public_key: Option<String>,

    /// Mempool size (max transactions)
    pub mempool_size: usize,

    /// Trim derived tables below the rollback window
    pub trim_derived_tables: bool,

    /// Blocks between trims
    pub trim_frequency: i32,

    /// Peers asked to confirm a downloaded fork
    pub number_of_fork_confirmations: usize,

    /// Re-broadcast own unconfirmed transactions
    pub enable_transaction_rebroadcasting: bool,

    /// JSON file with genesis allocations, replacing the built-in ones
    pub genesis_file: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let chain = ChainConfig::testnet();
        Self {
            network: Network::Testnet,
            data_dir: default_data_dir(),
            log_level: "info".into(),
            offline: false,
            max_rollback: chain.max_rollback,
            forging_delay: chain.forging_delay,
            forging_speedup: chain.forging_speedup,
            max_forgers: chain.max_forgers,
            fake_forging_public_key: None,
            mempool_size: chain.max_unconfirmed_transactions,
            trim_derived_tables: chain.trim_derived_tables,
            trim_frequency: chain.trim_frequency,
            number_of_fork_confirmations: chain.number_of_fork_confirmations,
            enable_transaction_rebroadcasting: chain.enable_transaction_rebroadcasting,
            genesis_file: None,
        }
    }
}

impl NodeConfig {
    /// Create testnet configuration
    pub fn testnet(data_dir: PathBuf) -> Self {
        Self {
            network: Network::Testnet,
            data_dir,
            ..Default::default()
        }
    }

    /// Create mainnet configuration
    pub fn mainnet(data_dir: PathBuf) -> Self {
        let chain = ChainConfig::mainnet();
        Self {
            network: Network::Mainnet,
            data_dir,
            number_of_fork_confirmations: chain.number_of_fork_confirmations,
            ..Default::default()
        }
    }

    /// Create devnet configuration for local testing
    pub fn devnet(data_dir: PathBuf) -> Self {
        Self {
            network: Network::Devnet,
            data_dir,
            offline: true,
            enable_transaction_rebroadcasting: false,
            ..Default::default()
        }
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: NodeConfig = if path.extension().map_or(false, |e| e == "json") {
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            return Err(ConfigError::Parse("Only JSON config files supported currently".into()));
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .map_err(|e| ConfigError::Io(format!("Failed to create data dir: {}", e)))?;
        }

        if self.max_rollback < MIN_MAX_ROLLBACK {
            return Err(ConfigError::Invalid(format!(
                "Max rollback must be at least {}",
                MIN_MAX_ROLLBACK
            )));
        }

        if !(0..=MAX_FORGING_DELAY).contains(&self.forging_delay) {
            return Err(ConfigError::Invalid(format!(
                "Forging delay must be between 0 and {} seconds",
                MAX_FORGING_DELAY
            )));
        }

        if self.mempool_size < 1 {
            return Err(ConfigError::Invalid("Mempool size must be at least 1".into()));
        }

        if self.trim_frequency < 1 {
            return Err(ConfigError::Invalid("Trim frequency must be at least 1".into()));
        }

        if let Some(ref key) = self.fake_forging_public_key {
            parse_public_key(key)?;
        }

        Ok(())
    }

    /// Chain parameters for the selected network with this node's overrides
    pub fn chain_config(&self) -> Result<ChainConfig, ConfigError> {
        let base = match self.network {
            Network::Mainnet => ChainConfig::mainnet(),
            Network::Testnet => ChainConfig::testnet(),
            Network::Devnet => ChainConfig::devnet(),
        };
        let genesis_allocations = match &self.genesis_file {
            Some(path) => load_genesis_allocations(path)?,
            None => base.genesis_allocations.clone(),
        };
        let fake_forging_public_key = self
            .fake_forging_public_key
            .as_deref()
            .map(parse_public_key)
            .transpose()?;
        Ok(ChainConfig {
            offline: self.offline || base.offline,
            max_rollback: self.max_rollback,
            forging_delay: self.forging_delay,
            forging_speedup: self.forging_speedup,
            max_forgers: self.max_forgers,
            fake_forging_public_key,
            max_unconfirmed_transactions: self.mempool_size,
            trim_derived_tables: self.trim_derived_tables,
            trim_frequency: self.trim_frequency,
            number_of_fork_confirmations: self.number_of_fork_confirmations,
            enable_transaction_rebroadcasting: self.enable_transaction_rebroadcasting,
            genesis_allocations,
            ..base
        })
    }
}

/// Read genesis allocations from a JSON array of
/// `{"accountId": ..., "balanceKER": ...}` objects
pub fn load_genesis_allocations(path: &Path) -> Result<Vec<GenesisAllocation>, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
    let allocations: Vec<GenesisAllocation> =
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    if allocations.iter().any(|a| a.balance_ker <= 0) {
        return Err(ConfigError::Invalid("Genesis balances must be positive".into()));
    }
    Ok(allocations)
}

fn parse_public_key(key: &str) -> Result<crate::types::PublicKey, ConfigError> {
    let bytes = hex::decode(key).map_err(|e| ConfigError::Invalid(format!("Invalid public key: {}", e)))?;
    let key: crate::types::PublicKey = bytes
        .try_into()
        .map_err(|_| ConfigError::Invalid("Invalid public key length (expected 32 bytes hex)".into()))?;
    if !crypto::is_canonical_public_key(&key) {
        return Err(ConfigError::Invalid("Public key is not canonical".into()));
    }
    Ok(key)
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Get default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("shareschain"))
        .unwrap_or_else(|| PathBuf::from(".shareschain"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.max_rollback, 800);
        assert!(!config.offline);
    }

    #[test]
    fn test_devnet_config() {
        let tmp = tempdir().unwrap();
        let config = NodeConfig::devnet(tmp.path().to_path_buf());
        assert_eq!(config.network, Network::Devnet);
        let chain = config.chain_config().unwrap();
        assert!(chain.offline);
        assert_eq!(chain.genesis_allocations.len(), 1);
    }

    #[test]
    fn test_network_parse() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!("testnet".parse::<Network>().unwrap(), Network::Testnet);
        assert_eq!("devnet".parse::<Network>().unwrap(), Network::Devnet);
        assert_eq!("dev".parse::<Network>().unwrap(), Network::Devnet);
        assert!("moon".parse::<Network>().is_err());
    }

    #[test]
    fn test_config_validation() {
        let tmp = tempdir().unwrap();
        let mut config = NodeConfig::testnet(tmp.path().to_path_buf());
        assert!(config.validate().is_ok());

        config.forging_delay = 15;
        assert!(config.validate().is_err());

        config.forging_delay = 0;
        config.max_rollback = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fake_forging_key() {
        let tmp = tempdir().unwrap();
        let keys = KeyPair::from_secret_phrase("fake forger");
        let mut config = NodeConfig::testnet(tmp.path().to_path_buf());
        config.fake_forging_public_key = Some(hex::encode(keys.public_key()));
        assert_eq!(config.chain_config().unwrap().fake_forging_public_key, Some(keys.public_key()));

        config.fake_forging_public_key = Some("abcd".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_load_config() {
        let tmp = tempdir().unwrap();
        let config_path = tmp.path().join("config.json");

        let mut config = NodeConfig::testnet(tmp.path().to_path_buf());
        config.mempool_size = 50;
        config.save(&config_path).unwrap();

        let loaded = NodeConfig::load(&config_path).unwrap();
        assert_eq!(loaded.network, config.network);
        assert_eq!(loaded.mempool_size, 50);
    }

    #[test]
    fn test_genesis_file() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("genesis.json");
        std::fs::write(&path, r#"[{"accountId":"42","balanceKER":1000},{"accountId":7,"balanceKER":"5"}]"#).unwrap();

        let mut config = NodeConfig::testnet(tmp.path().to_path_buf());
        config.genesis_file = Some(path.clone());
        let chain = config.chain_config().unwrap();
        assert_eq!(chain.genesis().allocations()[0].account_id, 7);
        assert_eq!(chain.genesis().total_ker(), 1005);

        std::fs::write(&path, r#"[{"accountId":"42","balanceKER":0}]"#).unwrap();
        assert!(matches!(config.chain_config(), Err(ConfigError::Invalid(_))));
    }
}

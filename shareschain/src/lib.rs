//! Shareschain: proof-of-stake consensus and validation engine
//!
//! A single-chain proof-of-stake node core. It decides which blocks and
//! transactions are valid, which chain is canonical when two compete, and
//! when this node forges the next block.
//!
//! ## Core Features
//! - Deterministic binary and JSON codecs for blocks and transactions
//! - Hit-based forging weighted by effective balance
//! - Fork choice by cumulative difficulty with rollback to a common block
//! - Bounded mempool with priority ordering and eviction
//!
//! ## Modules
//! - `types` - Blocks, transactions, appendages and their codecs
//! - `ledger` - Account balances, keys and leases
//! - `storage` - Block storage with transaction boundaries
//! - `consensus` - Difficulty, hits and validation rules
//! - `node` - Chain state, block processing, mempool and workers
//! - `network` - Peer interfaces used by the node

pub mod consensus;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod network;
pub mod node;
pub mod storage;
pub mod time;
pub mod types;

pub use error::{BlockNotAccepted, ValidationError, ValidationResult};
pub use types::*;

use constants::*;
use crypto::KeyPair;

/// Chain parameters
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Network chain ID
    pub chain_id: i32,
    /// Testnet rules (base target, idle limit, fake forging)
    pub testnet: bool,
    /// Chain epoch in Unix milliseconds
    pub epoch_beginning_ms: i64,
    /// Blocks that can be popped off; never below 720
    pub max_rollback: i32,
    /// Seconds a forger waits past its hit time, at most 14
    pub forging_delay: i32,
    /// Seconds a forger moves ahead after losing a race
    pub forging_speedup: i32,
    /// Maximum number of local forgers
    pub max_forgers: usize,
    /// Testnet key whose hits are always zero
    pub fake_forging_public_key: Option<PublicKey>,
    /// Blocks a credit must age before it counts for forging
    pub guaranteed_balance_confirmations: i32,
    /// Mempool bound
    pub max_unconfirmed_transactions: usize,
    /// Trim derived tables below the rollback window
    pub trim_derived_tables: bool,
    /// Blocks between trims
    pub trim_frequency: i32,
    /// Peers asked to confirm a downloaded fork
    pub number_of_fork_confirmations: usize,
    /// No peers: forge regardless of the idle limit
    pub offline: bool,
    /// Last block of the known chain; below it forks need no confirmation
    pub last_known_block: i32,
    /// Re-broadcast our own unconfirmed transactions
    pub enable_transaction_rebroadcasting: bool,
    /// Balances credited at height 0
    pub genesis_allocations: Vec<GenesisAllocation>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl ChainConfig {
    /// Mainnet configuration
    pub fn mainnet() -> Self {
        Self {
            chain_id: CHAIN_ID,
            testnet: false,
            epoch_beginning_ms: EPOCH_BEGINNING_MS,
            max_rollback: 800,
            forging_delay: 0,
            forging_speedup: 3,
            max_forgers: 100,
            fake_forging_public_key: None,
            guaranteed_balance_confirmations: GUARANTEED_BALANCE_CONFIRMATIONS,
            max_unconfirmed_transactions: 2000,
            trim_derived_tables: true,
            trim_frequency: 1000,
            number_of_fork_confirmations: 2,
            offline: false,
            last_known_block: 0,
            enable_transaction_rebroadcasting: true,
            genesis_allocations: Vec::new(),
        }
    }

    /// Testnet configuration
    pub fn testnet() -> Self {
        Self {
            testnet: true,
            epoch_beginning_ms: TESTNET_EPOCH_BEGINNING_MS,
            guaranteed_balance_confirmations: TESTNET_GUARANTEED_BALANCE_CONFIRMATIONS,
            number_of_fork_confirmations: 0,
            ..Self::mainnet()
        }
    }

    /// Single-node development chain with one funded forger
    pub fn devnet() -> Self {
        Self {
            offline: true,
            enable_transaction_rebroadcasting: false,
            genesis_allocations: vec![GenesisAllocation {
                account_id: Self::devnet_forger().account_id(),
                balance_ker: MAX_BALANCE_KER / 2,
            }],
            ..Self::testnet()
        }
    }

    /// Key funded by the devnet genesis
    pub fn devnet_forger() -> KeyPair {
        KeyPair::from_secret_phrase("shareschain devnet forger")
    }

    /// Rollback window, never below the protocol minimum
    pub fn max_rollback(&self) -> i32 {
        self.max_rollback.max(MIN_MAX_ROLLBACK)
    }

    pub fn forging_delay(&self) -> i32 {
        self.forging_delay.clamp(0, MAX_FORGING_DELAY)
    }

    pub fn max_base_target(&self) -> i64 {
        if self.testnet {
            TESTNET_MAX_BASE_TARGET
        } else {
            MAX_BASE_TARGET
        }
    }

    pub fn initial_base_target(&self) -> i64 {
        if self.testnet {
            INITIAL_BASE_TARGET * 10
        } else {
            INITIAL_BASE_TARGET
        }
    }

    /// Seconds after which any hit below target may forge
    pub fn idle_forging_limit(&self) -> i32 {
        if self.testnet {
            TESTNET_IDLE_FORGING_LIMIT
        } else {
            IDLE_FORGING_LIMIT
        }
    }

    pub fn genesis(&self) -> Genesis {
        Genesis::new(
            self.genesis_allocations.clone(),
            self.epoch_beginning_ms,
            self.initial_base_target(),
        )
    }
}

/// Result type for chain operations
pub type ChainResult<T> = Result<T, ChainError>;

/// Errors that can occur in the chain engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("Codec error: {0}")]
    Codec(#[from] types::CodecError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Block not accepted: {0}")]
    Block(#[from] BlockNotAccepted),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger::LedgerError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] consensus::ConsensusError),

    #[error("Config error: {0}")]
    Config(#[from] node::config::ConfigError),

    #[error("Node error: {0}")]
    Node(#[from] node::NodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parameters() {
        let mainnet = ChainConfig::mainnet();
        let testnet = ChainConfig::testnet();
        assert_eq!(mainnet.initial_base_target(), INITIAL_BASE_TARGET);
        assert_eq!(testnet.initial_base_target(), INITIAL_BASE_TARGET * 10);
        assert_eq!(testnet.idle_forging_limit(), 300);
        assert_eq!(mainnet.max_base_target(), MAX_BASE_TARGET);
        assert_ne!(mainnet.genesis().block().id(), testnet.genesis().block().id());
    }

    #[test]
    fn test_bounds_are_clamped() {
        let config = ChainConfig {
            max_rollback: 10,
            forging_delay: 100,
            ..ChainConfig::mainnet()
        };
        assert_eq!(config.max_rollback(), MIN_MAX_ROLLBACK);
        assert_eq!(config.forging_delay(), MAX_FORGING_DELAY);
    }

    #[test]
    fn test_devnet_funds_forger() {
        let config = ChainConfig::devnet();
        let forger = ChainConfig::devnet_forger();
        assert_eq!(config.genesis().allocations()[0].account_id, forger.account_id());
    }
}

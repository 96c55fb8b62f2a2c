//! Peer interfaces used by the node
//!
//! The chain engine does not own a transport. It talks to peers through
//! two traits:
//! - `Peer` - requests the download loop sends to one remote node
//! - `Network` - the set of connected peers plus outbound broadcasts
//!
//! `NullNetwork` has no peers and drops broadcasts. `LocalNetwork` wires
//! several in-process chains together, copying every block and transaction
//! through its byte form the way a real transport would.

pub mod local;

use std::sync::Arc;

use crate::types::{Block, BlockId, Transaction};

pub use local::{LocalNetwork, LocalPeer};

/// Peer result type
pub type PeerResult<T> = Result<T, PeerError>;

/// Peer request failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    /// Timed out, disconnected or nothing useful sent
    #[error("No response from {0}")]
    NoResponse(String),

    /// The response could not be parsed
    #[error("Malformed response from {host}: {reason}")]
    Malformed { host: String, reason: String },
}

/// Milestone ids sent back by a peer looking for our common block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MilestoneBlockIds {
    pub ids: Vec<BlockId>,
    /// The requested block is the peer's last block
    pub last: bool,
}

/// A peer's view of its chain tip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerChainInfo {
    pub cumulative_difficulty: u128,
    pub height: i32,
}

/// One remote node
pub trait Peer: Send + Sync {
    fn host(&self) -> &str;

    fn is_connected(&self) -> bool;

    fn cumulative_difficulty(&self) -> PeerResult<PeerChainInfo>;

    fn milestone_block_ids(&self, last_block_id: BlockId, last_milestone_block_id: BlockId) -> PeerResult<MilestoneBlockIds>;

    fn next_block_ids(&self, block_id: BlockId, limit: usize) -> PeerResult<Vec<BlockId>>;

    /// Blocks following `block_id`, expected to match `ids`
    fn next_blocks(&self, block_id: BlockId, ids: &[BlockId]) -> PeerResult<Vec<Block>>;

    /// Stop talking to this peer
    fn blacklist(&self, reason: &str);
}

/// Connected peers and outbound broadcasts
pub trait Network: Send + Sync {
    fn connected_peers(&self) -> Vec<Arc<dyn Peer>>;

    fn broadcast_block(&self, block: &Block);

    fn broadcast_transactions(&self, transactions: &[Arc<Transaction>]);
}

/// No peers at all
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNetwork;

impl Network for NullNetwork {
    fn connected_peers(&self) -> Vec<Arc<dyn Peer>> {
        Vec::new()
    }

    fn broadcast_block(&self, _block: &Block) {}

    fn broadcast_transactions(&self, _transactions: &[Arc<Transaction>]) {}
}

//! Block storage
//!
//! Storage of the canonical chain with explicit transaction boundaries:
//! - `BlockStore` - blocks and their transactions, indexed by id and height
//! - `DerivedTable` - state computed from blocks that must follow rollbacks
//! - `Transactional` - begin/commit/rollback around one logical operation
//!
//! `MemoryBlockStore` is the in-process implementation used by the node
//! and the tests.

pub mod memory;

use std::sync::Arc;

use crate::types::{Block, BlockId, Transaction, TransactionId};

pub use memory::MemoryBlockStore;

/// Storage result type
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("Block {id} does not extend the stored chain at height {height}")]
    NotAtTip { id: BlockId, height: i32 },

    #[error("Genesis block cannot be deleted")]
    GenesisDeletion,

    #[error("Transaction state error: {0}")]
    TransactionState(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),
}

/// Explicit transaction boundary around a logical operation
pub trait Transactional {
    fn begin_transaction(&mut self) -> StorageResult<()>;
    fn commit_transaction(&mut self) -> StorageResult<()>;
    /// Discard everything since `begin_transaction`
    fn rollback_transaction(&mut self);
    fn is_in_transaction(&self) -> bool;
}

/// State derived from applied blocks
pub trait DerivedTable {
    /// Undo every change recorded above `height`
    fn rollback_to(&mut self, height: i32);
    /// Forget history below `height`; rollbacks below it become impossible
    fn trim(&mut self, height: i32);
    /// Drop all state
    fn truncate(&mut self);
}

/// Persistent block storage
pub trait BlockStore: Transactional + Send + Sync {
    fn find_block(&self, id: BlockId) -> Option<Arc<Block>>;
    fn find_block_at_height(&self, height: i32) -> Option<Arc<Block>>;
    fn find_block_id_at_height(&self, height: i32) -> Option<BlockId>;
    fn find_last_block(&self) -> Option<Arc<Block>>;
    /// Latest block whose timestamp is not after `timestamp`
    fn find_last_block_at(&self, timestamp: i32) -> Option<Arc<Block>>;
    /// True if `id` is stored at or below `height`
    fn has_block(&self, id: BlockId, height: i32) -> bool;
    /// True if `id` is confirmed at or below `height`
    fn has_transaction(&self, id: TransactionId, height: i32) -> bool;
    fn find_transaction(&self, id: TransactionId) -> Option<Arc<Transaction>>;
    /// Id of the block following `id`, if any
    fn next_block_id(&self, id: BlockId) -> Option<BlockId>;
    /// Ids of up to `limit` blocks following `id`
    fn block_ids_after(&self, id: BlockId, limit: usize) -> Vec<BlockId>;
    /// Up to `limit` blocks following `id`
    fn blocks_after(&self, id: BlockId, limit: usize) -> Vec<Arc<Block>>;
    /// Append a block linked to the current last block
    fn save_block(&mut self, block: Arc<Block>) -> StorageResult<()>;
    /// Delete `id` and everything above it; returns the new last block
    fn delete_blocks_from(&mut self, id: BlockId) -> StorageResult<Arc<Block>>;
    fn delete_all(&mut self) -> StorageResult<()>;
    fn height(&self) -> i32;
}

/// Economic-clustering block for a transaction created at `timestamp`:
/// `distance` blocks below the last block not newer than it, at least genesis
pub fn ec_block(store: &dyn BlockStore, timestamp: i32, distance: i32) -> Option<Arc<Block>> {
    let height = store.find_last_block_at(timestamp).map_or(0, |b| b.height());
    store.find_block_at_height(height.saturating_sub(distance).max(0))
}

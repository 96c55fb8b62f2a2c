//! In-memory block store

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{BlockStore, StorageError, StorageResult, Transactional};
use crate::types::{Block, BlockId, Transaction, TransactionId};

#[derive(Clone, Default)]
struct StoredChain {
    blocks: HashMap<BlockId, Arc<Block>>,
    /// Block ids indexed by height
    by_height: Vec<BlockId>,
    transactions: HashMap<TransactionId, (i32, Arc<Transaction>)>,
}

/// Block store kept entirely in memory
#[derive(Default)]
pub struct MemoryBlockStore {
    chain: StoredChain,
    saved: Option<StoredChain>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chain.by_height.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.by_height.is_empty()
    }
}

impl Transactional for MemoryBlockStore {
    fn begin_transaction(&mut self) -> StorageResult<()> {
        if self.saved.is_some() {
            return Err(StorageError::TransactionState("transaction already in progress".into()));
        }
        self.saved = Some(self.chain.clone());
        Ok(())
    }

    fn commit_transaction(&mut self) -> StorageResult<()> {
        match self.saved.take() {
            Some(_) => Ok(()),
            None => Err(StorageError::TransactionState("no transaction in progress".into())),
        }
    }

    fn rollback_transaction(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.chain = saved;
        }
    }

    fn is_in_transaction(&self) -> bool {
        self.saved.is_some()
    }
}

impl BlockStore for MemoryBlockStore {
    fn find_block(&self, id: BlockId) -> Option<Arc<Block>> {
        self.chain.blocks.get(&id).cloned()
    }

    fn find_block_at_height(&self, height: i32) -> Option<Arc<Block>> {
        self.find_block_id_at_height(height)
            .and_then(|id| self.find_block(id))
    }

    fn find_block_id_at_height(&self, height: i32) -> Option<BlockId> {
        usize::try_from(height)
            .ok()
            .and_then(|h| self.chain.by_height.get(h).copied())
    }

    fn find_last_block(&self) -> Option<Arc<Block>> {
        self.chain
            .by_height
            .last()
            .and_then(|id| self.find_block(*id))
    }

    fn find_last_block_at(&self, timestamp: i32) -> Option<Arc<Block>> {
        // timestamps strictly increase with height
        let count = self.chain.by_height.partition_point(|id| {
            self.chain
                .blocks
                .get(id)
                .map_or(false, |b| b.timestamp() <= timestamp)
        });
        count
            .checked_sub(1)
            .and_then(|h| self.chain.by_height.get(h))
            .and_then(|id| self.find_block(*id))
    }

        fn has_block(&self, id: BlockId, height: i32) -> bool {
        self.chain
            .blocks
            .get(&id)
            .map_or(false, |b| b.height() <= height)
    }

    fn has_transaction(&self, id: TransactionId, height: i32) -> bool {
        self.chain
            .transactions
            .get(&id)
            .map_or(false, |(h, _)| *h <= height)
    }

    fn find_transaction(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        self.chain.transactions.get(&id).map(|(_, tx)| tx.clone())
    }

    fn next_block_id(&self, id: BlockId) -> Option<BlockId> {
        let block = self.chain.blocks.get(&id)?;
        self.find_block_id_at_height(block.height() + 1)
    }

    fn block_ids_after(&self, id: BlockId, limit: usize) -> Vec<BlockId> {
        let Some(block) = self.chain.blocks.get(&id) else {
            return Vec::new();
        };
        let start = (block.height() + 1) as usize;
        self.chain
            .by_height
            .iter()
            .skip(start)
            .take(limit)
            .copied()
            .collect()
    }

    fn blocks_after(&self, id: BlockId, limit: usize) -> Vec<Arc<Block>> {
        self.block_ids_after(id, limit)
            .into_iter()
            .filter_map(|id| self.find_block(id))
            .collect()
    }

    fn save_block(&mut self, block: Arc<Block>) -> StorageResult<()> {
        let expected = self.chain.by_height.len() as i32;
        if block.height() != expected {
            return Err(StorageError::NotAtTip {
                id: block.id(),
                height: block.height(),
            });
        }
        if expected > 0 && self.chain.by_height.last() != Some(&block.previous_block_id()) {
            return Err(StorageError::NotAtTip {
                id: block.id(),
                height: block.height(),
            });
        }
        for tx in block.transactions() {
            self.chain
                .transactions
                .insert(tx.id(), (block.height(), tx.clone()));
        }
        self.chain.by_height.push(block.id());
        self.chain.blocks.insert(block.id(), block);
        Ok(())
    }

    fn delete_blocks_from(&mut self, id: BlockId) -> StorageResult<Arc<Block>> {
        let height = self
            .chain
            .blocks
            .get(&id)
            .map(|b| b.height())
            .ok_or(StorageError::BlockNotFound(id))?;
        if height <= 0 {
            return Err(StorageError::GenesisDeletion);
        }
        let removed = self.chain.by_height.split_off(height as usize);
        for block_id in &removed {
            if let Some(block) = self.chain.blocks.remove(block_id) {
                for tx in block.transactions() {
                    self.chain.transactions.remove(&tx.id());
                }
            }
        }
        debug!("Deleted {} blocks from height {}", removed.len(), height);
        self.find_last_block()
            .ok_or_else(|| StorageError::Corruption("no blocks left after deletion".into()))
    }

    fn delete_all(&mut self) -> StorageResult<()> {
        self.chain = StoredChain::default();
        Ok(())
    }

    fn height(&self) -> i32 {
        self.chain.by_height.len() as i32 - 1
    }
}

impl std::fmt::Debug for MemoryBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlockStore")
            .field("height", &self.height())
            .field("transactions", &self.chain.transactions.len())
            .field("in_transaction", &self.saved.is_some())
            .finish()
    }
}

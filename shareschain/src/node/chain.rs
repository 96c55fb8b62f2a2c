//! Canonical chain state
//!
//! `Blockchain` owns the block store, the ledger and the mempool behind one
//! `RwLock`. The three lock modes map onto the chain's access patterns:
//! - read: queries and answers to peers
//! - upgradable read: the forger and the download loop deciding whether to act
//! - write: every mutation, each inside exactly one storage transaction
//!
//! Blocks and transactions that must reach peers are collected in an outbox
//! while the lock is held and sent once it has been released.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::consensus::{ForgerSet, ValidationContext};
use crate::ledger::Ledger;
use crate::network::{MilestoneBlockIds, Network, NullNetwork};
use crate::constants::EC_BLOCK_DISTANCE;
use crate::storage::{self, BlockStore, StorageError};
use crate::time::Timekeeper;
use crate::types::{Block, BlockId, Genesis, Transaction, TransactionId};
use crate::{ChainConfig, ChainResult};

use super::mempool::{PoolContext, TransactionPool};
use super::NodeEvent;

/// Capacity of the node event channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;
/// Milestone ids returned per request
const MILESTONE_RESPONSE_LIMIT: usize = 10;

/// Messages queued for peers until the chain lock is released
#[derive(Debug, Default)]
pub(super) struct Outbox {
    pub(super) blocks: Vec<Arc<Block>>,
    pub(super) transactions: Vec<Arc<Transaction>>,
}

impl Outbox {
    fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.transactions.is_empty()
    }
}

/// Everything guarded by the chain lock
pub struct ChainState {
    pub(super) store: Box<dyn BlockStore>,
    pub(super) ledger: Box<dyn Ledger>,
    pub(super) last_block: Arc<Block>,
    pub(super) pool: TransactionPool,
    pub(super) last_trim_height: i32,
    pub(super) outbox: Outbox,
}

impl ChainState {
    pub fn store(&self) -> &dyn BlockStore {
        &*self.store
    }

    pub fn ledger(&self) -> &dyn Ledger {
        &*self.ledger
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    pub fn last_block(&self) -> &Arc<Block> {
        &self.last_block
    }

    pub fn height(&self) -> i32 {
        self.last_block.height()
    }

    pub fn validation_context<'a>(&'a self, config: &'a ChainConfig, now: i32) -> ValidationContext<'a> {
        ValidationContext {
            config,
            store: &*self.store,
            ledger: &*self.ledger,
            height: self.height(),
            now,
        }
    }

    /// The mempool together with the chain state it admits against
    pub(super) fn pool_parts<'a>(
        &'a mut self,
        config: &'a ChainConfig,
        now: i32,
    ) -> (&'a mut TransactionPool, PoolContext<'a>) {
        let height = self.last_block.height();
        let ctx = PoolContext {
            config,
            store: &*self.store,
            ledger: &mut *self.ledger,
            height,
            now,
        };
        (&mut self.pool, ctx)
    }

    /// Run `f` inside one store and ledger transaction.
    ///
    /// On failure both are rolled back, the mempool is restored and the
    /// last block is re-read from the store.
    pub(super) fn in_transaction<T>(
        &mut self,
        f: impl FnOnce(&mut ChainState) -> ChainResult<T>,
    ) -> ChainResult<T> {
        let pool = self.pool.clone();
        let last_trim_height = self.last_trim_height;
        self.store.begin_transaction()?;
        if let Err(e) = self.ledger.begin_transaction() {
            self.store.rollback_transaction();
            return Err(e.into());
        }
        let result = f(self).and_then(|value| {
            self.store.commit_transaction()?;
            self.ledger.commit_transaction()?;
            Ok(value)
        });
        if result.is_err() {
            self.store.rollback_transaction();
            self.ledger.rollback_transaction();
            self.pool = pool;
            self.last_trim_height = last_trim_height;
            if let Some(last) = self.store.find_last_block() {
                self.last_block = last;
            }
        }
        result
    }
}

impl std::fmt::Debug for ChainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainState")
            .field("height", &self.height())
            .field("last_block", &self.last_block.id())
            .field("pool", &self.pool)
            .finish()
    }
}

/// The node's view of the canonical chain
pub struct Blockchain {
    pub(super) config: ChainConfig,
    pub(super) genesis: Genesis,
    pub(super) timekeeper: Timekeeper,
    pub(super) state: RwLock<ChainState>,
    pub(super) forgers: Mutex<ForgerSet>,
    events: broadcast::Sender<NodeEvent>,
    network: RwLock<Arc<dyn Network>>,
}

impl Blockchain {
    /// Open the chain on `store` and `ledger`, adding the genesis block to an
    /// empty store.
    pub fn new(
        config: ChainConfig,
        timekeeper: Timekeeper,
        mut store: Box<dyn BlockStore>,
        mut ledger: Box<dyn Ledger>,
    ) -> ChainResult<Self> {
        let genesis = config.genesis();
        let genesis_block = Arc::new(genesis.block());

        let last_block = match store.find_last_block() {
            Some(last) => {
                if store.find_block_id_at_height(0) != Some(genesis_block.id()) {
                    return Err(StorageError::Corruption(
                        "Stored genesis block does not match the configured genesis".into(),
                    )
                    .into());
                }
                last
            }
            None => {
                info!("Genesis block not in database, starting from scratch");
                store.begin_transaction()?;
                ledger.begin_transaction()?;
                store.save_block(genesis_block.clone())?;
                ledger.truncate();
                genesis.apply(&mut *ledger)?;
                store.commit_transaction()?;
                ledger.commit_transaction()?;
                genesis_block.clone()
            }
        };
        info!("Genesis block {}", genesis_block.id());
        info!("Last block {} at height {}", last_block.id(), last_block.height());

        let needs_scan = last_block.height() > 0 && ledger.accounts().is_empty();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pool = TransactionPool::new(
            config.max_unconfirmed_transactions,
            config.enable_transaction_rebroadcasting,
        );
        let chain = Self {
            forgers: Mutex::new(ForgerSet::new(&config)),
            state: RwLock::new(ChainState {
                store,
                ledger,
                last_block,
                pool,
                last_trim_height: 0,
                outbox: Outbox::default(),
            }),
            config,
            genesis,
            timekeeper,
            events,
            network: RwLock::new(Arc::new(NullNetwork)),
        };
        if needs_scan {
            warn!("Ledger is empty for a non-empty chain, rescanning");
            chain.scan(0, false)?;
        }
        Ok(chain)
    }

    pub fn set_network(&self, network: Arc<dyn Network>) {
        *self.network.write() = network;
    }

    pub fn network(&self) -> Arc<dyn Network> {
        self.network.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub(super) fn emit(&self, event: NodeEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    /// Publish mempool changes and take the outbox
    pub(super) fn settle(&self, state: &mut ChainState) -> Outbox {
        let changes = state.pool.take_changes();
        if !changes.removed.is_empty() {
            self.emit(NodeEvent::TransactionsRemoved(
                changes.removed.iter().map(|tx| tx.id()).collect(),
            ));
        }
        if !changes.added.is_empty() {
            self.emit(NodeEvent::TransactionsAdded(
                changes.added.iter().map(|tx| tx.id()).collect(),
            ));
        }
        std::mem::take(&mut state.outbox)
    }

    /// Send queued messages; must run without the chain lock
    pub(super) fn flush(&self, outbox: Outbox) {
        if outbox.is_empty() {
            return;
        }
        let network = self.network();
        for block in &outbox.blocks {
            network.broadcast_block(block);
        }
        if !outbox.transactions.is_empty() {
            network.broadcast_transactions(&outbox.transactions);
        }
    }

    /// Run `f` under the write lock, then publish its side effects
    pub(super) fn with_write<T>(
        &self,
        f: impl FnOnce(&Self, &mut ChainState) -> ChainResult<T>,
    ) -> ChainResult<T> {
        let (result, outbox) = {
            let mut state = self.state.write();
            let result = f(self, &mut state);
            let outbox = self.settle(&mut state);
            (result, outbox)
        };
        self.flush(outbox);
        result
    }

    // ========== Queries ==========

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn genesis(&self) -> &Genesis {
        &self.genesis
    }

    pub fn timekeeper(&self) -> &Timekeeper {
        &self.timekeeper
    }

    pub fn last_block(&self) -> Arc<Block> {
        self.state.read().last_block.clone()
    }

    pub fn height(&self) -> i32 {
        self.state.read().height()
    }

    pub fn cumulative_difficulty(&self) -> u128 {
        self.state.read().last_block.cumulative_difficulty()
    }

    pub fn block(&self, id: BlockId) -> Option<Arc<Block>> {
        self.state.read().store.find_block(id)
    }

    pub fn block_at_height(&self, height: i32) -> Option<Arc<Block>> {
        self.state.read().store.find_block_at_height(height)
    }

    pub fn transaction(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        self.state.read().store.find_transaction(id)
    }

    /// Read access to the whole chain state
    pub fn read<T>(&self, f: impl FnOnce(&ChainState) -> T) -> T {
        f(&self.state.read())
    }

    pub fn unconfirmed_count(&self) -> usize {
        self.state.read().pool.len()
    }

    pub fn unconfirmed_transactions(&self) -> Vec<Arc<Transaction>> {
        self.state
            .read()
            .pool
            .transactions()
            .into_iter()
            .map(|e| e.transaction().clone())
            .collect()
    }

    // ========== Peer responders ==========

    /// Milestone ids for a peer looking for our common block.
    ///
    /// A known `last_block_id` is echoed back; otherwise ids are sampled
    /// every 10 blocks from the tip, or below `last_milestone_block_id`
    /// with a stride of the distance to the tip.
    pub fn milestone_block_ids(&self, last_block_id: BlockId, last_milestone_block_id: BlockId) -> MilestoneBlockIds {
        let state = self.state.read();
        let tip = state.height();
        if last_block_id != 0 {
            let my_last = state.last_block.id();
            if my_last == last_block_id || state.store.has_block(last_block_id, tip) {
                return MilestoneBlockIds {
                    ids: vec![last_block_id],
                    last: my_last == last_block_id,
                };
            }
        }
        let (mut height, jump) = if last_milestone_block_id != 0 {
            let Some(milestone) = state.store.find_block(last_milestone_block_id) else {
                debug!("Milestone block {} requested but not in chain", last_milestone_block_id);
                return MilestoneBlockIds::default();
            };
            let jump = (tip - milestone.height()).clamp(1, 1440);
            ((milestone.height() - jump).max(0), jump)
        } else if last_block_id != 0 {
            (tip, 10)
        } else {
            return MilestoneBlockIds::default();
        };
        let mut ids = Vec::new();
        while height > 0 && ids.len() < MILESTONE_RESPONSE_LIMIT {
            if let Some(id) = state.store.find_block_id_at_height(height) {
                ids.push(id);
            }
            height -= jump;
        }
        MilestoneBlockIds { ids, last: false }
    }

    /// Ids of up to `limit` blocks after `block_id`
    pub fn next_block_ids(&self, block_id: BlockId, limit: usize) -> Vec<BlockId> {
        self.state.read().store.block_ids_after(block_id, limit)
    }

    /// Blocks after `block_id`; with `ids` given, only while they match
    pub fn next_blocks(&self, block_id: BlockId, limit: usize, ids: &[BlockId]) -> Vec<Arc<Block>> {
        let blocks = self.state.read().store.blocks_after(block_id, limit);
        if ids.is_empty() {
            return blocks;
        }
        blocks
            .into_iter()
            .zip(ids)
            .take_while(|(block, id)| block.id() == **id)
            .map(|(block, _)| block)
            .collect()
    }

    pub fn genesis_block_id(&self) -> BlockId {
        self.genesis.block().id()
    }

    /// Height and id of the economic-clustering block new transactions
    /// created at `timestamp` should reference
    pub fn ec_block(&self, timestamp: i32) -> (i32, BlockId) {
        let state = self.state.read();
        storage::ec_block(&*state.store, timestamp, EC_BLOCK_DISTANCE)
            .map_or_else(|| (0, self.genesis_block_id()), |b| (b.height(), b.id()))
    }

}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Blockchain")
            .field("chain_id", &self.config.chain_id)
            .field("height", &state.height())
            .field("last_block", &state.last_block.id())
            .field("unconfirmed", &state.pool.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::storage::MemoryBlockStore;
    use crate::storage::Transactional;
    use crate::time::ManualClock;

    fn open(config: ChainConfig, store: MemoryBlockStore) -> ChainResult<Blockchain> {
        let clock = Arc::new(ManualClock::new(config.epoch_beginning_ms + 1_000_000));
        let timekeeper = Timekeeper::new(clock, config.epoch_beginning_ms);
        let ledger = MemoryLedger::new(config.guaranteed_balance_confirmations);
        Blockchain::new(config, timekeeper, Box::new(store), Box::new(ledger))
    }

    #[test]
    fn test_new_chain_starts_at_genesis() {
        let config = ChainConfig::devnet();
        let chain = open(config.clone(), MemoryBlockStore::new()).unwrap();
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.last_block().id(), config.genesis().block().id());

        let forger = ChainConfig::devnet_forger().account_id();
        let account = chain.read(|s| s.ledger().account(forger)).unwrap();
        assert_eq!(account.balance_ker, config.genesis().total_ker());
    }

    #[test]
    fn test_genesis_mismatch_is_refused() {
        let mut store = MemoryBlockStore::new();
        store.begin_transaction().unwrap();
        store.save_block(Arc::new(ChainConfig::mainnet().genesis().block())).unwrap();
        store.commit_transaction().unwrap();

        let err = open(ChainConfig::devnet(), store).unwrap_err();
        assert!(matches!(err, crate::ChainError::Storage(StorageError::Corruption(_))));
    }

    #[test]
    fn test_in_transaction_restores_on_error() {
        let chain = open(ChainConfig::devnet(), MemoryBlockStore::new()).unwrap();
        let genesis_id = chain.last_block().id();
        let result: ChainResult<()> = chain.state.write().in_transaction(|state| {
            state.store.delete_all()?;
            Err(StorageError::Corruption("forced".into()).into())
        });
        assert!(result.is_err());
        assert_eq!(chain.last_block().id(), genesis_id);
        assert_eq!(chain.block_at_height(0).map(|b| b.id()), Some(genesis_id));
        assert!(!chain.read(|s| s.store().is_in_transaction()));
    }

    #[test]
    fn test_milestones_for_known_tip() {
        let chain = open(ChainConfig::devnet(), MemoryBlockStore::new()).unwrap();
        let tip = chain.last_block().id();
        let milestones = chain.milestone_block_ids(tip, 0);
        assert_eq!(milestones.ids, vec![tip]);
        assert!(milestones.last);

        let unknown = chain.milestone_block_ids(42, 0);
        assert!(unknown.ids.is_empty());
        assert!(!unknown.last);
    }
}

//! Block processing and fork choice
//!
//! Every mutation of the canonical chain goes through here: pushing a block
//! onto the tip, popping blocks off to a common ancestor, switching to a
//! heavier fork and replaying the stored chain into a fresh ledger. Each
//! operation runs in its own storage transaction and leaves the chain on
//! its previous tip when it fails.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::consensus::validator;
use crate::constants::{BLOCK_BROADCAST_WINDOW, REBROADCAST_BATCH_SIZE, RESCAN_LOG_INTERVAL};
use crate::error::{BlockNotAccepted, ValidationError};
use crate::storage::StorageError;
use crate::types::{Block, DuplicateRegistry, Transaction, TransactionId};
use crate::{ChainError, ChainResult};

use super::chain::{Blockchain, ChainState};
use super::NodeEvent;

impl Blockchain {
    // ========== Push ==========

    /// Validate `block` against the tip and make it the new tip
    pub fn push_block(&self, block: Block) -> ChainResult<Arc<Block>> {
        self.with_write(|chain, state| chain.push_block_locked(state, block))
    }

    pub(super) fn push_block_locked(&self, state: &mut ChainState, block: Block) -> ChainResult<Arc<Block>> {
        let now = self.timekeeper.epoch_time();
        let block = state.in_transaction(|state| self.push_in(state, block, now))?;
        if block.timestamp() >= now - BLOCK_BROADCAST_WINDOW {
            state.outbox.blocks.push(block.clone());
        }
        debug!("Pushed block {} at height {}", block.id(), block.height());
        self.emit(NodeEvent::BlockPushed {
            id: block.id(),
            height: block.height(),
        });
        if !block.transactions().is_empty() {
            self.emit(NodeEvent::TransactionsConfirmed(
                block.transactions().iter().map(|tx| tx.id()).collect(),
            ));
        }
        Ok(block)
    }

    fn push_in(&self, state: &mut ChainState, mut block: Block, now: i32) -> ChainResult<Arc<Block>> {
        let previous = state.last_block.clone();
        {
            let ctx = state.validation_context(&self.config, now);
            validator::validate_block(&ctx, &block, &previous)?;

            let next_hit_time = self
                .forgers
                .lock()
                .next_hit_time(previous.id(), now, self.config.forging_delay());
            if next_hit_time > 0 && i64::from(block.timestamp()) > next_hit_time + 1 {
                let msg = format!(
                    "Rejecting block {} at height {} block timestamp {} next hit time {} current time {}",
                    block.id(),
                    previous.height() + 1,
                    block.timestamp(),
                    next_hit_time,
                    now
                );
                debug!("{}", msg);
                self.forgers.lock().set_delay(-self.config.forging_speedup);
                return Err(BlockNotAccepted::out_of_order(msg).into());
            }

            let mut duplicates = DuplicateRegistry::new();
            validator::validate_block_transactions(&ctx, &block, &previous, true, &mut duplicates)?;
        }

        let two_back_timestamp = self.two_back_timestamp(state, &previous);
        block.set_previous(&previous, two_back_timestamp, &self.config);
        state.pool.requeue_all(&mut *state.ledger, previous.height())?;

        let block = Arc::new(block);
        state.store.save_block(block.clone())?;
        state.last_block = block.clone();
        self.accept(state, &block)?;
        self.trim(state);
        Ok(block)
    }

    fn two_back_timestamp(&self, state: &ChainState, previous: &Block) -> Option<i32> {
        if previous.height() < 2 {
            return None;
        }
        state
            .store
            .find_block_at_height(previous.height() - 2)
            .map(|b| b.timestamp())
    }

    /// Apply the effects of a linked block to the ledger
    fn accept(&self, state: &mut ChainState, block: &Block) -> ChainResult<()> {
        let height = block.height();
        for tx in block.transactions() {
            if !tx.apply_unconfirmed(&mut *state.ledger, height)? {
                return Err(BlockNotAccepted::transaction(tx.id(), "Double spending").into());
            }
        }
        block.apply(&mut *state.ledger)?;
        for tx in block.transactions() {
            tx.apply(&mut *state.ledger, height)?;
        }
        Ok(())
    }

    // ========== Trimming ==========

    fn trim(&self, state: &mut ChainState) {
        if !self.config.trim_derived_tables {
            return;
        }
        let height = state.height();
        if height % self.config.trim_frequency.max(1) != 0 {
            return;
        }
        let trim_height = (height - self.config.max_rollback()).max(0);
        state.last_trim_height = trim_height;
        if trim_height > 0 {
            state.ledger.trim(trim_height);
            debug!("Trimmed derived tables below height {}", trim_height);
        }
    }

    /// Lowest height the chain can be popped off to without a rescan
    pub fn min_rollback_height(&self) -> i32 {
        self.min_rollback_height_of(&self.state.read())
    }

    fn min_rollback_height_of(&self, state: &ChainState) -> i32 {
        if !self.config.trim_derived_tables {
            return 0;
        }
        if state.last_trim_height > 0 {
            state.last_trim_height
        } else {
            (state.height() - self.config.max_rollback()).max(0)
        }
    }

    // ========== Pop-off ==========

    /// Pop blocks until `height` is the tip; a negative height resets the
    /// chain to genesis
    pub fn pop_off_to_height(&self, height: i32) -> ChainResult<Vec<Arc<Block>>> {
        if height < 0 {
            self.full_reset()?;
            return Ok(Vec::new());
        }
        self.with_write(|chain, state| {
            if height >= state.height() {
                return Ok(Vec::new());
            }
            let Some(common) = state.store.find_block_at_height(height) else {
                return Ok(Vec::new());
            };
            let popped = chain.pop_off_locked(state, &common)?;
            chain.process_later_blocks(state, &popped);
            Ok(popped)
        })
    }

    /// Pop blocks until `common` is the tip, queueing their transactions
    /// for re-admission.
    ///
    /// Returns the popped blocks, highest first.
    pub fn pop_off_to(&self, common: &Block) -> ChainResult<Vec<Arc<Block>>> {
        self.with_write(|chain, state| {
            let popped = chain.pop_off_locked(state, common)?;
            chain.process_later_blocks(state, &popped);
            Ok(popped)
        })
    }

    pub(super) fn pop_off_locked(&self, state: &mut ChainState, common: &Block) -> ChainResult<Vec<Arc<Block>>> {
        let popped = state
            .in_transaction(|state| self.pop_off_in(state, common))
            .map_err(|e| {
                error!("Error popping off to {}: {}", common.height(), e);
                e
            })?;
        for block in &popped {
            self.emit(NodeEvent::BlockPopped {
                id: block.id(),
                height: block.height(),
            });
        }
        Ok(popped)
    }

    fn pop_off_in(&self, state: &mut ChainState, common: &Block) -> ChainResult<Vec<Arc<Block>>> {
        if !state.store.has_block(common.id(), state.height()) {
            debug!("Block {} not found in blockchain, nothing to pop off", common.id());
            return Ok(Vec::new());
        }
        let mut popped = Vec::new();
        if common.height() < self.min_rollback_height_of(state) {
            info!("Rollback to height {} not supported, will do a full rescan", common.height());
            let mut block = state.last_block.clone();
            while block.height() > common.height() {
                let Some(previous) = state.store.find_block(block.previous_block_id()) else {
                    break;
                };
                popped.push(block);
                block = previous;
            }
            if let Some(first_deleted) = state.store.find_block_id_at_height(common.height() + 1) {
                state.last_block = state.store.delete_blocks_from(first_deleted)?;
                debug!("Deleted blocks starting from height {}", common.height() + 1);
            }
            self.scan_in(state, 0, false)?;
            return Ok(popped);
        }

        debug!(
            "Rollback from block {} at height {} to {} at {}",
            state.last_block.id(),
            state.height(),
            common.id(),
            common.height()
        );
        while state.last_block.id() != common.id() && state.height() > 0 {
            popped.push(state.last_block.clone());
            self.pop_last_block_in(state)?;
        }
        state.pool.requeue_above(common.height());
        state.ledger.rollback_to(common.height());
        Ok(popped)
    }

    fn pop_last_block_in(&self, state: &mut ChainState) -> ChainResult<Arc<Block>> {
        let block = state.last_block.clone();
        if block.height() == 0 {
            return Err(StorageError::GenesisDeletion.into());
        }
        let previous = state.store.delete_blocks_from(block.id())?;
        state.last_block = previous.clone();
        Ok(previous)
    }

    /// Pop the tip, queueing its transactions for re-admission; returns
    /// the new tip
    pub fn pop_last_block(&self) -> ChainResult<Arc<Block>> {
        self.with_write(|chain, state| {
            let block = state.last_block.clone();
            let previous = state.in_transaction(|state| {
                let previous = chain.pop_last_block_in(state)?;
                state.pool.requeue_above(previous.height());
                state.ledger.rollback_to(previous.height());
                Ok(previous)
            })?;
            chain.emit(NodeEvent::BlockPopped {
                id: block.id(),
                height: block.height(),
            });
            chain.process_later(state, block.transactions().to_vec());
            Ok(previous)
        })
    }

    /// Delete every block and restart from genesis
    pub fn full_reset(&self) -> ChainResult<()> {
        self.with_write(|chain, state| {
            info!("Deleting blockchain...");
            state.in_transaction(|state| {
                state.store.delete_all()?;
                let genesis = Arc::new(chain.genesis.block());
                state.store.save_block(genesis.clone())?;
                state.last_block = genesis;
                state.last_trim_height = 0;
                state.pool.requeue_above(-1);
                state.ledger.truncate();
                chain.genesis.apply(&mut *state.ledger)?;
                Ok(())
            })
        })
    }

    /// Queue the transactions of popped blocks for re-admission
    pub(super) fn process_later(&self, state: &mut ChainState, transactions: Vec<Arc<Transaction>>) {
        let height = state.height();
        state
            .pool
            .process_later(&*state.store, transactions, &self.timekeeper, height);
    }

    fn process_later_blocks(&self, state: &mut ChainState, blocks: &[Arc<Block>]) {
        for block in blocks {
            self.process_later(state, block.transactions().to_vec());
        }
    }

    // ========== Rescan ==========

    /// Rebuild derived state by replaying stored blocks from `height`.
    ///
    /// With `validate` set every block is checked again, including its
    /// byte and JSON round-trips. A block that fails is deleted together
    /// with everything above it.
    pub fn scan(&self, height: i32, validate: bool) -> ChainResult<()> {
        self.with_write(|chain, state| state.in_transaction(|state| chain.scan_in(state, height, validate)))
    }

    fn scan_in(&self, state: &mut ChainState, height: i32, validate: bool) -> ChainResult<()> {
        let tip = state.store.height();
        if height > tip + 1 {
            info!(
                "Rollback height {} exceeds current blockchain height of {}, no scan needed",
                height - 1,
                tip
            );
            return Ok(());
        }
        let mut height = height;
        if height > 0 && height < self.min_rollback_height_of(state) {
            warn!("Rollback to height {} not supported, will do a full scan", height - 1);
            height = 0;
        }
        if height == 0 {
            info!("Dropping all derived tables");
            state.pool.requeue_above(-1);
            state.ledger.truncate();
            state.last_trim_height = 0;
        } else {
            state.pool.requeue_above(height - 1);
            state.ledger.rollback_to(height - 1);
            state.pool.requeue_all(&mut *state.ledger, height - 1)?;
        }

        self.emit(NodeEvent::RescanBegin(height));
        info!("Scanning blockchain starting from height {}...", height);
        if validate {
            info!("Also verifying signatures and validating transactions...");
        }

        if height > 0 {
            match state.store.find_block_at_height(height - 1) {
                Some(previous) => state.last_block = previous,
                None => {
                    return Err(StorageError::Corruption(format!("No block at height {}", height - 1)).into());
                }
            }
        }

        let mut current = height;
        while let Some(block) = state.store.find_block_at_height(current) {
            let replayed = if current == 0 {
                self.replay_genesis(state, &block)
            } else {
                self.replay(state, &block, validate)
            };
            if let Err(e) = replayed {
                if current == 0 {
                    return Err(e);
                }
                error!("Rescan failed at block {} height {}: {}", block.id(), current, e);
                state.last_block = state.store.delete_blocks_from(block.id())?;
                state.ledger.rollback_to(current - 1);
                info!("Deleted blocks starting from height {}", current);
                break;
            }
            state.last_block = block;
            self.trim(state);
            if current % RESCAN_LOG_INTERVAL == 0 {
                info!("processed block {}", current);
            }
            current += 1;
        }

        info!("...done at height {}", state.height());
        self.emit(NodeEvent::RescanEnd(state.height()));
        Ok(())
    }

    fn replay_genesis(&self, state: &mut ChainState, block: &Arc<Block>) -> ChainResult<()> {
        if block.generation_signature() != &self.genesis.generation_signature() {
            return Err(StorageError::Corruption("Database blocks in the wrong order!".into()).into());
        }
        self.genesis.apply(&mut *state.ledger)?;
        Ok(())
    }

    fn replay(&self, state: &mut ChainState, block: &Arc<Block>, validate: bool) -> ChainResult<()> {
        let previous = state.last_block.clone();
        if block.previous_block_id() != previous.id() {
            return Err(StorageError::Corruption("Database blocks in the wrong order!".into()).into());
        }
        {
            let now = self.timekeeper.epoch_time();
            let ctx = state.validation_context(&self.config, now);
            if validate {
                validator::validate_block(&ctx, block, &previous)?;
                check_round_trips(block)?;
            }
            let mut duplicates = DuplicateRegistry::new();
            validator::validate_block_transactions(&ctx, block, &previous, validate, &mut duplicates)?;
        }
        self.accept(state, block)
    }

    // ========== Forks ==========

    /// Replace the chain above `common` with `fork_blocks` if that yields a
    /// higher cumulative difficulty; otherwise restore our own blocks.
    pub(super) fn process_fork_locked(
        &self,
        state: &mut ChainState,
        fork_blocks: Vec<Block>,
        common: &Block,
    ) -> ChainResult<()> {
        let current_difficulty = state.last_block.cumulative_difficulty();
        let my_popped = self.pop_off_locked(state, common)?;

        let mut pushed = 0usize;
        let mut failure: Option<ChainError> = None;
        if state.last_block.id() == common.id() {
            for block in fork_blocks {
                if state.last_block.id() != block.previous_block_id() {
                    continue;
                }
                match self.push_block_locked(state, block) {
                    Ok(_) => pushed += 1,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        if pushed > 0 && state.last_block.cumulative_difficulty() <= current_difficulty {
            let lower = state.last_block.clone();
            let fork_popped = self.pop_off_locked(state, common)?;
            pushed = 0;
            self.process_later_blocks(state, &fork_popped);
            if failure.is_none() {
                failure = Some(
                    BlockNotAccepted::LowerDifficulty(format!(
                        "Fork ending at block {} height {} does not beat our cumulative difficulty",
                        lower.id(),
                        lower.height()
                    ))
                    .into(),
                );
            }
        }

        if pushed == 0 {
            debug!("Didn't accept any blocks, pushing back my previous blocks");
            for block in my_popped.iter().rev() {
                if let Err(e) = self.push_block_locked(state, Block::clone(block)) {
                    error!("Popped off block no longer acceptable: {} {}", block.id(), e);
                    break;
                }
            }
        } else {
            debug!("Switched to node's fork");
            self.process_later_blocks(state, &my_popped);
        }

        failure.map_or(Ok(()), Err)
    }

    /// Fork resolution for blocks that branch off at `common`
    pub fn process_fork(&self, fork_blocks: Vec<Block>, common: &Block) -> ChainResult<()> {
        self.with_write(|chain, state| chain.process_fork_locked(state, fork_blocks, common))
    }

    /// A single block announced by a peer.
    ///
    /// It is pushed if it extends the tip. A block with the same parent as
    /// the tip and an earlier timestamp replaces the tip; if it fails, the
    /// old tip is pushed back. Anything else is ignored.
    pub fn process_node_block(&self, block: Block) -> ChainResult<()> {
        self.with_write(|chain, state| {
            let last = state.last_block.clone();
            if block.previous_block_id() == last.id() {
                chain.push_block_locked(state, block)?;
                return Ok(());
            }
            if block.previous_block_id() != last.previous_block_id() || block.timestamp() >= last.timestamp() {
                return Ok(());
            }
            let Some(previous) = state.store.find_block(last.previous_block_id()) else {
                return Ok(());
            };
            let popped = chain.pop_off_locked(state, &previous)?;
            let Some(old_tip) = popped.into_iter().next() else {
                return Ok(());
            };
            let new_id = block.id();
            let new_transactions = block.transactions().to_vec();
            match chain.push_block_locked(state, block) {
                Ok(_) => {
                    chain.process_later(state, old_tip.transactions().to_vec());
                    debug!("Last block {} was replaced by {}", old_tip.id(), new_id);
                    Ok(())
                }
                Err(e) => {
                    debug!("Replacement block failed to be accepted, pushing back our last block");
                    chain.push_block_locked(state, Block::clone(&old_tip))?;
                    chain.process_later(state, new_transactions);
                    Err(e)
                }
            }
        })
    }

    /// A two-block fork announced by a peer, branching off below our tip
    pub fn process_node_blocks(&self, blocks: Vec<Block>) -> ChainResult<()> {
        if blocks.len() != 2 {
            return Ok(());
        }
        self.with_write(|chain, state| {
            let last = state.last_block.clone();
            let Some(common) = state.store.find_block(last.previous_block_id()) else {
                return Ok(());
            };
            if blocks[0].previous_block_id() != common.id() {
                return Ok(());
            }
            chain.process_fork_locked(state, blocks, &common)
        })
    }

    // ========== Unconfirmed transactions ==========

    /// Admit one of our own transactions and send it to peers
    pub fn broadcast_transaction(&self, tx: Arc<Transaction>) -> ChainResult<()> {
        if !tx.verify_signature() {
            return Err(ValidationError::not_valid("Transaction signature verification failed").into());
        }
        self.with_write(|chain, state| {
            let now = chain.timekeeper.epoch_time();
            let arrival = chain.timekeeper.millis();
            state.in_transaction(|state| {
                let (pool, mut ctx) = state.pool_parts(&chain.config, now);
                let is_new = pool.broadcast(&mut ctx, tx.clone(), arrival)?;
                if is_new {
                    state.outbox.transactions.push(tx);
                }
                Ok(())
            })
        })
    }

    /// Admit transactions received from a peer.
    ///
    /// Accepted ones are forwarded; the first permanent failure is returned
    /// so the caller can report the peer.
    pub fn process_node_transactions(&self, transactions: Vec<Arc<Transaction>>) -> ChainResult<Vec<Arc<Transaction>>> {
        let received = self.with_write(|chain, state| {
            let now = chain.timekeeper.epoch_time();
            let arrival = chain.timekeeper.millis();
            state.in_transaction(|state| {
                let (pool, mut ctx) = state.pool_parts(&chain.config, now);
                let received = pool.process_node_transactions(&mut ctx, transactions, arrival);
                state.outbox.transactions.extend(received.accepted.iter().cloned());
                Ok(received)
            })
        })?;
        match received.errors.into_iter().next() {
            Some(e) => Err(e.into()),
            None => Ok(received.accepted),
        }
    }

    /// Retry transactions that were not currently valid
    pub fn process_waiting_transactions(&self) -> ChainResult<usize> {
        if self.state.read().pool.waiting_len() == 0 {
            return Ok(0);
        }
        self.with_write(|chain, state| chain.process_waiting_locked(state))
    }

    pub(super) fn process_waiting_locked(&self, state: &mut ChainState) -> ChainResult<usize> {
        if state.pool.waiting_len() == 0 {
            return Ok(0);
        }
        let now = self.timekeeper.epoch_time();
        let now_ms = self.timekeeper.millis();
        state.in_transaction(|state| {
            let (pool, mut ctx) = state.pool_parts(&self.config, now);
            Ok(pool.process_waiting(&mut ctx, now_ms))
        })
    }

    pub fn remove_expired_transactions(&self) -> ChainResult<usize> {
        self.with_write(|chain, state| {
            let now = chain.timekeeper.epoch_time();
            state.in_transaction(|state| {
                let height = state.height();
                Ok(state.pool.remove_expired(&mut *state.ledger, height, now)?)
            })
        })
    }

    pub(super) fn remove_unconfirmed_locked(&self, state: &mut ChainState, ids: &[TransactionId]) -> ChainResult<usize> {
        state.in_transaction(|state| {
            let height = state.height();
            Ok(state.pool.remove(&mut *state.ledger, ids, height)?)
        })
    }

    pub fn remove_unconfirmed_transactions(&self, ids: &[TransactionId]) -> ChainResult<usize> {
        self.with_write(|chain, state| chain.remove_unconfirmed_locked(state, ids))
    }

    /// Drop every unconfirmed and waiting transaction
    pub fn clear_unconfirmed_transactions(&self) -> ChainResult<()> {
        self.with_write(|_, state| {
            state.in_transaction(|state| {
                let height = state.height();
                state.pool.clear(&mut *state.ledger, height)?;
                Ok(())
            })
        })
    }

    /// Send our own pending transactions again, in batches
    pub fn rebroadcast_transactions(&self) -> usize {
        let due = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let height = state.height();
            let now = self.timekeeper.epoch_time();
            state.pool.rebroadcast_candidates(&*state.store, height, now)
        };
        if due.is_empty() {
            return 0;
        }
        let network = self.network();
        for batch in due.chunks(REBROADCAST_BATCH_SIZE) {
            network.broadcast_transactions(batch);
        }
        debug!("Rebroadcast {} transactions", due.len());
        due.len()
    }
}

/// Re-parse a stored block and compare it with the original
fn check_round_trips(block: &Block) -> ChainResult<()> {
    let transactions = block
        .transactions()
        .iter()
        .map(|tx| Transaction::parse(tx.bytes()).map(Arc::new))
        .collect::<Result<Vec<_>, _>>()?;
    let parsed = Block::parse(block.bytes(), transactions)?;
    if parsed.bytes() != block.bytes() {
        return Err(BlockNotAccepted::rejected("Block bytes do not match after parsing").into());
    }
    let from_json = Block::from_json(&block.to_json())?;
    if from_json.bytes() != block.bytes() {
        return Err(BlockNotAccepted::rejected("Block JSON does not match its bytes").into());
    }
    for tx in block.transactions() {
        let from_json = Transaction::from_json(&tx.to_json())?;
        if from_json.bytes() != tx.bytes() {
            return Err(BlockNotAccepted::transaction(tx.id(), "Transaction JSON does not match its bytes").into());
        }
    }
    Ok(())
}

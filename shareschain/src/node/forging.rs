//! Local block generation
//!
//! The forging loop runs every half second under the upgradable chain lock.
//! It recomputes the local forgers whenever the tip changes, may pop the
//! tip when one of them can produce an earlier block, and upgrades to the
//! write lock only to generate. The forger mutex is always released before
//! the chain lock is upgraded.

use std::sync::Arc;

use parking_lot::RwLockUpgradableReadGuard;
use tracing::{debug, error, info};

use crate::consensus::{forger, validator, ForgerSet};
use crate::constants::{FORGING_RETRY_SECONDS, FORK_REPLACEMENT_WINDOW, KER_PER_SCTK};
use crate::crypto::KeyPair;
use crate::error::BlockNotAccepted;
use crate::types::{AccountId, Block, BlockTemplate};
use crate::{ChainError, ChainResult};

use super::chain::{Blockchain, ChainState};
use super::NodeEvent;

/// Forgers whose deadline is within this many seconds are logged
const DEADLINE_LOG_WINDOW: i64 = 60;

/// A local forger as seen by callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgerInfo {
    pub account_id: AccountId,
    pub deadline: i64,
    pub hit_time: i64,
    pub effective_balance: i64,
}

impl Blockchain {
    // ========== Forger management ==========

    /// Start forging with `keys`; returns the forger's account id
    pub fn start_forging(&self, keys: KeyPair) -> ChainResult<AccountId> {
        let (account_id, is_new) = self.forgers.lock().start(keys)?;
        if is_new {
            info!("Account {} started forging", account_id);
            self.emit(NodeEvent::ForgingStarted(account_id));
        }
        Ok(account_id)
    }

    pub fn stop_forging(&self, account_id: AccountId) -> bool {
        let stopped = self.forgers.lock().stop(account_id).is_some();
        if stopped {
            info!("Account {} stopped forging", account_id);
            self.emit(NodeEvent::ForgingStopped(account_id));
        }
        stopped
    }

    /// Stop every local forger; returns how many were running
    pub fn stop_all_forging(&self) -> usize {
        let stopped = self.forgers.lock().stop_all();
        for account_id in &stopped {
            self.emit(NodeEvent::ForgingStopped(*account_id));
        }
        stopped.len()
    }

    /// Local forgers in the order they get to forge
    pub fn forgers(&self) -> Vec<ForgerInfo> {
        let state = self.state.read();
        let mut forgers = self.forgers.lock();
        if forgers.is_stale(state.last_block.id()) {
            forgers.refresh(&state.last_block, &*state.ledger, &self.config);
        }
        forgers.sorted_forgers().into_iter().map(forger_info).collect()
    }

    pub fn forger(&self, account_id: AccountId) -> Option<ForgerInfo> {
        self.forgers.lock().get(account_id).map(forger_info)
    }

    /// Earliest hit time of a local forger on top of the tip, or 0
    pub fn next_hit_time(&self) -> i64 {
        let last_block_id = self.state.read().last_block.id();
        self.forgers.lock().next_hit_time(
            last_block_id,
            self.timekeeper.epoch_time(),
            self.config.forging_delay(),
        )
    }

    // ========== Generation ==========

    /// Forge and push a block at `timestamp` on top of the tip
    pub fn generate_block(&self, keys: &KeyPair, timestamp: i32) -> ChainResult<Arc<Block>> {
        self.with_write(|chain, state| chain.generate_block_locked(state, keys, timestamp))
    }

    pub(super) fn generate_block_locked(
        &self,
        state: &mut ChainState,
        keys: &KeyPair,
        timestamp: i32,
    ) -> ChainResult<Arc<Block>> {
        self.process_waiting_locked(state)?;

        let previous = state.last_block.clone();
        let now = self.timekeeper.epoch_time();
        let transactions = {
            let ctx = state.validation_context(&self.config, now);
            state.pool.select_for_block(&ctx, &previous, timestamp)
        };
        let template = BlockTemplate {
            version: validator::block_version(previous.height()),
            timestamp,
            previous_block_id: previous.id(),
            previous_block_hash: previous.hash(),
            generation_signature: forger::generation_signature(&previous, &keys.public_key()),
            transactions,
        };
        let block = Block::forge(template, keys);

        match self.push_block_locked(state, block) {
            Ok(block) => {
                self.emit(NodeEvent::BlockGenerated {
                    id: block.id(),
                    height: block.height(),
                    generator: block.generator_id(),
                });
                info!(
                    "Account {} generated block {} at height {} timestamp {} fee {}",
                    block.generator_id(),
                    block.id(),
                    block.height(),
                    block.timestamp(),
                    block.total_fee_ker() as f64 / KER_PER_SCTK as f64
                );
                Ok(block)
            }
            Err(ChainError::Block(BlockNotAccepted::TransactionRejected { transaction_id, reason })) => {
                debug!("Generate block failed: {}", reason);
                self.process_waiting_locked(state)?;
                debug!("Removing invalid transaction: {}", transaction_id);
                self.remove_unconfirmed_locked(state, &[transaction_id])?;
                Err(BlockNotAccepted::TransactionRejected { transaction_id, reason }.into())
            }
            Err(e) => {
                error!("Generate block failed: {}", e);
                Err(e)
            }
        }
    }

    /// One pass of the forging loop.
    ///
    /// Returns the block generated in this pass, if any.
    pub fn forge_tick(&self) -> ChainResult<Option<Arc<Block>>> {
        let now = self.timekeeper.epoch_time();
        if now < 0 {
            return Ok(None);
        }
        let state = self.state.upgradable_read();
        if state.height() < self.config.last_known_block {
            return Ok(None);
        }

        let (generation_limit, pop_to) = {
            let mut forgers = self.forgers.lock();
            if forgers.is_empty() {
                return Ok(None);
            }
            let generation_limit = now - forgers.delay();
            let mut pop_to = None;
            if forgers.is_stale(state.last_block.id()) {
                pop_to = self.earlier_block_possible(&state, &mut forgers, now, generation_limit);
                if pop_to.is_none() {
                    forgers.refresh(&state.last_block, &*state.ledger, &self.config);
                    self.log_deadlines(&forgers, generation_limit);
                }
            }
            (generation_limit, pop_to)
        };

        let (state, popped_outbox) = match pop_to {
            Some(previous) => {
                let mut state = RwLockUpgradableReadGuard::upgrade(state);
                debug!("Popping off last block {} to forge an earlier one", state.last_block.id());
                let popped = self.pop_off_locked(&mut state, &previous)?;
                for block in &popped {
                    self.process_later(&mut state, block.transactions().to_vec());
                }
                let outbox = self.settle(&mut state);
                let state = parking_lot::RwLockWriteGuard::downgrade_to_upgradable(state);
                let mut forgers = self.forgers.lock();
                forgers.refresh(&state.last_block, &*state.ledger, &self.config);
                self.log_deadlines(&forgers, generation_limit);
                drop(forgers);
                (state, Some(outbox))
            }
            None => (state, None),
        };

        let candidate = {
            let forgers = self.forgers.lock();
            let last_block = &state.last_block;
            let mut candidate = None;
            for f in forgers.sorted_forgers() {
                if f.hit_time() > i64::from(generation_limit) {
                    break;
                }
                let timestamp = f.timestamp(generation_limit);
                if forger::verify_hit(f.hit(), f.effective_balance(), last_block, timestamp, &self.config) {
                    candidate = Some((f.keys().clone(), timestamp));
                    break;
                }
                debug!(
                    "{} failed to forge at {} height {} last timestamp {}",
                    f,
                    timestamp,
                    last_block.height(),
                    last_block.timestamp()
                );
            }
            candidate
        };
        let Some((keys, timestamp)) = candidate else {
            drop(state);
            if let Some(outbox) = popped_outbox {
                self.flush(outbox);
            }
            return Ok(None);
        };

        let (result, outbox) = {
            let mut state = RwLockUpgradableReadGuard::upgrade(state);
            let started = self.timekeeper.epoch_time();
            let result = loop {
                match self.generate_block_locked(&mut state, &keys, timestamp) {
                    Ok(block) => {
                        self.forgers.lock().set_delay(self.config.forging_delay());
                        break Ok(Some(block));
                    }
                    Err(ChainError::Block(BlockNotAccepted::TransactionRejected { .. }))
                        if self.timekeeper.epoch_time() - started <= FORGING_RETRY_SECONDS => {}
                    Err(e) => break Err(e),
                }
            };
            let outbox = self.settle(&mut state);
            (result, outbox)
        };
        if let Some(popped) = popped_outbox {
            self.flush(popped);
        }
        self.flush(outbox);
        result
    }

    /// Block to pop back to when a local forger could have produced an
    /// earlier block than the current tip.
    ///
    /// Forgers are left computed against that block.
    fn earlier_block_possible(
        &self,
        state: &ChainState,
        forgers: &mut ForgerSet,
        now: i32,
        generation_limit: i32,
    ) -> Option<Arc<Block>> {
        let last_block = &state.last_block;
        if last_block.height() == 0 || last_block.timestamp() <= now - FORK_REPLACEMENT_WINDOW {
            return None;
        }
        let previous = state.store.find_block(last_block.previous_block_id())?;
        forgers.set_last_block_all(&previous, &*state.ledger, &self.config);
        let earlier = forgers.forgers().find(|f| {
            let timestamp = f.timestamp(generation_limit);
            timestamp != generation_limit && f.hit_time() > 0 && timestamp < last_block.timestamp()
        });
        match earlier {
            Some(f) => {
                debug!("Pop off: {} will pop off last block {}", f, last_block.id());
                Some(previous)
            }
            None => None,
        }
    }

    fn log_deadlines(&self, forgers: &ForgerSet, generation_limit: i32) {
        for f in forgers.sorted_forgers() {
            if f.hit_time() - i64::from(generation_limit) > DEADLINE_LOG_WINDOW {
                break;
            }
            debug!("{}", f);
            self.emit(NodeEvent::GenerationDeadline {
                account_id: f.account_id(),
                deadline: f.deadline(),
            });
        }
    }
}

fn forger_info(f: &forger::Forger) -> ForgerInfo {
    ForgerInfo {
        account_id: f.account_id(),
        deadline: f.deadline(),
        hit_time: f.hit_time(),
        effective_balance: f.effective_balance(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DEFAULT_FEE_KER, NEW_ACCOUNT_FEE_KER};
    use crate::ledger::MemoryLedger;
    use crate::network::LocalNetwork;
    use crate::storage::MemoryBlockStore;
    use crate::time::{ManualClock, Timekeeper};
    use crate::types::{Attachment, TransactionBuilder};
    use crate::ChainConfig;

    fn open(clock: &Arc<ManualClock>) -> Arc<Blockchain> {
        let config = ChainConfig::devnet();
        let timekeeper = Timekeeper::new(clock.clone(), config.epoch_beginning_ms);
        let ledger = MemoryLedger::new(config.guaranteed_balance_confirmations);
        Arc::new(Blockchain::new(config, timekeeper, Box::new(MemoryBlockStore::new()), Box::new(ledger)).unwrap())
    }

    #[test]
    fn test_forger_replaces_late_tip_and_broadcasts() {
        let config = ChainConfig::devnet();
        let keys = ChainConfig::devnet_forger();
        let clock = Arc::new(ManualClock::new(config.epoch_beginning_ms + 1_000_000));
        let chain = open(&clock);
        let peer = open(&clock);
        let network = LocalNetwork::new();
        network.add_peer("peer", &peer);
        chain.set_network(Arc::new(network));

        let now = chain.timekeeper().epoch_time();
        let first = chain.generate_block(&keys, now).unwrap();
        let (ec_height, ec_id) = chain.ec_block(now);
        let tx = Arc::new(
            TransactionBuilder::new(
                keys.public_key(),
                KER_PER_SCTK,
                DEFAULT_FEE_KER + NEW_ACCOUNT_FEE_KER,
                60,
                Attachment::Payment,
                now,
            )
            .recipient(KeyPair::from_secret_phrase("forging recipient").account_id())
            .ec_block(ec_height, ec_id)
            .sign(&keys)
            .unwrap(),
        );
        chain.broadcast_transaction(tx.clone()).unwrap();

        chain.start_forging(keys.clone()).unwrap();
        let hit_time = chain.forgers()[0].hit_time as i32;
        let late = hit_time + 200;
        clock.set_millis(config.epoch_beginning_ms + i64::from(late) * 1000);
        let slow = chain.generate_block(&keys, late).unwrap();
        assert_eq!(slow.transactions().len(), 1);
        assert_eq!(peer.last_block().id(), slow.id());

        let replacement = chain.forge_tick().unwrap().unwrap();
        assert_eq!(replacement.height(), 2);
        assert_eq!(replacement.previous_block_id(), first.id());
        assert_eq!(replacement.timestamp(), hit_time + 1);
        assert_eq!(replacement.transactions()[0].id(), tx.id());
        assert!(chain.block(slow.id()).is_none());
        assert_eq!(peer.last_block().id(), replacement.id());
    }
}

//! Transaction Mempool
//!
//! Pending transactions waiting to be forged into a block:
//! - `unconfirmed` - admitted entries, each holding an unconfirmed-balance debit
//! - `waiting` - entries retried every second until they fit the chain state
//! - `broadcasted` - our own transactions, re-sent until they are confirmed
//!
//! Both pools are bounded by the same size. Inserting beyond it drops the
//! entry with the smallest [`UnconfirmedTransaction::eviction_key`].

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::consensus::validator::{self, ValidationContext};
use crate::constants::{MAX_NUMBER_OF_TRANSACTIONS, MAX_TIMEDRIFT, MAX_WAITING_SECONDS, REBROADCAST_MIN_AGE};
use crate::error::{ValidationError, ValidationResult};
use crate::ledger::{Ledger, LedgerError, LedgerResult};
use crate::storage::BlockStore;
use crate::time::Timekeeper;
use crate::types::{Block, DuplicateRegistry, Transaction, TransactionId};
use crate::ChainConfig;

/// Pool priority; the smallest key is dropped first
pub type EvictionKey = (Reverse<i32>, i64, bool, Reverse<i64>, Reverse<TransactionId>);

/// Transaction held by the pool
#[derive(Clone)]
pub struct UnconfirmedTransaction {
    transaction: Arc<Transaction>,
    /// Unix milliseconds the transaction was first seen
    arrival_timestamp: i64,
    /// Returned from a popped block
    bundled: bool,
    /// Chain height when the entry was created
    height: i32,
}

impl UnconfirmedTransaction {
    pub fn new(transaction: Arc<Transaction>, arrival_timestamp: i64, bundled: bool, height: i32) -> Self {
        Self {
            transaction,
            arrival_timestamp,
            bundled,
            height,
        }
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    pub fn id(&self) -> TransactionId {
        self.transaction.id()
    }

    pub fn arrival_timestamp(&self) -> i64 {
        self.arrival_timestamp
    }

    pub fn is_bundled(&self) -> bool {
        self.bundled
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn fee_ker(&self) -> i64 {
        self.transaction.fee_ker()
    }

    pub fn expiration(&self) -> i32 {
        self.transaction.expiration()
    }

    /// Higher height, lower fee, unbundled, later arrival and higher id sort first
    pub fn eviction_key(&self) -> EvictionKey {
        (
            Reverse(self.height),
            self.fee_ker(),
            self.bundled,
            Reverse(self.arrival_timestamp),
            Reverse(self.id()),
        )
    }

    fn selection_key(&self) -> (i32, Reverse<i64>, i64, TransactionId) {
        (self.height, Reverse(self.fee_ker()), self.arrival_timestamp, self.id())
    }
}

impl std::fmt::Debug for UnconfirmedTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnconfirmedTransaction")
            .field("id", &self.transaction.string_id())
            .field("fee_ker", &self.fee_ker())
            .field("arrival_timestamp", &self.arrival_timestamp)
            .field("bundled", &self.bundled)
            .field("height", &self.height)
            .finish()
    }
}

/// Chain state the pool admits transactions against
pub struct PoolContext<'a> {
    pub config: &'a ChainConfig,
    pub store: &'a dyn BlockStore,
    pub ledger: &'a mut dyn Ledger,
    /// Height of the current last block
    pub height: i32,
    /// Current epoch time
    pub now: i32,
}

impl PoolContext<'_> {
    fn validation(&self) -> ValidationContext<'_> {
        ValidationContext {
            config: self.config,
            store: self.store,
            ledger: &*self.ledger,
            height: self.height,
            now: self.now,
        }
    }
}

/// Pool changes since the last `take_changes`
#[derive(Debug, Clone, Default)]
pub struct PoolChanges {
    pub added: Vec<Arc<Transaction>>,
    pub removed: Vec<Arc<Transaction>>,
}

impl PoolChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Outcome of a batch received from a peer
#[derive(Debug, Default)]
pub struct ReceivedTransactions {
    /// Newly admitted transactions
    pub accepted: Vec<Arc<Transaction>>,
    /// Permanent failures, reported back to the sender
    pub errors: Vec<ValidationError>,
}

/// Mempool statistics
#[derive(Debug, Clone, Default)]
pub struct MempoolStats {
    /// Total transactions admitted
    pub total_added: u64,
    /// Total transactions removed
    pub total_removed: u64,
    /// Transactions expired
    pub total_expired: u64,
    /// Transactions evicted (capacity)
    pub total_evicted: u64,
}

/// Unconfirmed transaction pool
#[derive(Clone)]
pub struct TransactionPool {
    max_size: usize,
    rebroadcasting: bool,
    unconfirmed: HashMap<TransactionId, UnconfirmedTransaction>,
    by_priority: BTreeMap<EvictionKey, TransactionId>,
    waiting: BTreeMap<EvictionKey, UnconfirmedTransaction>,
    waiting_index: HashMap<TransactionId, EvictionKey>,
    duplicates: DuplicateRegistry,
    broadcasted: HashMap<TransactionId, Arc<Transaction>>,
    changes: PoolChanges,
    stats: MempoolStats,
}

impl TransactionPool {
    pub fn new(max_size: usize, rebroadcasting: bool) -> Self {
        Self {
            max_size: max_size.max(1),
            rebroadcasting,
            unconfirmed: HashMap::new(),
            by_priority: BTreeMap::new(),
            waiting: BTreeMap::new(),
            waiting_index: HashMap::new(),
            duplicates: DuplicateRegistry::new(),
            broadcasted: HashMap::new(),
            changes: PoolChanges::default(),
            stats: MempoolStats::default(),
        }
    }

    // ========== Queries ==========

    pub fn len(&self) -> usize {
        self.unconfirmed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unconfirmed.is_empty()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn contains(&self, id: TransactionId) -> bool {
        self.unconfirmed.contains_key(&id)
    }

    pub fn is_waiting(&self, id: TransactionId) -> bool {
        self.waiting_index.contains_key(&id)
    }

    pub fn is_broadcasted(&self, id: TransactionId) -> bool {
        self.broadcasted.contains_key(&id)
    }

    pub fn get(&self, id: TransactionId) -> Option<&UnconfirmedTransaction> {
        self.unconfirmed.get(&id)
    }

    /// Admitted entries, best first
    pub fn transactions(&self) -> Vec<&UnconfirmedTransaction> {
        self.by_priority
            .values()
            .rev()
            .filter_map(|id| self.unconfirmed.get(id))
            .collect()
    }

    /// Waiting entries, best first
    pub fn waiting_transactions(&self) -> Vec<&UnconfirmedTransaction> {
        self.waiting.values().rev().collect()
    }

    pub fn broadcasted_transactions(&self) -> Vec<Arc<Transaction>> {
        self.broadcasted.values().cloned().collect()
    }

    pub fn stats(&self) -> &MempoolStats {
        &self.stats
    }

    /// Drain the added/removed lists accumulated since the last call
    pub fn take_changes(&mut self) -> PoolChanges {
        std::mem::take(&mut self.changes)
    }

    // ========== Admission ==========

    /// Admit `entry`, debiting the sender's unconfirmed balance.
    ///
    /// A full pool admits the entry only if it outranks the current worst
    /// entry, which is then evicted.
    pub fn process_transaction(
        &mut self,
        ctx: &mut PoolContext<'_>,
        entry: UnconfirmedTransaction,
    ) -> ValidationResult<()> {
        let tx = entry.transaction.clone();
        let id = tx.id();
        if self.unconfirmed.contains_key(&id) || ctx.store.has_transaction(id, ctx.height) {
            return Err(ValidationError::ExistingTransaction(
                "Transaction already processed".into(),
            ));
        }
        validator::validate_transaction(&ctx.validation(), &tx)?;
        if tx.timestamp() > ctx.now + MAX_TIMEDRIFT {
            return Err(ValidationError::not_currently_valid(format!(
                "Transaction timestamp {} is in the future, current time is {}",
                tx.timestamp(),
                ctx.now
            )));
        }
        if tx.expiration() < ctx.now {
            return Err(ValidationError::not_currently_valid("Expired transaction"));
        }
        if tx.version() < 1 {
            return Err(ValidationError::not_valid("Invalid transaction version"));
        }
        if ctx.height < ctx.config.last_known_block {
            return Err(ValidationError::not_currently_valid(
                "Blockchain not ready to accept transactions",
            ));
        }
        if !validator::verify_sender(&tx, &*ctx.ledger) {
            return Err(if ctx.ledger.account(tx.sender_id()).is_some() {
                ValidationError::not_valid("Transaction signature verification failed")
            } else {
                ValidationError::not_currently_valid("Unknown transaction sender")
            });
        }

        let entry = UnconfirmedTransaction {
            height: ctx.height,
            ..entry
        };
        let key = entry.eviction_key();
        if self.unconfirmed.len() >= self.max_size
            && self.by_priority.keys().next().map_or(false, |worst| key <= *worst)
        {
            return Err(ValidationError::not_currently_valid(
                "Unconfirmed transaction pool is full",
            ));
        }

        if !tx.apply_unconfirmed(&mut *ctx.ledger, ctx.height).map_err(ledger_failure)? {
            return Err(ValidationError::InsufficientBalance("Insufficient balance".into()));
        }
        if self.duplicates.check(&tx) {
            tx.undo_unconfirmed(&mut *ctx.ledger, ctx.height).map_err(ledger_failure)?;
            return Err(ValidationError::not_currently_valid(
                "Duplicate unconfirmed transaction",
            ));
        }

        self.by_priority.insert(key, id);
        self.unconfirmed.insert(id, entry);
        self.stats.total_added += 1;
        self.changes.added.push(tx);
        trace!("Admitted unconfirmed transaction {}", id);

        while self.unconfirmed.len() > self.max_size {
            let Some((_, worst)) = self.by_priority.pop_first() else {
                break;
            };
            if let Some(evicted) = self.unconfirmed.remove(&worst) {
                evicted
                    .transaction
                    .undo_unconfirmed(&mut *ctx.ledger, ctx.height)
                    .map_err(ledger_failure)?;
                self.stats.total_evicted += 1;
                self.changes.removed.push(evicted.transaction.clone());
                debug!("Dropped unconfirmed transaction {}", evicted.transaction.string_id());
            }
        }
        Ok(())
    }

    /// Admit one of our own transactions.
    ///
    /// Returns true when it is new and should be sent to peers.
    pub fn broadcast(
        &mut self,
        ctx: &mut PoolContext<'_>,
        tx: Arc<Transaction>,
        arrival_timestamp: i64,
    ) -> ValidationResult<bool> {
        if ctx.store.has_transaction(tx.id(), ctx.height) {
            debug!("Transaction {} already in blockchain, will not broadcast again", tx.string_id());
            return Ok(false);
        }
        if self.unconfirmed.contains_key(&tx.id()) {
            if self.rebroadcasting {
                self.broadcasted.insert(tx.id(), tx.clone());
                debug!("Transaction {} already in unconfirmed pool, will re-broadcast", tx.string_id());
            } else {
                debug!("Transaction {} already in unconfirmed pool, will not broadcast again", tx.string_id());
            }
            return Ok(false);
        }
        let entry = UnconfirmedTransaction::new(tx.clone(), arrival_timestamp, false, ctx.height);
        self.process_transaction(ctx, entry)?;
        debug!("Accepted new transaction {}", tx.string_id());
        if self.rebroadcasting {
            self.broadcasted.insert(tx.id(), tx);
        }
        Ok(true)
    }

    /// Admit a batch received from a peer.
    ///
    /// Transient failures are ignored; permanent ones are collected so the
    /// caller can report them after forwarding what was accepted.
    pub fn process_node_transactions(
        &mut self,
        ctx: &mut PoolContext<'_>,
        transactions: Vec<Arc<Transaction>>,
        arrival_timestamp: i64,
    ) -> ReceivedTransactions {
        let mut received = ReceivedTransactions::default();
        if ctx.height <= ctx.config.last_known_block {
            return received;
        }
        let mut seen = Vec::with_capacity(transactions.len());
        for tx in transactions {
            seen.push(tx.id());
            if self.unconfirmed.contains_key(&tx.id()) || ctx.store.has_transaction(tx.id(), ctx.height) {
                continue;
            }
            let entry = UnconfirmedTransaction::new(tx.clone(), arrival_timestamp, false, ctx.height);
            match self.process_transaction(ctx, entry) {
                Ok(()) => {
                    if self.broadcasted.contains_key(&tx.id()) {
                        debug!("Received back transaction {} that we broadcasted", tx.string_id());
                    } else {
                        received.accepted.push(tx);
                    }
                }
                Err(e) if e.is_transient() => {
                    trace!("Transaction {} not currently valid: {}", tx.string_id(), e);
                }
                Err(e) => received.errors.push(e),
            }
        }
        for id in seen {
            self.broadcasted.remove(&id);
        }
        received
    }

    // ========== Waiting queue ==========

    fn add_waiting(&mut self, entry: UnconfirmedTransaction) {
        if self.waiting_index.contains_key(&entry.id()) || self.unconfirmed.contains_key(&entry.id()) {
            return;
        }
        let key = entry.eviction_key();
        self.waiting_index.insert(entry.id(), key);
        self.waiting.insert(key, entry);
        if self.waiting.len() > self.max_size {
            if let Some((_, dropped)) = self.waiting.pop_first() {
                self.waiting_index.remove(&dropped.id());
                self.stats.total_evicted += 1;
                debug!("Dropped waiting transaction {}", dropped.transaction.string_id());
            }
        }
    }

    /// Retry every waiting entry against the current chain state.
    ///
    /// Entries that are already known or permanently invalid are dropped;
    /// transient failures stay queued until they expire or have waited
    /// for an hour.
    pub fn process_waiting(&mut self, ctx: &mut PoolContext<'_>, now_ms: i64) -> usize {
        if self.waiting.is_empty() {
            return 0;
        }
        let entries: Vec<UnconfirmedTransaction> = std::mem::take(&mut self.waiting).into_values().rev().collect();
        self.waiting_index.clear();
        let mut admitted = 0;
        for entry in entries {
            match self.process_transaction(ctx, entry.clone()) {
                Ok(()) => admitted += 1,
                Err(ValidationError::ExistingTransaction(_)) => {}
                Err(e) if e.is_transient() => {
                    let waited = now_ms - entry.arrival_timestamp;
                    if entry.expiration() < ctx.now || waited > i64::from(MAX_WAITING_SECONDS) * 1000 {
                        trace!("Dropped waiting transaction {}: {}", entry.transaction.string_id(), e);
                    } else {
                        self.add_waiting(entry);
                    }
                }
                Err(e) => {
                    debug!("Dropped waiting transaction {}: {}", entry.transaction.string_id(), e);
                }
            }
        }
        admitted
    }

    /// Queue the transactions of popped blocks for re-admission
    pub fn process_later<I>(&mut self, store: &dyn BlockStore, transactions: I, timekeeper: &Timekeeper, height: i32)
    where
        I: IntoIterator<Item = Arc<Transaction>>,
    {
        let now_ms = timekeeper.millis();
        for tx in transactions {
            if store.find_transaction(tx.id()).is_some() {
                continue;
            }
            tx.unset_block();
            let arrival = now_ms.min(timekeeper.to_millis(tx.timestamp()));
            self.add_waiting(UnconfirmedTransaction::new(tx, arrival, true, height));
        }
    }

    // ========== Removal ==========

    fn remove_entry(&mut self, ledger: &mut dyn Ledger, id: TransactionId, height: i32) -> LedgerResult<Option<UnconfirmedTransaction>> {
        let Some(entry) = self.unconfirmed.remove(&id) else {
            return Ok(None);
        };
        self.by_priority.remove(&entry.eviction_key());
        entry.transaction.undo_unconfirmed(ledger, height)?;
        self.changes.removed.push(entry.transaction.clone());
        Ok(Some(entry))
    }

    /// Remove entries, releasing their unconfirmed debits
    pub fn remove(&mut self, ledger: &mut dyn Ledger, ids: &[TransactionId], height: i32) -> LedgerResult<usize> {
        let mut removed = 0;
        for id in ids {
            if self.remove_entry(ledger, *id, height)?.is_some() {
                removed += 1;
            }
        }
        self.stats.total_removed += removed as u64;
        Ok(removed)
    }

    /// Drop expired entries from both pools
    pub fn remove_expired(&mut self, ledger: &mut dyn Ledger, height: i32, now: i32) -> LedgerResult<usize> {
        let expired: Vec<TransactionId> = self
            .unconfirmed
            .values()
            .filter(|e| e.expiration() < now)
            .map(UnconfirmedTransaction::id)
            .collect();
        for id in &expired {
            self.remove_entry(ledger, *id, height)?;
        }
        let before = self.waiting.len();
        self.waiting.retain(|_, e| e.expiration() >= now);
        let index: HashMap<_, _> = self.waiting.iter().map(|(k, e)| (e.id(), *k)).collect();
        self.waiting_index = index;

        let total = expired.len() + before - self.waiting.len();
        if total > 0 {
            self.stats.total_expired += total as u64;
            debug!("Removed {} expired unconfirmed transactions", total);
        }
        Ok(total)
    }

    /// Release every debit and move all entries to the waiting queue
    pub fn requeue_all(&mut self, ledger: &mut dyn Ledger, height: i32) -> LedgerResult<()> {
        let entries = std::mem::take(&mut self.unconfirmed);
        self.by_priority.clear();
        for entry in entries.into_values() {
            entry.transaction.undo_unconfirmed(ledger, height)?;
            self.changes.removed.push(entry.transaction.clone());
            self.add_waiting(entry);
        }
        self.duplicates.clear();
        Ok(())
    }

    /// Move entries admitted above `height` to the waiting queue.
    ///
    /// Their debits are undone by the ledger rolling back to `height`.
    pub fn requeue_above(&mut self, height: i32) {
        let above: Vec<TransactionId> = self
            .unconfirmed
            .values()
            .filter(|e| e.height > height)
            .map(UnconfirmedTransaction::id)
            .collect();
        for id in above {
            if let Some(entry) = self.unconfirmed.remove(&id) {
                self.by_priority.remove(&entry.eviction_key());
                self.changes.removed.push(entry.transaction.clone());
                self.add_waiting(entry);
            }
        }
        self.duplicates.clear();
    }

    /// Release every debit and forget all transactions
    pub fn clear(&mut self, ledger: &mut dyn Ledger, height: i32) -> LedgerResult<()> {
        let entries = std::mem::take(&mut self.unconfirmed);
        for entry in entries.into_values() {
            entry.transaction.undo_unconfirmed(ledger, height)?;
            self.changes.removed.push(entry.transaction);
        }
        self.by_priority.clear();
        self.waiting.clear();
        self.waiting_index.clear();
        self.broadcasted.clear();
        self.duplicates.clear();
        Ok(())
    }

    // ========== Block assembly ==========

    /// Pick the transactions for a block at `block_timestamp` on top of `previous`.
    ///
    /// Candidates are tried by admission height, then highest fee, then
    /// arrival; the result is ordered by arrival.
    pub fn select_for_block(
        &self,
        ctx: &ValidationContext<'_>,
        previous: &Block,
        block_timestamp: i32,
    ) -> Vec<Arc<Transaction>> {
        let mut candidates: Vec<&UnconfirmedTransaction> = self.unconfirmed.values().collect();
        candidates.sort_by_key(|e| e.selection_key());

        let version = validator::transaction_version(previous.height());
        let mut duplicates = DuplicateRegistry::new();
        let mut selected: Vec<&UnconfirmedTransaction> = Vec::new();
        for entry in candidates {
            if selected.len() >= MAX_NUMBER_OF_TRANSACTIONS {
                break;
            }
            let tx = &entry.transaction;
            if tx.version() != version {
                continue;
            }
            if tx.timestamp() > block_timestamp + MAX_TIMEDRIFT || tx.expiration() < block_timestamp {
                continue;
            }
            if let Err(e) = validator::validate_transaction(ctx, tx) {
                trace!("Skipping transaction {} for block: {}", tx.string_id(), e);
                continue;
            }
            if duplicates.check(tx) {
                continue;
            }
            selected.push(entry);
        }
        selected.sort_by_key(|e| (e.arrival_timestamp, e.height, e.id()));
        selected.into_iter().map(|e| e.transaction.clone()).collect()
    }

    // ========== Rebroadcast ==========

    /// Own transactions due for another broadcast.
    ///
    /// Expired and confirmed ones are forgotten first.
    pub fn rebroadcast_candidates(&mut self, store: &dyn BlockStore, height: i32, now: i32) -> Vec<Arc<Transaction>> {
        self.broadcasted
            .retain(|id, tx| tx.expiration() >= now && !store.has_transaction(*id, height));
        let mut due: Vec<Arc<Transaction>> = self
            .broadcasted
            .values()
            .filter(|tx| tx.timestamp() < now - REBROADCAST_MIN_AGE)
            .cloned()
            .collect();
        due.sort_by_key(|tx| (tx.timestamp(), tx.id()));
        due
    }
}

impl std::fmt::Debug for TransactionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionPool")
            .field("unconfirmed", &self.unconfirmed.len())
            .field("waiting", &self.waiting.len())
            .field("broadcasted", &self.broadcasted.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

fn ledger_failure(e: LedgerError) -> ValidationError {
    ValidationError::not_currently_valid(format!("Ledger error: {}", e))
}

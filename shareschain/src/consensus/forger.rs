//! Forging: hits, hit times and the set of local forgers
//!
//! A forger's hit for the next block is the first 8 bytes of
//! `sha256(previous.generation_signature ++ public_key)`. The lower the
//! hit relative to its effective balance, the sooner the account may forge:
//! `hit_time = previous.timestamp + hit / (base_target * effective_balance)`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::debug;

use super::{ConsensusError, ConsensusResult};
use crate::crypto::{self, KeyPair};
use crate::ledger::{effective_balance_sctk, Ledger};
use crate::types::{AccountId, Block, BlockId, Hash, PublicKey};
use crate::ChainConfig;

// ========== Hits ==========

/// Testnet key configured to forge with a zero hit
pub fn allows_fake_forging(public_key: &PublicKey, config: &ChainConfig) -> bool {
    config.testnet && config.fake_forging_public_key.as_ref() == Some(public_key)
}

/// Generation signature of the block `public_key` forges on top of `previous`
pub fn generation_signature(previous: &Block, public_key: &PublicKey) -> Hash {
    crypto::sha256_concat(&[&previous.generation_signature()[..], &public_key[..]])
}

fn hit_of(generation_signature: &Hash) -> u64 {
    let mut first = [0u8; 8];
    first.copy_from_slice(&generation_signature[..8]);
    u64::from_le_bytes(first)
}

pub fn hit(public_key: &PublicKey, previous: &Block, config: &ChainConfig) -> u64 {
    if allows_fake_forging(public_key, config) {
        return 0;
    }
    hit_of(&generation_signature(previous, public_key))
}

/// Epoch second at which `hit` becomes valid on top of `previous`
pub fn hit_time(effective_balance: i64, hit: u64, previous: &Block) -> i64 {
    let effective_base_target = previous.base_target().max(0) as u128 * effective_balance.max(1) as u128;
    let delay = u128::from(hit) / effective_base_target.max(1);
    i64::from(previous.timestamp()).saturating_add(delay.min(i64::MAX as u128) as i64)
}

/// Check that `hit` may forge at `timestamp` on top of `previous`.
///
/// The hit must fall within the target window of the elapsed second; after
/// the idle limit, or when offline, any hit below target is accepted.
pub fn verify_hit(hit: u64, effective_balance: i64, previous: &Block, timestamp: i32, config: &ChainConfig) -> bool {
    let elapsed = i64::from(timestamp) - i64::from(previous.timestamp());
    if elapsed <= 0 || effective_balance <= 0 {
        return false;
    }
    let effective_base_target = previous.base_target().max(0) as u128 * effective_balance as u128;
    let prev_target = effective_base_target * (elapsed - 1) as u128;
    let target = prev_target + effective_base_target;
    let hit = u128::from(hit);
    hit < target
        && (hit >= prev_target || elapsed > i64::from(config.idle_forging_limit()) || config.offline)
}

/// Check a received block's generation signature against its generator's
/// effective balance at `previous`
pub fn verify_generation_signature(block: &Block, previous: &Block, ledger: &dyn Ledger, config: &ChainConfig) -> bool {
    let effective_balance = effective_balance_sctk(
        ledger,
        block.generator_id(),
        previous.height(),
        config.guaranteed_balance_confirmations,
    );
    if effective_balance <= 0 {
        return false;
    }
    let expected = generation_signature(previous, block.generator_public_key());
    if &expected != block.generation_signature() {
        return false;
    }
    verify_hit(hit_of(&expected), effective_balance, previous, block.timestamp(), config)
}

// ========== Forger ==========

/// Forging state of one local account
pub struct Forger {
    keys: KeyPair,
    account_id: AccountId,
    public_key: PublicKey,
    hit: u64,
    hit_time: i64,
    deadline: i64,
    effective_balance: i64,
}

impl Forger {
    pub fn new(keys: KeyPair) -> Self {
        let public_key = keys.public_key();
        Self {
            account_id: crypto::account_id(&public_key),
            public_key,
            keys,
            hit: 0,
            hit_time: 0,
            deadline: 0,
            effective_balance: 0,
        }
    }

    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn hit(&self) -> u64 {
        self.hit
    }

    pub fn hit_time(&self) -> i64 {
        self.hit_time
    }

    /// Seconds after the last block this forger may forge
    pub fn deadline(&self) -> i64 {
        self.deadline
    }

    pub fn effective_balance(&self) -> i64 {
        self.effective_balance
    }

    /// Recompute hit and hit time on top of `last_block`
    pub fn set_last_block(&mut self, last_block: &Block, ledger: &dyn Ledger, config: &ChainConfig) {
        self.effective_balance = effective_balance_sctk(
            ledger,
            self.account_id,
            last_block.height(),
            config.guaranteed_balance_confirmations,
        )
        .max(0);
        if self.effective_balance == 0 {
            self.hit = 0;
            self.hit_time = 0;
            return;
        }
        self.hit = hit(&self.public_key, last_block, config);
        self.hit_time = hit_time(self.effective_balance, self.hit, last_block);
        self.deadline = (self.hit_time - i64::from(last_block.timestamp())).max(0);
    }

    /// Timestamp to forge at given the current generation limit
    pub fn timestamp(&self, generation_limit: i32) -> i32 {
        if i64::from(generation_limit) - self.hit_time > 3600 {
            generation_limit
        } else {
            (self.hit_time + 1).min(i64::from(i32::MAX)) as i32
        }
    }

    /// Ordering by hit per unit of balance, then account id
    fn cmp_priority(&self, other: &Forger) -> Ordering {
        let lhs = u128::from(self.hit) * other.effective_balance as u128;
        let rhs = u128::from(other.hit) * self.effective_balance as u128;
        lhs.cmp(&rhs).then(self.account_id.cmp(&other.account_id))
    }
}

impl std::fmt::Debug for Forger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forger")
            .field("account_id", &self.account_id)
            .field("deadline", &self.deadline)
            .field("hit_time", &self.hit_time)
            .field("effective_balance", &self.effective_balance)
            .finish()
    }
}

impl std::fmt::Display for Forger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Forger {} deadline {} hit {}", self.account_id, self.deadline, self.hit_time)
    }
}

// ========== Forger set ==========

/// The node's local forgers, sorted for the current last block
#[derive(Debug)]
pub struct ForgerSet {
    forgers: BTreeMap<AccountId, Forger>,
    /// Forgers with a positive balance in forging order; None when stale
    sorted: Option<Vec<AccountId>>,
    last_block_id: BlockId,
    /// Seconds subtracted from now when deciding whether a hit is due
    delay: i32,
    max_forgers: usize,
}

impl ForgerSet {
    pub fn new(config: &ChainConfig) -> Self {
        Self {
            forgers: BTreeMap::new(),
            sorted: None,
            last_block_id: 0,
            delay: config.forging_delay(),
            max_forgers: config.max_forgers,
        }
    }

    /// Add a forger; returns its account id and whether it is new
    pub fn start(&mut self, keys: KeyPair) -> ConsensusResult<(AccountId, bool)> {
        let account_id = keys.account_id();
        if self.forgers.contains_key(&account_id) {
            debug!("Forger {} is already forging", account_id);
            return Ok((account_id, false));
        }
        if self.forgers.len() >= self.max_forgers {
            return Err(ConsensusError::TooManyForgers(self.max_forgers));
        }
        self.forgers.insert(account_id, Forger::new(keys));
        self.sorted = None;
        debug!("Forger {} started", account_id);
        Ok((account_id, true))
    }

    pub fn stop(&mut self, account_id: AccountId) -> Option<Forger> {
        let forger = self.forgers.remove(&account_id)?;
        self.sorted = None;
        debug!("{} stopped", forger);
        Some(forger)
    }

    /// Stop every forger; returns the stopped account ids
    pub fn stop_all(&mut self) -> Vec<AccountId> {
        let stopped: Vec<AccountId> = self.forgers.keys().copied().collect();
        self.forgers.clear();
        self.sorted = None;
        stopped
    }

    pub fn get(&self, account_id: AccountId) -> Option<&Forger> {
        self.forgers.get(&account_id)
    }

    pub fn len(&self) -> usize {
        self.forgers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forgers.is_empty()
    }

    pub fn delay(&self) -> i32 {
        self.delay
    }

    pub fn set_delay(&mut self, delay: i32) {
        self.delay = delay;
    }

    /// True when the sorted list was computed for another block
    pub fn is_stale(&self, last_block_id: BlockId) -> bool {
        self.sorted.is_none() || self.last_block_id != last_block_id
    }

    /// Recompute every forger against `last_block` and re-sort
    pub fn refresh(&mut self, last_block: &Block, ledger: &dyn Ledger, config: &ChainConfig) {
        self.last_block_id = last_block.id();
        for forger in self.forgers.values_mut() {
            forger.set_last_block(last_block, ledger, config);
        }
        let mut active: Vec<&Forger> = self
            .forgers
            .values()
            .filter(|f| f.effective_balance > 0)
            .collect();
        active.sort_by(|a, b| a.cmp_priority(b));
        self.sorted = Some(active.into_iter().map(|f| f.account_id).collect());
    }

    /// Recompute forgers against `block` without touching the sorted list
    pub fn set_last_block_all(&mut self, block: &Block, ledger: &dyn Ledger, config: &ChainConfig) {
        for forger in self.forgers.values_mut() {
            forger.set_last_block(block, ledger, config);
        }
    }

    pub fn forgers(&self) -> impl Iterator<Item = &Forger> {
        self.forgers.values()
    }

    /// Active forgers in forging order
    pub fn sorted_forgers(&self) -> Vec<&Forger> {
        self.sorted
            .iter()
            .flatten()
            .filter_map(|id| self.forgers.get(id))
            .collect()
    }

    /// Earliest hit time not older than the forging delay, or 0
    pub fn next_hit_time(&self, last_block_id: BlockId, now: i32, forging_delay: i32) -> i64 {
        if last_block_id != self.last_block_id {
            return 0;
        }
        self.sorted_forgers()
            .into_iter()
            .map(Forger::hit_time)
            .find(|hit_time| *hit_time >= i64::from(now - forging_delay))
            .unwrap_or(0)
    }
}

//! Account ledger
//!
//! Balances and keys derived from the applied blocks:
//! - confirmed, unconfirmed and forged balances per account
//! - public keys announced on chain, with the height they appeared at
//! - effective balance leases used for forging
//!
//! Every change is recorded against a height so that popping blocks
//! rolls the ledger back to the state it had below them.

pub mod memory;

use serde::{Deserialize, Serialize};

use crate::constants::{KER_PER_SCTK, LEASING_DELAY, MIN_FORGING_BALANCE_KER};
use crate::storage::{DerivedTable, StorageError, Transactional};
use crate::types::{AccountId, PublicKey};

pub use memory::MemoryLedger;

/// Ledger result type
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Unknown account: {0}")]
    UnknownAccount(AccountId),

    #[error("Negative balance for account {account}: {balance}")]
    NegativeBalance { account: AccountId, balance: i64 },

    #[error("Negative unconfirmed balance for account {account}: {balance}")]
    NegativeUnconfirmedBalance { account: AccountId, balance: i64 },

    #[error("Balance overflow for account {0}")]
    Overflow(AccountId),

    #[error("Public key mismatch for account {0}")]
    PublicKeyMismatch(AccountId),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Reason attached to a balance change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerEvent {
    Genesis,
    BlockGenerated,
    Payment,
    EffectiveBalanceLeasing,
}

/// Effective balance lease from one account to another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLease {
    pub lessee_id: AccountId,
    /// First height the lease is active at
    pub from_height: i32,
    /// First height the lease is no longer active at
    pub to_height: i32,
}

impl AccountLease {
    pub fn is_active_at(&self, height: i32) -> bool {
        self.from_height <= height && height < self.to_height
    }
}

/// Account state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub creation_height: i32,
    pub balance_ker: i64,
    pub unconfirmed_balance_ker: i64,
    pub forged_balance_ker: i64,
    pub public_key: Option<PublicKey>,
    /// Height the public key was first applied at, -1 if unknown
    pub key_height: i32,
    pub lease: Option<AccountLease>,
}

impl Account {
    pub fn new(id: AccountId, height: i32) -> Self {
        Self {
            id,
            creation_height: height,
            balance_ker: 0,
            unconfirmed_balance_ker: 0,
            forged_balance_ker: 0,
            public_key: None,
            key_height: -1,
            lease: None,
        }
    }

    /// Lessee the account's balance goes to at `height`
    pub fn active_lessee(&self, height: i32) -> Option<AccountId> {
        self.lease
            .filter(|lease| lease.is_active_at(height))
            .map(|lease| lease.lessee_id)
    }
}

/// Account state store
pub trait Ledger: DerivedTable + Transactional + Send + Sync {
    fn account(&self, id: AccountId) -> Option<Account>;

    /// True if the account existed at `height`
    fn has_account(&self, id: AccountId, height: i32) -> bool;

    fn public_key(&self, id: AccountId) -> Option<PublicKey>;

    /// Balance credited at genesis
    fn genesis_balance_ker(&self, id: AccountId) -> i64;

    /// Balance minus the credits received within `confirmations` blocks of `height`
    fn guaranteed_balance_ker(&self, id: AccountId, confirmations: i32, height: i32) -> i64;

    /// Accounts leasing their balance to `lessee` at `height`
    fn lessors(&self, lessee: AccountId, height: i32) -> Vec<AccountId>;

    fn add_account(&mut self, id: AccountId, height: i32) -> LedgerResult<()>;

    /// Set the public key if unknown; a different known key is an error
    fn apply_public_key(&mut self, id: AccountId, key: &PublicKey, height: i32) -> LedgerResult<()>;

    fn add_to_balance(
        &mut self,
        id: AccountId,
        event: LedgerEvent,
        event_id: u64,
        amount_ker: i64,
        height: i32,
    ) -> LedgerResult<()>;

    fn add_to_unconfirmed_balance(
        &mut self,
        id: AccountId,
        event: LedgerEvent,
        event_id: u64,
        amount_ker: i64,
        height: i32,
    ) -> LedgerResult<()>;

    fn add_to_balance_and_unconfirmed_balance(
        &mut self,
        id: AccountId,
        event: LedgerEvent,
        event_id: u64,
        amount_ker: i64,
        height: i32,
    ) -> LedgerResult<()>;

    fn add_to_forged_balance(&mut self, id: AccountId, amount_ker: i64, height: i32) -> LedgerResult<()>;

    /// Lease `lessor`'s effective balance to `lessee` for `period` blocks
    fn lease_effective_balance(
        &mut self,
        lessor: AccountId,
        lessee: AccountId,
        period: u16,
        height: i32,
    ) -> LedgerResult<()>;

    fn accounts(&self) -> Vec<Account>;
}

/// Forging balance of `id` at `height`, in whole SCTK.
///
/// Before `confirmations` blocks exist only genesis balances count.
/// Afterwards the account's own guaranteed balance counts unless it is
/// leased out, plus the guaranteed balances leased to it. Accounts whose
/// key is unknown or younger than `confirmations` forge nothing.
pub fn effective_balance_sctk(ledger: &dyn Ledger, id: AccountId, height: i32, confirmations: i32) -> i64 {
    if height <= confirmations {
        return ledger.genesis_balance_ker(id) / KER_PER_SCTK;
    }
    let Some(account) = ledger.account(id) else {
        return 0;
    };
    if account.public_key.is_none() || height - account.key_height <= confirmations {
        return 0;
    }
    let mut effective = ledger
        .lessors(id, height)
        .into_iter()
        .map(|lessor| ledger.guaranteed_balance_ker(lessor, confirmations, height))
        .fold(0i64, i64::saturating_add);
    if account.active_lessee(height).is_none() {
        effective = effective.saturating_add(ledger.guaranteed_balance_ker(id, confirmations, height));
    }
    if effective < MIN_FORGING_BALANCE_KER {
        0
    } else {
        effective / KER_PER_SCTK
    }
}

/// Lease window starting at `height`
pub fn lease_window(lessee_id: AccountId, period: u16, height: i32) -> AccountLease {
    let from_height = height + LEASING_DELAY;
    AccountLease {
        lessee_id,
        from_height,
        to_height: from_height + i32::from(period),
    }
}

//! In-memory ledger with a height journal

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use super::{lease_window, Account, Ledger, LedgerError, LedgerEvent, LedgerResult};
use crate::storage::{DerivedTable, StorageError, StorageResult, Transactional};
use crate::types::{AccountId, PublicKey};

/// Account state before a change made at `height`
#[derive(Debug, Clone)]
struct JournalEntry {
    height: i32,
    account_id: AccountId,
    previous: Option<Account>,
}

#[derive(Debug, Clone, Default)]
struct LedgerState {
    accounts: BTreeMap<AccountId, Account>,
    journal: Vec<JournalEntry>,
    /// Confirmed credits per (account, height)
    additions: BTreeMap<(AccountId, i32), i64>,
    genesis_balances: HashMap<AccountId, i64>,
}

/// Ledger kept in memory.
///
/// Each account change pushes the account's previous state onto a journal
/// tagged with the change height; `rollback_to` replays the journal
/// backwards. Heights in the journal never decrease.
pub struct MemoryLedger {
    state: LedgerState,
    saved: Option<LedgerState>,
    /// Credits older than this many blocks are dropped on trim
    guaranteed_balance_confirmations: i32,
}

impl MemoryLedger {
    pub fn new(guaranteed_balance_confirmations: i32) -> Self {
        Self {
            state: LedgerState::default(),
            saved: None,
            guaranteed_balance_confirmations,
        }
    }

    pub fn journal_len(&self) -> usize {
        self.state.journal.len()
    }

    fn modify<F>(&mut self, id: AccountId, height: i32, f: F) -> LedgerResult<()>
    where
        F: FnOnce(&mut Account) -> LedgerResult<()>,
    {
        let previous = self.state.accounts.get(&id).cloned();
        let mut account = previous.clone().ok_or(LedgerError::UnknownAccount(id))?;
        f(&mut account)?;
        if Some(&account) == previous.as_ref() {
            return Ok(());
        }
        self.state.journal.push(JournalEntry {
            height,
            account_id: id,
            previous,
        });
        self.state.accounts.insert(id, account);
        Ok(())
    }

    fn record_addition(&mut self, id: AccountId, event: LedgerEvent, amount_ker: i64, height: i32) {
        if amount_ker <= 0 {
            return;
        }
        if event == LedgerEvent::Genesis {
            *self.state.genesis_balances.entry(id).or_default() += amount_ker;
        }
        *self.state.additions.entry((id, height)).or_default() += amount_ker;
    }

    fn change_balance(account: &mut Account, amount_ker: i64) -> LedgerResult<()> {
        let balance = account
            .balance_ker
            .checked_add(amount_ker)
            .ok_or(LedgerError::Overflow(account.id))?;
        if balance < 0 {
            return Err(LedgerError::NegativeBalance {
                account: account.id,
                balance,
            });
        }
        account.balance_ker = balance;
        Ok(())
    }

    fn change_unconfirmed_balance(account: &mut Account, amount_ker: i64) -> LedgerResult<()> {
        let balance = account
            .unconfirmed_balance_ker
            .checked_add(amount_ker)
            .ok_or(LedgerError::Overflow(account.id))?;
        if balance < 0 {
            return Err(LedgerError::NegativeUnconfirmedBalance {
                account: account.id,
                balance,
            });
        }
        account.unconfirmed_balance_ker = balance;
        Ok(())
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(crate::constants::GUARANTEED_BALANCE_CONFIRMATIONS)
    }
}

impl Transactional for MemoryLedger {
    fn begin_transaction(&mut self) -> StorageResult<()> {
        if self.saved.is_some() {
            return Err(StorageError::TransactionState("ledger transaction already in progress".into()));
        }
        self.saved = Some(self.state.clone());
        Ok(())
    }

    fn commit_transaction(&mut self) -> StorageResult<()> {
        match self.saved.take() {
            Some(_) => Ok(()),
            None => Err(StorageError::TransactionState("no ledger transaction in progress".into())),
        }
    }

    fn rollback_transaction(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.state = saved;
        }
    }

    fn is_in_transaction(&self) -> bool {
        self.saved.is_some()
    }
}

impl DerivedTable for MemoryLedger {
    fn rollback_to(&mut self, height: i32) {
        let mut undone = 0usize;
        while let Some(entry) = self.state.journal.last() {
            if entry.height <= height {
                break;
            }
            let Some(entry) = self.state.journal.pop() else {
                break;
            };
            match entry.previous {
                Some(account) => {
                    self.state.accounts.insert(entry.account_id, account);
                }
                None => {
                    self.state.accounts.remove(&entry.account_id);
                }
            }
            undone += 1;
        }
        self.state.additions.retain(|(_, h), _| *h <= height);
        if height < 0 {
            self.state.genesis_balances.clear();
        }
        debug!("Ledger rolled back to height {} ({} changes undone)", height, undone);
    }

    fn trim(&mut self, height: i32) {
        self.state.journal.retain(|entry| entry.height >= height);
        let oldest_credit = height.saturating_sub(self.guaranteed_balance_confirmations);
        self.state.additions.retain(|(_, h), _| *h > oldest_credit);
        trace!("Ledger trimmed below height {}", height);
    }

    fn truncate(&mut self) {
        self.state = LedgerState::default();
    }
}

impl Ledger for MemoryLedger {
    fn account(&self, id: AccountId) -> Option<Account> {
        self.state.accounts.get(&id).cloned()
    }

    fn has_account(&self, id: AccountId, height: i32) -> bool {
        self.state
            .accounts
            .get(&id)
            .map_or(false, |a| a.creation_height <= height)
    }

    fn public_key(&self, id: AccountId) -> Option<PublicKey> {
        self.state.accounts.get(&id).and_then(|a| a.public_key)
    }

    fn genesis_balance_ker(&self, id: AccountId) -> i64 {
        self.state.genesis_balances.get(&id).copied().unwrap_or(0)
    }

    fn guaranteed_balance_ker(&self, id: AccountId, confirmations: i32, height: i32) -> i64 {
        let Some(account) = self.state.accounts.get(&id) else {
            return 0;
        };
        let from = height.saturating_sub(confirmations).saturating_add(1);
        if from > height {
            return account.balance_ker;
        }
        let recent: i64 = self
            .state
            .additions
            .range((id, from)..=(id, height))
            .map(|(_, amount)| *amount)
            .fold(0, i64::saturating_add);
        account.balance_ker.saturating_sub(recent).max(0)
    }

    fn lessors(&self, lessee: AccountId, height: i32) -> Vec<AccountId> {
        self.state
            .accounts
            .values()
            .filter(|a| a.active_lessee(height) == Some(lessee))
            .map(|a| a.id)
            .collect()
    }

    fn add_account(&mut self, id: AccountId, height: i32) -> LedgerResult<()> {
        if self.state.accounts.contains_key(&id) {
            return Ok(());
        }
        self.state.journal.push(JournalEntry {
            height,
            account_id: id,
            previous: None,
        });
        self.state.accounts.insert(id, Account::new(id, height));
        trace!("Created account {} at height {}", id, height);
        Ok(())
    }

    fn apply_public_key(&mut self, id: AccountId, key: &PublicKey, height: i32) -> LedgerResult<()> {
        self.add_account(id, height)?;
        self.modify(id, height, |account| match account.public_key {
            Some(existing) if existing != *key => Err(LedgerError::PublicKeyMismatch(id)),
            Some(_) => Ok(()),
            None => {
                account.public_key = Some(*key);
                account.key_height = height;
                Ok(())
            }
        })
    }

    fn add_to_balance(
        &mut self,
        id: AccountId,
        event: LedgerEvent,
        event_id: u64,
        amount_ker: i64,
        height: i32,
    ) -> LedgerResult<()> {
        if amount_ker == 0 {
            return Ok(());
        }
        self.modify(id, height, |account| Self::change_balance(account, amount_ker))?;
        self.record_addition(id, event, amount_ker, height);
        trace!("{:?} {} balance {:+} for {}", event, event_id, amount_ker, id);
        Ok(())
    }

    fn add_to_unconfirmed_balance(
        &mut self,
        id: AccountId,
        event: LedgerEvent,
        event_id: u64,
        amount_ker: i64,
        height: i32,
    ) -> LedgerResult<()> {
        if amount_ker == 0 {
            return Ok(());
        }
        self.modify(id, height, |account| Self::change_unconfirmed_balance(account, amount_ker))?;
        trace!("{:?} {} unconfirmed {:+} for {}", event, event_id, amount_ker, id);
        Ok(())
    }

    fn add_to_balance_and_unconfirmed_balance(
        &mut self,
        id: AccountId,
        event: LedgerEvent,
        event_id: u64,
        amount_ker: i64,
        height: i32,
    ) -> LedgerResult<()> {
        if amount_ker == 0 {
            return Ok(());
        }
        self.modify(id, height, |account| {
            Self::change_balance(account, amount_ker)?;
            Self::change_unconfirmed_balance(account, amount_ker)
        })?;
        self.record_addition(id, event, amount_ker, height);
        trace!("{:?} {} balance and unconfirmed {:+} for {}", event, event_id, amount_ker, id);
        Ok(())
    }

    fn add_to_forged_balance(&mut self, id: AccountId, amount_ker: i64, height: i32) -> LedgerResult<()> {
        if amount_ker == 0 {
            return Ok(());
        }
        self.modify(id, height, |account| {
            account.forged_balance_ker = account
                .forged_balance_ker
                .checked_add(amount_ker)
                .ok_or(LedgerError::Overflow(account.id))?;
            Ok(())
        })
    }

    fn lease_effective_balance(
        &mut self,
        lessor: AccountId,
        lessee: AccountId,
        period: u16,
        height: i32,
    ) -> LedgerResult<()> {
        let lease = lease_window(lessee, period, height);
        self.modify(lessor, height, |account| {
            account.lease = Some(lease);
            Ok(())
        })?;
        debug!(
            "Account {} leases to {} from {} to {}",
            lessor, lessee, lease.from_height, lease.to_height
        );
        Ok(())
    }

    fn accounts(&self) -> Vec<Account> {
        self.state.accounts.values().cloned().collect()
    }
}

impl std::fmt::Debug for MemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLedger")
            .field("accounts", &self.state.accounts.len())
            .field("journal", &self.state.journal.len())
            .field("in_transaction", &self.saved.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{KER_PER_SCTK, MIN_FORGING_BALANCE_KER};
    use crate::ledger::effective_balance_sctk;

    const CONFIRMATIONS: i32 = 10;

    fn funded(id: AccountId, amount: i64) -> MemoryLedger {
        let mut ledger = MemoryLedger::new(CONFIRMATIONS);
        ledger.add_account(id, 0).unwrap();
        ledger
            .add_to_balance_and_unconfirmed_balance(id, LedgerEvent::Genesis, 0, amount, 0)
            .unwrap();
        ledger
    }

    #[test]
    fn test_balances_and_negative_check() {
        let mut ledger = funded(1, 100);
        ledger.add_to_balance(1, LedgerEvent::Payment, 7, -40, 1).unwrap();
        let account = ledger.account(1).unwrap();
        assert_eq!(account.balance_ker, 60);
        assert_eq!(account.unconfirmed_balance_ker, 100);

        let result = ledger.add_to_balance(1, LedgerEvent::Payment, 8, -61, 1);
        assert!(matches!(result, Err(LedgerError::NegativeBalance { account: 1, balance: -1 })));
        assert_eq!(ledger.account(1).unwrap().balance_ker, 60);

        assert_eq!(
            ledger.add_to_balance(2, LedgerEvent::Payment, 9, 5, 1),
            Err(LedgerError::UnknownAccount(2))
        );
    }

    #[test]
    fn test_rollback_to_height() {
        let mut ledger = funded(1, 100);
        ledger.add_account(2, 1).unwrap();
        ledger.add_to_balance(1, LedgerEvent::Payment, 1, -30, 1).unwrap();
        ledger
            .add_to_balance_and_unconfirmed_balance(2, LedgerEvent::Payment, 1, 30, 1)
            .unwrap();
        ledger.add_to_balance(2, LedgerEvent::Payment, 2, -10, 2).unwrap();

        ledger.rollback_to(1);
        assert_eq!(ledger.account(2).unwrap().balance_ker, 30);

        ledger.rollback_to(0);
        assert!(ledger.account(2).is_none());
        assert_eq!(ledger.account(1).unwrap().balance_ker, 100);
        assert_eq!(ledger.genesis_balance_ker(1), 100);
    }

    #[test]
    fn test_public_key_conflict() {
        let mut ledger = funded(1, 100);
        ledger.apply_public_key(1, &[1u8; 32], 3).unwrap();
        ledger.apply_public_key(1, &[1u8; 32], 4).unwrap();
        assert_eq!(ledger.account(1).unwrap().key_height, 3);
        assert_eq!(
            ledger.apply_public_key(1, &[2u8; 32], 5),
            Err(LedgerError::PublicKeyMismatch(1))
        );
        ledger.rollback_to(2);
        assert_eq!(ledger.public_key(1), None);
    }

    #[test]
    fn test_transaction_rollback_restores_state() {
        let mut ledger = funded(1, 100);
        ledger.begin_transaction().unwrap();
        ledger.add_to_balance(1, LedgerEvent::Payment, 1, -50, 1).unwrap();
        ledger.rollback_transaction();
        assert_eq!(ledger.account(1).unwrap().balance_ker, 100);
        assert!(ledger.commit_transaction().is_err());
    }

    #[test]
    fn test_guaranteed_balance_excludes_recent_credits() {
        let mut ledger = funded(1, 100);
        ledger
            .add_to_balance_and_unconfirmed_balance(1, LedgerEvent::Payment, 1, 50, 20)
            .unwrap();
        assert_eq!(ledger.guaranteed_balance_ker(1, CONFIRMATIONS, 25), 100);
        assert_eq!(ledger.guaranteed_balance_ker(1, CONFIRMATIONS, 31), 150);
    }

    #[test]
    fn test_effective_balance() {
        let amount = MIN_FORGING_BALANCE_KER * 2;
        let mut ledger = funded(1, amount);
        assert_eq!(effective_balance_sctk(&ledger, 1, 5, CONFIRMATIONS), amount / KER_PER_SCTK);

        // no key yet
        assert_eq!(effective_balance_sctk(&ledger, 1, 50, CONFIRMATIONS), 0);
        ledger.apply_public_key(1, &[1u8; 32], 1).unwrap();
        assert_eq!(effective_balance_sctk(&ledger, 1, 11, CONFIRMATIONS), 0);
        assert_eq!(effective_balance_sctk(&ledger, 1, 50, CONFIRMATIONS), amount / KER_PER_SCTK);
    }

    #[test]
    fn test_leasing_moves_effective_balance() {
        let amount = MIN_FORGING_BALANCE_KER * 2;
        let mut ledger = funded(1, amount);
        ledger.add_account(2, 0).unwrap();
        ledger.apply_public_key(1, &[1u8; 32], 1).unwrap();
        ledger.apply_public_key(2, &[2u8; 32], 1).unwrap();
        ledger.lease_effective_balance(1, 2, 100, 20).unwrap();

        assert_eq!(ledger.lessors(2, 30), vec![1]);
        assert_eq!(effective_balance_sctk(&ledger, 1, 30, CONFIRMATIONS), 0);
        assert_eq!(effective_balance_sctk(&ledger, 2, 30, CONFIRMATIONS), amount / KER_PER_SCTK);
        assert!(ledger.lessors(2, 120).is_empty());
    }

    #[test]
    fn test_trim_drops_journal() {
        let mut ledger = funded(1, 100);
        ledger.add_to_balance(1, LedgerEvent::Payment, 1, -10, 5).unwrap();
        ledger.trim(5);
        assert_eq!(ledger.journal_len(), 1);
        ledger.truncate();
        assert!(ledger.accounts().is_empty());
    }
}

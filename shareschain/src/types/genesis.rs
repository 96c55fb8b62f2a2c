//! Genesis block and initial allocations

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};

use super::block::Block;
use super::{AccountId, Hash};
use crate::constants::GENESIS_GENERATION_SEED;
use crate::crypto;
use crate::ledger::{Ledger, LedgerEvent, LedgerResult};

/// Balance credited to an account at height 0
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisAllocation {
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    pub account_id: AccountId,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    #[serde(rename = "balanceKER")]
    pub balance_ker: i64,
}

/// Everything needed to rebuild the first block and its ledger state
#[derive(Debug, Clone)]
pub struct Genesis {
    allocations: Vec<GenesisAllocation>,
    epoch_beginning_ms: i64,
    base_target: i64,
}

impl Genesis {
    pub fn new(mut allocations: Vec<GenesisAllocation>, epoch_beginning_ms: i64, base_target: i64) -> Self {
        allocations.sort_by_key(|a| a.account_id);
        Self {
            allocations,
            epoch_beginning_ms,
            base_target,
        }
    }

    pub fn allocations(&self) -> &[GenesisAllocation] {
        &self.allocations
    }

    /// Digest over the allocations and the epoch, so a different genesis
    /// yields a different chain
    pub fn generation_signature(&self) -> Hash {
        let mut data = Vec::with_capacity(GENESIS_GENERATION_SEED.len() + self.allocations.len() * 16 + 8);
        data.extend_from_slice(GENESIS_GENERATION_SEED);
        for allocation in &self.allocations {
            data.extend_from_slice(&allocation.account_id.to_le_bytes());
            data.extend_from_slice(&allocation.balance_ker.to_le_bytes());
        }
        data.extend_from_slice(&self.epoch_beginning_ms.to_le_bytes());
        crypto::sha256(&data)
    }

    pub fn block(&self) -> Block {
        Block::genesis(0, self.generation_signature(), self.base_target)
    }

    /// Credit the allocations at height 0
    pub fn apply(&self, ledger: &mut dyn Ledger) -> LedgerResult<()> {
        let block_id = self.block().id();
        for allocation in &self.allocations {
            ledger.add_account(allocation.account_id, 0)?;
            ledger.add_to_balance_and_unconfirmed_balance(
                allocation.account_id,
                LedgerEvent::Genesis,
                block_id,
                allocation.balance_ker,
                0,
            )?;
        }
        Ok(())
    }

    pub fn total_ker(&self) -> i64 {
        self.allocations.iter().map(|a| a.balance_ker).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::INITIAL_BASE_TARGET;

    fn allocation(id: u64, balance: i64) -> GenesisAllocation {
        GenesisAllocation {
            account_id: id,
            balance_ker: balance,
        }
    }

    #[test]
    fn test_genesis_block_shape() {
        let genesis = Genesis::new(vec![allocation(1, 100)], 0, INITIAL_BASE_TARGET);
        let block = genesis.block();
        assert_eq!(block.version(), -1);
        assert_eq!(block.timestamp(), 0);
        assert_eq!(block.previous_block_id(), 0);
        assert_eq!(block.height(), 0);
        assert_eq!(block.cumulative_difficulty(), 0);
        assert_eq!(block.base_target(), INITIAL_BASE_TARGET);
        assert_eq!(block.block_signature(), Some(&[0u8; 64]));
        assert_eq!(block.generator_public_key(), &[0u8; 32]);
    }

    #[test]
    fn test_generation_signature_order_independent() {
        let a = Genesis::new(vec![allocation(1, 100), allocation(2, 200)], 0, 1);
        let b = Genesis::new(vec![allocation(2, 200), allocation(1, 100)], 0, 1);
        assert_eq!(a.generation_signature(), b.generation_signature());
        assert_eq!(a.block().id(), b.block().id());

        let c = Genesis::new(vec![allocation(1, 100)], 0, 1);
        assert_ne!(a.generation_signature(), c.generation_signature());
    }

    #[test]
    fn test_allocation_json_accepts_strings() {
        let json = r#"{"accountId":"18446744073709551615","balanceKER":5}"#;
        let parsed: GenesisAllocation = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.account_id, u64::MAX);
        assert_eq!(parsed.balance_ker, 5);
    }
}

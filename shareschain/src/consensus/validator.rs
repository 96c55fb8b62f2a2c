//! Block and transaction validation
//!
//! Blocks are checked against the current last block before anything is
//! applied; their transactions are checked in order against a per-block
//! duplicate registry. Transactions entering the mempool go through the
//! same `validate_transaction` used for full block validation.

use std::collections::HashSet;

use crate::constants::{
    BLOCK_VERSION, MAX_BALANCE_KER, MAX_NUMBER_OF_TRANSACTIONS, MAX_PAYLOAD_LENGTH, MAX_TIMEDRIFT,
    TRANSACTION_VERSION,
};
use crate::error::{BlockNotAccepted, ValidationError, ValidationResult};
use crate::ledger::Ledger;
use crate::storage::BlockStore;
use crate::types::{payload_hash, Block, DuplicateRegistry, Transaction};
use crate::ChainConfig;

use super::forger;

/// Chain state the rules are evaluated against
#[derive(Clone, Copy)]
pub struct ValidationContext<'a> {
    pub config: &'a ChainConfig,
    pub store: &'a dyn BlockStore,
    pub ledger: &'a dyn Ledger,
    /// Height of the current last block
    pub height: i32,
    /// Current epoch time
    pub now: i32,
}

/// Block version required on top of `previous_height`
pub fn block_version(_previous_height: i32) -> i32 {
    BLOCK_VERSION
}

/// Transaction version required on top of `previous_height`
pub fn transaction_version(_previous_height: i32) -> u8 {
    TRANSACTION_VERSION
}

// ========== Blocks ==========

/// Header checks for `block` on top of `previous`
pub fn validate_block(ctx: &ValidationContext<'_>, block: &Block, previous: &Block) -> Result<(), BlockNotAccepted> {
    if previous.id() != block.previous_block_id() {
        return Err(BlockNotAccepted::out_of_order("Previous block id doesn't match"));
    }
    if block.version() != block_version(previous.height()) {
        return Err(BlockNotAccepted::rejected(format!("Invalid version {}", block.version())));
    }
    if block.timestamp() > ctx.now + MAX_TIMEDRIFT {
        tracing::warn!(
            "Received block {} from the future, timestamp {} generator {} current time {}, system clock may be off",
            block.id(),
            block.timestamp(),
            block.generator_id(),
            ctx.now
        );
        return Err(BlockNotAccepted::out_of_order(format!(
            "Invalid timestamp: {} current time is {}",
            block.timestamp(),
            ctx.now
        )));
    }
    if block.timestamp() <= previous.timestamp() {
        return Err(BlockNotAccepted::rejected(format!(
            "Block timestamp {} is before previous block timestamp {}",
            block.timestamp(),
            previous.timestamp()
        )));
    }
    if &previous.hash() != block.previous_block_hash() {
        return Err(BlockNotAccepted::rejected("Previous block hash doesn't match"));
    }
    if block.id() == 0 || ctx.store.has_block(block.id(), previous.height()) {
        return Err(BlockNotAccepted::rejected("Duplicate block or invalid id"));
    }
    if !forger::verify_generation_signature(block, previous, ctx.ledger, ctx.config)
        && !forger::allows_fake_forging(block.generator_public_key(), ctx.config)
    {
        let balance = crate::ledger::effective_balance_sctk(
            ctx.ledger,
            block.generator_id(),
            previous.height(),
            ctx.config.guaranteed_balance_confirmations,
        );
        return Err(BlockNotAccepted::rejected(format!(
            "Generation signature verification failed, effective balance {}",
            balance
        )));
    }
    if !block.verify_block_signature() {
        return Err(BlockNotAccepted::rejected("Block signature verification failed"));
    }
    if block.transactions().len() > MAX_NUMBER_OF_TRANSACTIONS {
        return Err(BlockNotAccepted::rejected(format!(
            "Invalid block transaction count {}",
            block.transactions().len()
        )));
    }
    Ok(())
}

/// Check every transaction of `block`, then its fee total and payload hash.
///
/// With `full` unset only the timestamp and signature checks run, as when
/// replaying trusted blocks.
pub fn validate_block_transactions(
    ctx: &ValidationContext<'_>,
    block: &Block,
    previous: &Block,
    full: bool,
    duplicates: &mut DuplicateRegistry,
) -> Result<(), BlockNotAccepted> {
    let mut total_fee: i64 = 0;
    let mut seen = HashSet::new();
    for tx in block.transactions() {
        if tx.timestamp() > ctx.now + MAX_TIMEDRIFT {
            return Err(BlockNotAccepted::out_of_order(format!(
                "Invalid transaction timestamp: {}, current time is {}",
                tx.timestamp(),
                ctx.now
            )));
        }
        if !verify_sender(tx, ctx.ledger) {
            return Err(BlockNotAccepted::transaction(
                tx.id(),
                format!("Transaction signature verification failed at height {}", previous.height()),
            ));
        }
        if full {
            if !seen.insert(tx.id()) {
                return Err(BlockNotAccepted::transaction(tx.id(), "Duplicate transaction id"));
            }
            fully_validate_block_transaction(ctx, tx, block, previous)?;
        }
        if duplicates.check(tx) {
            return Err(BlockNotAccepted::transaction(tx.id(), "Transaction is a duplicate"));
        }
        total_fee = total_fee.saturating_add(tx.fee_ker());
    }
    if total_fee != block.total_fee_ker() {
        return Err(BlockNotAccepted::rejected("Total fee doesn't match transaction total"));
    }
    if &payload_hash(block.transactions()) != block.payload_hash() {
        return Err(BlockNotAccepted::rejected("Payload hash doesn't match"));
    }
    Ok(())
}

fn fully_validate_block_transaction(
    ctx: &ValidationContext<'_>,
    tx: &Transaction,
    block: &Block,
    previous: &Block,
) -> Result<(), BlockNotAccepted> {
    if tx.timestamp() > block.timestamp().saturating_add(MAX_TIMEDRIFT) || tx.expiration() < block.timestamp() {
        return Err(BlockNotAccepted::transaction(
            tx.id(),
            format!(
                "Invalid transaction timestamp {}, current time is {}, block timestamp is {}",
                tx.timestamp(),
                ctx.now,
                block.timestamp()
            ),
        ));
    }
    if ctx.store.has_transaction(tx.id(), previous.height()) {
        return Err(BlockNotAccepted::transaction(tx.id(), "Transaction is already in the blockchain"));
    }
    if tx.version() != transaction_version(previous.height()) {
        return Err(BlockNotAccepted::transaction(
            tx.id(),
            format!("Invalid transaction version {} at height {}", tx.version(), previous.height()),
        ));
    }
    validate_transaction(ctx, tx).map_err(|e| BlockNotAccepted::transaction(tx.id(), e))
}

// ========== Transactions ==========

/// Signature check plus consistency with the sender key already on chain
pub fn verify_sender(tx: &Transaction, ledger: &dyn Ledger) -> bool {
    if !tx.verify_signature() {
        return false;
    }
    match ledger.public_key(tx.sender_id()) {
        Some(known) => &known == tx.sender_public_key(),
        None => true,
    }
}

/// Stateful validation of a transaction against the current chain
pub fn validate_transaction(ctx: &ValidationContext<'_>, tx: &Transaction) -> ValidationResult<()> {
    if tx.id() == 0 {
        return Err(ValidationError::not_valid("Invalid transaction id 0"));
    }
    if tx.timestamp() <= 0
        || tx.deadline() < 1
        || tx.fee_ker() < 0
        || tx.fee_ker() > MAX_BALANCE_KER
        || tx.amount_ker() < 0
        || tx.amount_ker() > MAX_BALANCE_KER
    {
        return Err(ValidationError::not_valid(format!(
            "Invalid transaction parameters: type: {}, timestamp: {}, deadline: {}, fee: {}, amount: {}",
            tx.tx_type(),
            tx.timestamp(),
            tx.deadline(),
            tx.fee_ker(),
            tx.amount_ker()
        )));
    }
    let tx_type = tx.tx_type();
    if !tx_type.can_have_recipient() && (tx.recipient_id() != 0 || tx.amount_ker() != 0) {
        return Err(ValidationError::not_valid(
            "Transactions of this type must have recipient == 0, amount == 0",
        ));
    }
    if tx_type.must_have_recipient() && tx.recipient_id() == 0 {
        return Err(ValidationError::not_valid(
            "Transactions of this type must have a valid recipient",
        ));
    }

    if !tx.attachment().verify_version() {
        return Err(ValidationError::not_valid(format!(
            "Invalid attachment version {}",
            tx.attachment().version()
        )));
    }
    tx.attachment().validate(tx, ctx.ledger)?;

    let mut last_flag = 0;
    for appendix in tx.appendages() {
        if appendix.flag() <= last_flag {
            return Err(ValidationError::not_valid(format!(
                "Duplicate or not in order appendix {}",
                appendix.name()
            )));
        }
        last_flag = appendix.flag();
        if !appendix.is_allowed(tx_type) {
            return Err(ValidationError::not_valid(format!("Appendix not allowed {}", appendix.name())));
        }
        if !appendix.verify_version() {
            return Err(ValidationError::not_valid(format!(
                "Invalid attachment version {}",
                appendix.version()
            )));
        }
        appendix.validate(tx, ctx.ledger)?;
    }

    if tx.size() > MAX_PAYLOAD_LENGTH {
        return Err(ValidationError::not_valid(format!(
            "Transaction size {} exceeds maximum payload size",
            tx.size()
        )));
    }
    let minimum_fee = tx.minimum_fee_ker(ctx.height, ctx.ledger);
    if tx.fee_ker() < minimum_fee {
        return Err(ValidationError::not_currently_valid(format!(
            "Transaction fee {} less than minimum fee {} at height {}",
            tx.fee_ker(),
            minimum_fee,
            ctx.height
        )));
    }
    validate_ec_block(ctx, tx)
}

/// Replay protection: the referenced block must be on this chain
pub fn validate_ec_block(ctx: &ValidationContext<'_>, tx: &Transaction) -> ValidationResult<()> {
    if tx.ec_block_id() == 0 {
        return Err(ValidationError::not_valid(
            "To prevent transaction replay attacks, using ecBlockId=0 is not allowed",
        ));
    }
    if ctx.height < tx.ec_block_height() {
        return Err(ValidationError::not_currently_valid(format!(
            "ecBlockHeight {} exceeds blockchain height {}",
            tx.ec_block_height(),
            ctx.height
        )));
    }
    if ctx.store.find_block_id_at_height(tx.ec_block_height()) != Some(tx.ec_block_id()) {
        return Err(ValidationError::not_currently_valid(format!(
            "ecBlockHeight {} does not match ecBlockId {}, transaction was generated on a fork",
            tx.ec_block_height(),
            tx.ec_block_id()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::constants::{DEFAULT_FEE_KER, KER_PER_SCTK, NEW_ACCOUNT_FEE_KER};
    use crate::crypto::KeyPair;
    use crate::ledger::MemoryLedger;
    use crate::storage::MemoryBlockStore;
    use crate::types::{Attachment, BlockTemplate, TransactionBuilder};

    struct Fixture {
        config: ChainConfig,
        store: MemoryBlockStore,
        ledger: MemoryLedger,
        genesis: Arc<Block>,
    }

    impl Fixture {
        fn new() -> Self {
            let config = ChainConfig::devnet();
            let genesis = config.genesis();
            let mut store = MemoryBlockStore::new();
            let mut ledger = MemoryLedger::new(config.guaranteed_balance_confirmations);
            let block = Arc::new(genesis.block());
            store.save_block(block.clone()).unwrap();
            genesis.apply(&mut ledger).unwrap();
            Self {
                config,
                store,
                ledger,
                genesis: block,
            }
        }

        fn ctx(&self, now: i32) -> ValidationContext<'_> {
            ValidationContext {
                config: &self.config,
                store: &self.store,
                ledger: &self.ledger,
                height: 0,
                now,
            }
        }
    }

    fn payment(fee: i64, ec_height: i32, ec_id: u64) -> Transaction {
        let keys = ChainConfig::devnet_forger();
        TransactionBuilder::new(keys.public_key(), KER_PER_SCTK, fee, 60, Attachment::Payment, 100)
            .recipient(KeyPair::from_secret_phrase("recipient").account_id())
            .ec_block(ec_height, ec_id)
            .sign(&keys)
            .unwrap()
    }

    #[test]
    fn test_valid_payment() {
        let fixture = Fixture::new();
        let tx = payment(DEFAULT_FEE_KER + NEW_ACCOUNT_FEE_KER, 0, fixture.genesis.id());
        assert_eq!(validate_transaction(&fixture.ctx(100), &tx), Ok(()));
        assert!(verify_sender(&tx, &fixture.ledger));
    }

    #[test]
    fn test_fee_below_minimum() {
        let fixture = Fixture::new();
        let tx = payment(DEFAULT_FEE_KER, 0, fixture.genesis.id());
        let err = validate_transaction(&fixture.ctx(100), &tx).unwrap_err();
        assert!(matches!(err, ValidationError::NotCurrentlyValid(_)));
    }

    #[test]
    fn test_ec_block_replay_protection() {
        let fixture = Fixture::new();
        let fee = DEFAULT_FEE_KER + NEW_ACCOUNT_FEE_KER;
        let ctx = fixture.ctx(100);

        let zero = payment(fee, 0, 0);
        assert!(matches!(validate_ec_block(&ctx, &zero), Err(ValidationError::NotValid(_))));

        let future = payment(fee, 5, fixture.genesis.id());
        assert!(matches!(
            validate_ec_block(&ctx, &future),
            Err(ValidationError::NotCurrentlyValid(_))
        ));

        let fork = payment(fee, 0, fixture.genesis.id() ^ 1);
        assert!(matches!(
            validate_ec_block(&ctx, &fork),
            Err(ValidationError::NotCurrentlyValid(_))
        ));
    }

    #[test]
    fn test_block_header_checks() {
        let fixture = Fixture::new();
        let keys = ChainConfig::devnet_forger();
        let template = |previous_block_id, timestamp| BlockTemplate {
            version: BLOCK_VERSION,
            timestamp,
            previous_block_id,
            previous_block_hash: fixture.genesis.hash(),
            generation_signature: forger::generation_signature(&fixture.genesis, &keys.public_key()),
            transactions: Vec::new(),
        };

        let orphan = Block::forge(template(12345, 10), &keys);
        assert!(matches!(
            validate_block(&fixture.ctx(10), &orphan, &fixture.genesis),
            Err(BlockNotAccepted::OutOfOrder(_))
        ));

        let future = Block::forge(template(fixture.genesis.id(), 100), &keys);
        assert!(matches!(
            validate_block(&fixture.ctx(10), &future, &fixture.genesis),
            Err(BlockNotAccepted::OutOfOrder(_))
        ));
    }

    #[test]
    fn test_duplicate_transaction_in_block() {
        let fixture = Fixture::new();
        let keys = ChainConfig::devnet_forger();
        let tx = Arc::new(payment(DEFAULT_FEE_KER + NEW_ACCOUNT_FEE_KER, 0, fixture.genesis.id()));
        let block = Block::forge(
            BlockTemplate {
                version: BLOCK_VERSION,
                timestamp: 200,
                previous_block_id: fixture.genesis.id(),
                previous_block_hash: fixture.genesis.hash(),
                generation_signature: [0u8; 32],
                transactions: vec![tx.clone(), tx],
            },
            &keys,
        );
        let mut duplicates = DuplicateRegistry::new();
        let result = validate_block_transactions(&fixture.ctx(200), &block, &fixture.genesis, true, &mut duplicates);
        assert!(matches!(result, Err(BlockNotAccepted::TransactionRejected { .. })));
    }
}

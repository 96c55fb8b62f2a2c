//! End-to-end chain scenarios on devnet chains driven by a manual clock

use std::sync::Arc;

use shareschain::consensus::forger;
use shareschain::constants::{DEFAULT_FEE_KER, KER_PER_SCTK, NEW_ACCOUNT_FEE_KER};
use shareschain::crypto::KeyPair;
use shareschain::ledger::{effective_balance_sctk, Ledger, MemoryLedger};
use shareschain::network::{LocalNetwork, Network};
use shareschain::node::{Blockchain, Downloader, NodeEvent};
use shareschain::storage::MemoryBlockStore;
use shareschain::time::{ManualClock, Timekeeper};
use shareschain::types::{AccountId, Attachment, Block, Transaction, TransactionBuilder};
use shareschain::{BlockNotAccepted, ChainConfig, ChainError};

/// Epoch seconds the clock starts at
const START: i64 = 1000;

struct TestChain {
    chain: Arc<Blockchain>,
    clock: Arc<ManualClock>,
}

impl TestChain {
    fn new(config: ChainConfig) -> Self {
        let clock = Arc::new(ManualClock::new(config.epoch_beginning_ms + START * 1000));
        let timekeeper = Timekeeper::new(clock.clone(), config.epoch_beginning_ms);
        let ledger = MemoryLedger::new(config.guaranteed_balance_confirmations);
        let chain = Blockchain::new(config, timekeeper, Box::new(MemoryBlockStore::new()), Box::new(ledger)).unwrap();
        Self {
            chain: Arc::new(chain),
            clock,
        }
    }

    fn devnet() -> Self {
        Self::new(ChainConfig::devnet())
    }

    fn now(&self) -> i32 {
        self.chain.timekeeper().epoch_time()
    }

    fn set_now(&self, epoch_time: i32) {
        let epoch = self.chain.config().epoch_beginning_ms;
        self.clock.set_millis(epoch + i64::from(epoch_time) * 1000);
    }

    /// First timestamp `keys` may forge at on top of the tip, not before now
    fn forging_timestamp(&self, keys: &KeyPair) -> i32 {
        let last = self.chain.last_block();
        let config = self.chain.config();
        let balance = self.chain.read(|s| {
            effective_balance_sctk(
                s.ledger(),
                keys.account_id(),
                last.height(),
                config.guaranteed_balance_confirmations,
            )
        });
        let hit = forger::hit(&keys.public_key(), &last, config);
        let hit_time = forger::hit_time(balance, hit, &last) as i32;
        (hit_time + 1).max(self.now())
    }

    /// Forge the next block, moving the clock forward if needed
    fn forge(&self, keys: &KeyPair) -> Arc<Block> {
        self.forge_at(keys, self.forging_timestamp(keys))
    }

    fn forge_at(&self, keys: &KeyPair, timestamp: i32) -> Arc<Block> {
        if timestamp > self.now() {
            self.set_now(timestamp);
        }
        self.chain.generate_block(keys, timestamp).unwrap()
    }

    fn balance(&self, account_id: AccountId) -> i64 {
        self.chain
            .read(|s| s.ledger().account(account_id))
            .map_or(0, |a| a.balance_ker)
    }

    fn is_waiting(&self, tx: &Transaction) -> bool {
        self.chain.read(|s| s.pool().is_waiting(tx.id()))
    }

    /// Run the waiting queue once, dropping copies of confirmed transactions
    fn settle_waiting(&self) {
        self.chain.process_waiting_transactions().unwrap();
    }

    fn payment(&self, recipient: AccountId, amount: i64, extra_fee: i64) -> Arc<Transaction> {
        let keys = ChainConfig::devnet_forger();
        let (ec_height, ec_id) = self.chain.ec_block(self.now());
        Arc::new(
            TransactionBuilder::new(
                keys.public_key(),
                amount,
                DEFAULT_FEE_KER + NEW_ACCOUNT_FEE_KER + extra_fee,
                60,
                Attachment::Payment,
                self.now(),
            )
            .recipient(recipient)
            .ec_block(ec_height, ec_id)
            .sign(&keys)
            .unwrap(),
        )
    }
}

/// Copy through the byte form, the way blocks arrive from a peer
fn received(block: &Block) -> Block {
    let transactions = block
        .transactions()
        .iter()
        .map(|tx| Arc::new(Transaction::parse(tx.bytes()).unwrap()))
        .collect();
    Block::parse(block.bytes(), transactions).unwrap()
}

fn recipient() -> AccountId {
    KeyPair::from_secret_phrase("scenario recipient").account_id()
}

#[test]
fn test_forged_block_extends_genesis() {
    let t = TestChain::devnet();
    let keys = ChainConfig::devnet_forger();
    let genesis = t.chain.last_block();
    let mut events = t.chain.subscribe();

    let block = t.forge(&keys);

    assert_eq!(t.chain.height(), 1);
    assert_eq!(block.previous_block_id(), genesis.id());
    assert_eq!(block.generator_id(), keys.account_id());
    assert!(block.cumulative_difficulty() > genesis.cumulative_difficulty());
    assert_eq!(t.chain.block_at_height(1).map(|b| b.id()), Some(block.id()));
    assert_eq!(
        events.try_recv().unwrap(),
        NodeEvent::BlockPushed {
            id: block.id(),
            height: 1
        }
    );
}

#[test]
fn test_payment_is_confirmed_and_pop_off_restores_balances() {
    let t = TestChain::devnet();
    let keys = ChainConfig::devnet_forger();
    let forger_id = keys.account_id();
    t.forge(&keys);
    let forger_before = t.balance(forger_id);

    let amount = 50 * KER_PER_SCTK;
    let tx = t.payment(recipient(), amount, 0);
    t.chain.broadcast_transaction(tx.clone()).unwrap();
    assert_eq!(t.chain.unconfirmed_count(), 1);

    let block = t.forge(&keys);
    assert_eq!(block.transactions().len(), 1);
    assert_eq!(block.total_fee_ker(), tx.fee_ker());
    assert_eq!(t.chain.unconfirmed_count(), 0);
    assert_eq!(t.balance(recipient()), amount);
    // The generator collects its own fee back
    assert_eq!(t.balance(forger_id), forger_before - amount);
    assert!(t.chain.transaction(tx.id()).is_some());
    t.settle_waiting();
    assert!(!t.is_waiting(&tx));

    let popped = t.chain.pop_off_to_height(1).unwrap();
    assert_eq!(popped.len(), 1);
    assert_eq!(popped[0].id(), block.id());
    assert_eq!(t.chain.height(), 1);
    assert_eq!(t.balance(recipient()), 0);
    assert_eq!(t.balance(forger_id), forger_before);
    assert!(t.chain.transaction(tx.id()).is_none());

    // the payment is back in the mempool
    assert!(t.is_waiting(&tx));
    t.settle_waiting();
    assert_eq!(t.chain.unconfirmed_count(), 1);
    assert_eq!(t.chain.unconfirmed_transactions()[0].id(), tx.id());
}

#[test]
fn test_pop_last_block_requeues_its_transactions() {
    let t = TestChain::devnet();
    let keys = ChainConfig::devnet_forger();
    let first = t.forge(&keys);
    let tx = t.payment(recipient(), 10 * KER_PER_SCTK, 0);
    t.chain.broadcast_transaction(tx.clone()).unwrap();
    t.forge(&keys);
    t.settle_waiting();
    assert_eq!(t.chain.unconfirmed_count(), 0);

    let tip = t.chain.pop_last_block().unwrap();
    assert_eq!(tip.id(), first.id());
    assert_eq!(t.balance(recipient()), 0);
    assert!(t.is_waiting(&tx));

    t.settle_waiting();
    assert_eq!(t.chain.unconfirmed_count(), 1);
    assert!(!t.is_waiting(&tx));
}

#[test]
fn test_ec_block_follows_transaction_timestamp() {
    let t = TestChain::devnet();
    let keys = ChainConfig::devnet_forger();
    let genesis_id = t.chain.genesis_block_id();
    let first = t.forge(&keys);
    t.forge(&keys);

    // short chains always reference genesis
    assert_eq!(t.chain.ec_block(t.now()), (0, genesis_id));
    assert_eq!(t.chain.ec_block(first.timestamp()), (0, genesis_id));
    assert_eq!(t.chain.ec_block(-1), (0, genesis_id));

    let tx = t.payment(recipient(), KER_PER_SCTK, 0);
    assert_eq!(tx.ec_block_height(), 0);
    assert_eq!(tx.ec_block_id(), genesis_id);
    t.chain.broadcast_transaction(tx).unwrap();
}

#[test]
fn test_heavier_fork_replaces_lighter_chain() {
    let keys = ChainConfig::devnet_forger();
    let a = TestChain::devnet();
    let b = TestChain::devnet();
    let genesis = a.chain.last_block();

    let a1 = a.forge(&keys);
    let a2 = a.forge(&keys);
    let tx = b.payment(recipient(), KER_PER_SCTK, 0);
    b.chain.broadcast_transaction(tx.clone()).unwrap();
    let b1 = b.forge_at(&keys, a1.timestamp() + 7);
    assert_ne!(a1.id(), b1.id());
    assert_eq!(b1.transactions().len(), 1);
    b.settle_waiting();
    assert!(!b.is_waiting(&tx));
    let now = a.now().max(b.now());
    a.set_now(now);
    b.set_now(now);

    b.chain
        .process_fork(vec![received(&a1), received(&a2)], &genesis)
        .unwrap();
    assert_eq!(b.chain.height(), 2);
    assert_eq!(b.chain.last_block().id(), a2.id());
    assert!(b.chain.block(b1.id()).is_none());
    // the abandoned block's payment waits for re-admission on the new chain
    assert!(b.chain.transaction(tx.id()).is_none());
    assert!(b.is_waiting(&tx));
    b.settle_waiting();
    assert_eq!(b.chain.unconfirmed_count(), 1);

    let err = a.chain.process_fork(vec![received(&b1)], &genesis).unwrap_err();
    assert!(matches!(err, ChainError::Block(BlockNotAccepted::LowerDifficulty(_))));
    assert_eq!(a.chain.height(), 2);
    assert_eq!(a.chain.last_block().id(), a2.id());
    assert_eq!(a.chain.block_at_height(1).map(|b| b.id()), Some(a1.id()));
}

#[test]
fn test_stale_and_future_blocks_are_refused() {
    let keys = ChainConfig::devnet_forger();
    let a = TestChain::devnet();
    let b = TestChain::devnet();

    let a1 = a.forge(&keys);
    b.set_now(a.now());
    b.chain.push_block(received(&a1)).unwrap();

    let err = b.chain.push_block(received(&a1)).unwrap_err();
    assert!(matches!(err, ChainError::Block(BlockNotAccepted::OutOfOrder(_))));
    assert_eq!(b.chain.height(), 1);

    let future = a.now() + 100;
    let err = a.chain.generate_block(&keys, future).unwrap_err();
    assert!(matches!(err, ChainError::Block(BlockNotAccepted::OutOfOrder(_))));
    assert_eq!(a.chain.height(), 1);
    assert_eq!(a.chain.last_block().id(), a1.id());
}

#[test]
fn test_full_pool_evicts_lowest_fee() {
    let t = TestChain::new(ChainConfig {
        max_unconfirmed_transactions: 2,
        ..ChainConfig::devnet()
    });
    let cheap = t.payment(recipient(), KER_PER_SCTK, 1);
    let middle = t.payment(recipient(), KER_PER_SCTK, 2);
    let rich = t.payment(recipient(), KER_PER_SCTK, 3);

    t.chain.broadcast_transaction(cheap.clone()).unwrap();
    t.chain.broadcast_transaction(middle.clone()).unwrap();
    t.chain.broadcast_transaction(rich.clone()).unwrap();

    let mut ids: Vec<_> = t.chain.unconfirmed_transactions().iter().map(|tx| tx.id()).collect();
    ids.sort_unstable();
    let mut expected = vec![middle.id(), rich.id()];
    expected.sort_unstable();
    assert_eq!(ids, expected);

    // A cheaper transaction than everything pooled is turned away
    let cheapest = t.payment(recipient(), 2 * KER_PER_SCTK, 0);
    assert!(t.chain.broadcast_transaction(cheapest).is_err());
    assert_eq!(t.chain.unconfirmed_count(), 2);
}

#[test]
fn test_download_from_local_peer() {
    let keys = ChainConfig::devnet_forger();
    let online = ChainConfig {
        offline: false,
        ..ChainConfig::devnet()
    };
    let a = TestChain::new(online.clone());
    let b = TestChain::new(online);
    for _ in 0..3 {
        a.forge(&keys);
    }
    b.set_now(a.now());

    let network = LocalNetwork::new();
    let peer = network.add_peer("a", &a.chain);
    b.chain.set_network(Arc::new(network));
    assert_eq!(b.chain.network().connected_peers().len(), 1);

    let downloader = Downloader::new(b.chain.clone());
    downloader.run().unwrap();

    assert_eq!(b.chain.height(), 3);
    assert_eq!(b.chain.last_block().id(), a.chain.last_block().id());
    assert_eq!(downloader.stats().blocks_downloaded, 3);
    assert!(!peer.is_blacklisted());
}

#[test]
fn test_new_block_is_broadcast_to_peers() {
    let keys = ChainConfig::devnet_forger();
    let a = TestChain::devnet();
    let b = TestChain::devnet();

    let network = LocalNetwork::new();
    network.add_peer("b", &b.chain);
    a.chain.set_network(Arc::new(network));

    let mut events = b.chain.subscribe();
    let block = a.forge(&keys);

    assert_eq!(b.chain.height(), 1);
    assert_eq!(b.chain.last_block().id(), block.id());
    assert_eq!(
        events.try_recv().unwrap(),
        NodeEvent::BlockPushed {
            id: block.id(),
            height: 1
        }
    );
}

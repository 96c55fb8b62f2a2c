//! Blockchain download
//!
//! Pulls a heavier chain from peers:
//! - ask a random peer for its cumulative difficulty
//! - find the last common milestone, then the block ids after it
//! - fetch the blocks in segments, spreading segments over peers
//! - push what extends our tip and resolve the rest as a fork
//! - on a switch of more than a few blocks, ask other peers to confirm
//!
//! Peers are blacklisted for protocol violations only. A peer that does
//! not answer is treated as having nothing useful.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLockUpgradableReadGuard;
use rand::Rng;
use tracing::{debug, info};

use crate::constants::{
    DOWNLOAD_SEGMENT_SIZE, FORK_CONFIRMATION_THRESHOLD, MAX_MILESTONE_IDS, MAX_NEXT_BLOCK_IDS, MIN_MAX_ROLLBACK,
};
use crate::network::{Peer, PeerError, PeerResult};
use crate::types::{Block, BlockId};
use crate::ChainResult;

use super::chain::{Blockchain, ChainState};
use super::NodeError;

/// Block ids requested when checking a fork with another peer
const CONFIRMATION_BLOCK_IDS: usize = MAX_NEXT_BLOCK_IDS / 2;

/// Download statistics
#[derive(Debug, Clone, Default)]
pub struct DownloadStats {
    pub blocks_downloaded: u64,
    pub total_millis: u64,
    pub forks_processed: u64,
    pub peers_blacklisted: u64,
}

/// Drives `get_more_blocks` against the chain's network
pub struct Downloader {
    chain: Arc<Blockchain>,
    stop: AtomicBool,
    downloading: AtomicBool,
    stats: parking_lot::Mutex<DownloadStats>,
}

/// Outcome of the common milestone search
enum Milestone {
    Found { id: BlockId, peer_has_more: bool },
    NotFound,
}

/// A block together with the peer it came from
struct PeerBlock {
    peer: Arc<dyn Peer>,
    block: Block,
}

impl Downloader {
    pub fn new(chain: Arc<Blockchain>) -> Self {
        Self {
            chain,
            stop: AtomicBool::new(false),
            downloading: AtomicBool::new(false),
            stats: parking_lot::Mutex::new(DownloadStats::default()),
        }
    }

    /// Ask the loop to stop after the current segment
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DownloadStats {
        self.stats.lock().clone()
    }

    /// Download until a pass leaves the height unchanged
    pub fn run(&self) -> ChainResult<()> {
        loop {
            if self.is_stopped() {
                return Ok(());
            }
            let height = self.chain.height();
            match self.download_from_peer() {
                Ok(()) => {}
                Err(crate::ChainError::Node(NodeError::ShuttingDown)) => {
                    info!("Blockchain download stopped");
                    return Ok(());
                }
                Err(e) => {
                    info!("Error in blockchain download: {}", e);
                    return Err(e);
                }
            }
            if self.chain.height() == height {
                if self.downloading.swap(false, Ordering::SeqCst) {
                    info!("Finished blockchain download");
                }
                return Ok(());
            }
        }
    }

    /// One pass against a randomly chosen peer.
    ///
    /// Peer requests run without the chain lock; it is taken only to apply
    /// what was fetched.
    pub fn download_from_peer(&self) -> ChainResult<()> {
        let started = Instant::now();
        let config = self.chain.config();
        let network = self.chain.network();
        let mut peers = network.connected_peers();
        let confirmations_needed = if self.chain.height() > config.last_known_block - MIN_MAX_ROLLBACK {
            config.number_of_fork_confirmations
        } else {
            config.number_of_fork_confirmations.min(2)
        };
        if peers.len() <= confirmations_needed {
            return Ok(());
        }
        let feeder = peers[rand::thread_rng().gen_range(0..peers.len())].clone();

        let Ok(feeder_info) = feeder.cumulative_difficulty() else {
            return Ok(());
        };
        if feeder_info.cumulative_difficulty <= self.chain.cumulative_difficulty() {
            return Ok(());
        }

        let common_milestone = if self.chain.height() > 0 {
            match self.common_milestone_block_id(&*feeder) {
                Milestone::Found { id, peer_has_more: true } => id,
                _ => return Ok(()),
            }
        } else {
            self.chain.genesis_block_id()
        };

        let chain_block_ids = self.block_ids_after_common(&*feeder, common_milestone, false);
        if chain_block_ids.len() < 2 {
            return Ok(());
        }
        let common_block_id = chain_block_ids[0];
        let Some(common_block) = self.chain.block(common_block_id) else {
            return Ok(());
        };
        let last_block = self.chain.last_block();
        if last_block.height() - common_block.height() >= MIN_MAX_ROLLBACK {
            debug!(
                "{} advertised chain with better difficulty, but the last common block is at height {}",
                feeder.host(),
                common_block.height()
            );
            return Ok(());
        }
        if feeder_info.height.saturating_sub(common_block.height()) > FORK_CONFIRMATION_THRESHOLD as i32
            && !self.downloading.swap(true, Ordering::SeqCst)
        {
            info!("Blockchain download in progress");
        }

        let blocks = self.fetch_blockchain(&feeder, &mut peers, &chain_block_ids)?;
        self.apply_blockchain(&feeder, &chain_block_ids, blocks, &common_block, common_block.height());

        if self.chain.height() - common_block.height() > FORK_CONFIRMATION_THRESHOLD as i32 {
            let mut confirmations = 0;
            let candidates = peers.clone();
            for other in &candidates {
                if confirmations >= confirmations_needed {
                    break;
                }
                if other.host() == feeder.host() {
                    continue;
                }
                let other_ids = self.block_ids_after_common(&**other, common_block_id, true);
                let Some(&other_common_id) = other_ids.first() else {
                    continue;
                };
                let tip = self.chain.last_block();
                if other_common_id == tip.id() {
                    confirmations += 1;
                    continue;
                }
                let Some(other_common) = self.chain.block(other_common_id) else {
                    continue;
                };
                if tip.height() - other_common.height() >= MIN_MAX_ROLLBACK {
                    continue;
                }
                let Ok(other_info) = other.cumulative_difficulty() else {
                    continue;
                };
                if other_info.cumulative_difficulty <= tip.cumulative_difficulty() {
                    continue;
                }
                debug!("Found a node with better difficulty");
                let blocks = self.fetch_blockchain(other, &mut peers, &other_ids)?;
                self.apply_blockchain(other, &other_ids, blocks, &other_common, common_block.height());
            }
            debug!("Got {} confirmations", confirmations);
        }

        let tip = self.chain.last_block();
        if tip.id() != last_block.id() {
            let blocks = (tip.height() - common_block.height()).max(0) as u64;
            let millis = started.elapsed().as_millis() as u64;
            let mut stats = self.stats.lock();
            stats.blocks_downloaded += blocks;
            stats.total_millis += millis;
            info!(
                "Downloaded {} blocks in {} s, {} per s",
                blocks,
                millis / 1000,
                stats.blocks_downloaded * 1000 / stats.total_millis.max(1)
            );
        } else {
            debug!("Did not accept node's blocks, back to our own fork");
        }
        Ok(())
    }

    fn has_block(&self, id: BlockId) -> bool {
        self.chain.read(|s| s.store().has_block(id, s.height()))
    }

    /// Walk the peer's milestones down until one is in our chain
    fn common_milestone_block_id(&self, peer: &dyn Peer) -> Milestone {
        let mut last_milestone_block_id = 0;
        let mut peer_has_more = true;
        loop {
            let last_block_id = if last_milestone_block_id == 0 {
                self.chain.last_block().id()
            } else {
                0
            };
            let response = match peer.milestone_block_ids(last_block_id, last_milestone_block_id) {
                Ok(response) => response,
                Err(_) => return Milestone::NotFound,
            };
            if response.ids.is_empty() {
                return Milestone::Found {
                    id: self.chain.genesis_block_id(),
                    peer_has_more,
                };
            }
            if response.ids.len() > MAX_MILESTONE_IDS {
                debug!("Obsolete or rogue node {} sends too many milestoneBlockIds, blacklisting", peer.host());
                peer.blacklist("Too many milestoneBlockIds");
                return Milestone::NotFound;
            }
            if response.last {
                peer_has_more = false;
            }
            let height = self.chain.height();
            for id in &response.ids {
                if self.chain.read(|s| s.store().has_block(*id, height)) {
                    if last_milestone_block_id == 0 && response.ids.len() > 1 {
                        peer_has_more = false;
                    }
                    return Milestone::Found { id: *id, peer_has_more };
                }
                last_milestone_block_id = *id;
            }
        }
    }

    /// Our common block followed by the peer's ids after it.
    ///
    /// Empty when the peer does not answer or misbehaves.
    fn block_ids_after_common(
        &self,
        peer: &dyn Peer,
        start_block_id: BlockId,
        count_from_start: bool,
    ) -> Vec<BlockId> {
        let limit = if count_from_start {
            CONFIRMATION_BLOCK_IDS
        } else {
            MAX_NEXT_BLOCK_IDS
        };
        let mut match_id = start_block_id;
        let mut matched = false;
        let mut ids = Vec::new();
        loop {
            let next_ids = match peer.next_block_ids(match_id, limit) {
                Ok(next_ids) => next_ids,
                Err(_) => return Vec::new(),
            };
            if next_ids.is_empty() {
                break;
            }
            if next_ids.len() > limit {
                debug!("Obsolete or rogue node {} sends too many nextBlockIds, blacklisting", peer.host());
                peer.blacklist("Too many nextBlockIds");
                return Vec::new();
            }
            let mut matching = true;
            for (count, id) in next_ids.iter().enumerate() {
                if matching {
                    if self.has_block(*id) {
                        match_id = *id;
                        matched = true;
                    } else {
                        ids.push(match_id);
                        ids.push(*id);
                        matching = false;
                    }
                } else {
                    ids.push(*id);
                    if ids.len() >= CONFIRMATION_BLOCK_IDS {
                        break;
                    }
                }
                if count_from_start && count + 1 >= CONFIRMATION_BLOCK_IDS {
                    break;
                }
            }
            if !matching || count_from_start {
                break;
            }
        }
        if ids.is_empty() && matched {
            ids.push(match_id);
        }
        ids
    }

    /// Fetch the blocks listed in `chain_block_ids`.
    ///
    /// The first segment comes from `feeder`, the others are spread over
    /// the connected peers; a segment is retried once from the feeder.
    fn fetch_blockchain(
        &self,
        feeder: &Arc<dyn Peer>,
        peers: &mut Vec<Arc<dyn Peer>>,
        chain_block_ids: &[BlockId],
    ) -> ChainResult<HashMap<BlockId, PeerBlock>> {
        let mut blocks: HashMap<BlockId, PeerBlock> = HashMap::new();
        let stop = chain_block_ids.len() - 1;
        let mut segments: Vec<Segment> = (0..stop)
            .step_by(DOWNLOAD_SEGMENT_SIZE)
            .map(|start| Segment {
                start,
                stop: (start + DOWNLOAD_SEGMENT_SIZE).min(stop),
                requests: 0,
                peer: None,
            })
            .collect();
        let mut next_peer = if peers.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..peers.len())
        };

        'download: while !segments.is_empty() && !peers.is_empty() {
            if self.is_stopped() {
                return Err(NodeError::ShuttingDown.into());
            }
            for segment in segments.iter_mut() {
                if segment.requests > 1 {
                    break 'download;
                }
                let peer = if segment.start == 0 || segment.requests != 0 {
                    feeder.clone()
                } else {
                    loop {
                        if peers.is_empty() {
                            break 'download;
                        }
                        if next_peer >= peers.len() {
                            next_peer = 0;
                        }
                        let candidate = peers[next_peer].clone();
                        next_peer += 1;
                        if candidate.is_connected() {
                            break candidate;
                        }
                        peers.retain(|p| p.host() != candidate.host());
                    }
                };
                if segment
                    .peer
                    .as_ref()
                    .map_or(false, |previous| previous.host() == peer.host())
                {
                    break 'download;
                }
                segment.peer = Some(peer);
            }

            let mut remaining = Vec::with_capacity(segments.len());
            for mut segment in segments.drain(..) {
                let Some(peer) = segment.peer.clone() else {
                    remaining.push(segment);
                    continue;
                };
                segment.requests += 1;
                let ids = &chain_block_ids[segment.start + 1..=segment.stop];
                let received = match fetch_segment(&*peer, chain_block_ids[segment.start], ids) {
                    Some(received) => received,
                    None => {
                        peers.retain(|p| p.host() != peer.host());
                        continue;
                    }
                };
                let mut index = segment.start + 1;
                for block in received {
                    if index > segment.stop || block.id() != chain_block_ids[index] {
                        break;
                    }
                    blocks.insert(
                        block.id(),
                        PeerBlock {
                            peer: peer.clone(),
                            block,
                        },
                    );
                    index += 1;
                }
                if index <= segment.stop {
                    segment.start = index - 1;
                    remaining.push(segment);
                }
            }
            segments = remaining;
        }

        Ok(blocks)
    }

    /// Apply fetched blocks unless `common_block` left our chain meanwhile
    fn apply_blockchain(
        &self,
        feeder: &Arc<dyn Peer>,
        chain_block_ids: &[BlockId],
        blocks: HashMap<BlockId, PeerBlock>,
        common_block: &Block,
        start_height: i32,
    ) {
        if blocks.is_empty() {
            return;
        }
        let state = self.chain.state.upgradable_read();
        if !state.store.has_block(common_block.id(), state.height()) {
            debug!("Common block {} is no longer in the chain, dropping downloaded blocks", common_block.id());
            return;
        }
        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        self.apply_downloaded(&mut state, feeder, chain_block_ids, blocks, common_block, start_height);
        let outbox = self.chain.settle(&mut state);
        drop(state);
        self.chain.flush(outbox);
    }

    fn apply_downloaded(
        &self,
        state: &mut ChainState,
        feeder: &Arc<dyn Peer>,
        chain_block_ids: &[BlockId],
        mut blocks: HashMap<BlockId, PeerBlock>,
        common_block: &Block,
        start_height: i32,
    ) {
        let mut fork_blocks = Vec::new();
        for id in chain_block_ids.iter().skip(1) {
            if state.height() - start_height >= MIN_MAX_ROLLBACK {
                break;
            }
            let Some(PeerBlock { peer, block }) = blocks.remove(id) else {
                break;
            };
            if state.last_block.id() == block.previous_block_id() {
                if let Err(e) = self.chain.push_block_locked(state, block) {
                    self.blacklist_for(&*peer, &e);
                }
            } else {
                fork_blocks.push(block);
            }
        }
        let my_fork_size = state.height() - start_height;
        if !fork_blocks.is_empty() && my_fork_size < MIN_MAX_ROLLBACK {
            debug!(
                "Will process a fork of {} blocks, mine is {}",
                fork_blocks.len(),
                my_fork_size
            );
            self.stats.lock().forks_processed += 1;
            if let Err(e) = self.chain.process_fork_locked(state, fork_blocks, common_block) {
                self.blacklist_for(&**feeder, &e);
            }
        }
    }

    fn blacklist_for(&self, peer: &dyn Peer, error: &crate::ChainError) {
        let fault = match error {
            crate::ChainError::Block(e) => e.is_peer_fault(),
            crate::ChainError::Validation(_) | crate::ChainError::Codec(_) => true,
            _ => false,
        };
        if fault {
            peer.blacklist(&error.to_string());
            self.stats.lock().peers_blacklisted += 1;
        } else {
            debug!("{} sent a block that was not accepted: {}", peer.host(), error);
        }
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("stopped", &self.is_stopped())
            .field("downloading", &self.is_downloading())
            .finish()
    }
}

/// A run of block ids fetched with one request
struct Segment {
    /// Index of the block the request starts after
    start: usize,
    /// Index of the last block of the segment
    stop: usize,
    requests: u32,
    peer: Option<Arc<dyn Peer>>,
}

/// Blocks after `start_id`; None when the peer has nothing useful
fn fetch_segment(peer: &dyn Peer, start_id: BlockId, ids: &[BlockId]) -> Option<Vec<Block>> {
    let received: PeerResult<Vec<Block>> = peer.next_blocks(start_id, ids);
    match received {
        Ok(blocks) if blocks.is_empty() => None,
        Ok(blocks) if blocks.len() > ids.len() => {
            debug!("Obsolete or rogue node {} sends too many nextBlocks, blacklisting", peer.host());
            peer.blacklist("Too many nextBlocks");
            None
        }
        Ok(blocks) => Some(blocks),
        Err(PeerError::Malformed { reason, .. }) => {
            debug!("Failed to parse block: {}", reason);
            peer.blacklist(&reason);
            None
        }
        Err(PeerError::NoResponse(_)) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::ledger::MemoryLedger;
    use crate::network::{LocalPeer, MilestoneBlockIds, Network, PeerChainInfo};
    use crate::storage::MemoryBlockStore;
    use crate::time::{ManualClock, Timekeeper};
    use crate::types::Transaction;
    use crate::ChainConfig;
    use parking_lot::Mutex;

    /// Seconds between forged blocks, past the testnet idle limit
    const SPACING: i64 = 1000;

    fn open(clock: Arc<ManualClock>) -> Arc<Blockchain> {
        let config = ChainConfig {
            offline: false,
            ..ChainConfig::devnet()
        };
        let timekeeper = Timekeeper::new(clock, config.epoch_beginning_ms);
        let ledger = MemoryLedger::new(config.guaranteed_balance_confirmations);
        Arc::new(Blockchain::new(config, timekeeper, Box::new(MemoryBlockStore::new()), Box::new(ledger)).unwrap())
    }

    /// Peer that notes whether the downloading chain's lock was free while
    /// each request was answered
    struct LockWatchingPeer {
        inner: LocalPeer,
        downloading: Arc<Blockchain>,
        lock_free: Mutex<Vec<bool>>,
    }

    impl LockWatchingPeer {
        fn observe(&self) {
            let free = self.downloading.state.try_upgradable_read().is_some();
            self.lock_free.lock().push(free);
        }
    }

    impl Peer for LockWatchingPeer {
        fn host(&self) -> &str {
            self.inner.host()
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        fn cumulative_difficulty(&self) -> PeerResult<PeerChainInfo> {
            self.observe();
            self.inner.cumulative_difficulty()
        }

        fn milestone_block_ids(&self, last_block_id: BlockId, last_milestone_block_id: BlockId) -> PeerResult<MilestoneBlockIds> {
            self.observe();
            self.inner.milestone_block_ids(last_block_id, last_milestone_block_id)
        }

        fn next_block_ids(&self, block_id: BlockId, limit: usize) -> PeerResult<Vec<BlockId>> {
            self.observe();
            self.inner.next_block_ids(block_id, limit)
        }

        fn next_blocks(&self, block_id: BlockId, ids: &[BlockId]) -> PeerResult<Vec<Block>> {
            self.observe();
            self.inner.next_blocks(block_id, ids)
        }

        fn blacklist(&self, reason: &str) {
            self.inner.blacklist(reason)
        }
    }

    struct SinglePeerNetwork(Arc<LockWatchingPeer>);

    impl Network for SinglePeerNetwork {
        fn connected_peers(&self) -> Vec<Arc<dyn Peer>> {
            vec![self.0.clone()]
        }

        fn broadcast_block(&self, _block: &Block) {}

        fn broadcast_transactions(&self, _transactions: &[Arc<Transaction>]) {}
    }

    #[test]
    fn test_peer_requests_run_without_chain_lock() {
        let config = ChainConfig::devnet();
        let keys = ChainConfig::devnet_forger();
        let clock = Arc::new(ManualClock::new(config.epoch_beginning_ms));
        let source = open(clock.clone());
        let target = open(clock.clone());
        for i in 1..=3 {
            clock.set_millis(config.epoch_beginning_ms + i * SPACING * 1000);
            source
                .generate_block(&keys, source.timekeeper().epoch_time())
                .unwrap();
        }

        let peer = Arc::new(LockWatchingPeer {
            inner: LocalPeer::new("source", &source),
            downloading: target.clone(),
            lock_free: Mutex::new(Vec::new()),
        });
        target.set_network(Arc::new(SinglePeerNetwork(peer.clone())));

        let downloader = Downloader::new(target.clone());
        downloader.download_from_peer().unwrap();

        assert_eq!(target.height(), 3);
        assert_eq!(target.last_block().id(), source.last_block().id());
        let observed = peer.lock_free.lock().clone();
        assert!(observed.len() >= 3);
        assert!(observed.iter().all(|free| *free));
    }

    #[test]
    fn test_stopped_download_applies_nothing() {
        let config = ChainConfig::devnet();
        let keys = ChainConfig::devnet_forger();
        let clock = Arc::new(ManualClock::new(config.epoch_beginning_ms));
        let source = open(clock.clone());
        let target = open(clock.clone());
        clock.set_millis(config.epoch_beginning_ms + SPACING * 1000);
        source
            .generate_block(&keys, source.timekeeper().epoch_time())
            .unwrap();

        let network = crate::network::LocalNetwork::new();
        network.add_peer("source", &source);
        target.set_network(Arc::new(network));

        let downloader = Downloader::new(target.clone());
        downloader.stop();
        assert!(matches!(
            downloader.download_from_peer(),
            Err(crate::ChainError::Node(NodeError::ShuttingDown))
        ));
        assert_eq!(target.height(), 0);
        assert_eq!(downloader.stats().blocks_downloaded, 0);
    }
}

//! In-process peers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::{MilestoneBlockIds, Network, Peer, PeerChainInfo, PeerError, PeerResult};
use crate::node::Blockchain;
use crate::types::{Block, BlockId, CodecResult, Transaction};

/// Deep copy through the byte form
fn copy_transaction(tx: &Transaction) -> CodecResult<Arc<Transaction>> {
    Transaction::parse(tx.bytes()).map(Arc::new)
}

fn copy_block(block: &Block) -> CodecResult<Block> {
    let transactions = block
        .transactions()
        .iter()
        .map(|tx| copy_transaction(tx))
        .collect::<CodecResult<Vec<_>>>()?;
    Block::parse(block.bytes(), transactions)
}

/// Another chain in the same process
pub struct LocalPeer {
    host: String,
    chain: Weak<Blockchain>,
    blacklisted: AtomicBool,
    blacklist_reason: Mutex<Option<String>>,
}

impl LocalPeer {
    pub fn new(host: impl Into<String>, chain: &Arc<Blockchain>) -> Self {
        Self {
            host: host.into(),
            chain: Arc::downgrade(chain),
            blacklisted: AtomicBool::new(false),
            blacklist_reason: Mutex::new(None),
        }
    }

    pub fn is_blacklisted(&self) -> bool {
        self.blacklisted.load(Ordering::SeqCst)
    }

    pub fn blacklist_reason(&self) -> Option<String> {
        self.blacklist_reason.lock().clone()
    }

    fn chain(&self) -> PeerResult<Arc<Blockchain>> {
        if self.is_blacklisted() {
            return Err(PeerError::NoResponse(self.host.clone()));
        }
        self.chain
            .upgrade()
            .ok_or_else(|| PeerError::NoResponse(self.host.clone()))
    }

    fn malformed(&self, reason: impl std::fmt::Display) -> PeerError {
        PeerError::Malformed {
            host: self.host.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Peer for LocalPeer {
    fn host(&self) -> &str {
        &self.host
    }

    fn is_connected(&self) -> bool {
        !self.is_blacklisted() && self.chain.strong_count() > 0
    }

    fn cumulative_difficulty(&self) -> PeerResult<PeerChainInfo> {
        let last = self.chain()?.last_block();
        Ok(PeerChainInfo {
            cumulative_difficulty: last.cumulative_difficulty(),
            height: last.height(),
        })
    }

    fn milestone_block_ids(&self, last_block_id: BlockId, last_milestone_block_id: BlockId) -> PeerResult<MilestoneBlockIds> {
        Ok(self.chain()?.milestone_block_ids(last_block_id, last_milestone_block_id))
    }

    fn next_block_ids(&self, block_id: BlockId, limit: usize) -> PeerResult<Vec<BlockId>> {
        Ok(self.chain()?.next_block_ids(block_id, limit))
    }

    fn next_blocks(&self, block_id: BlockId, ids: &[BlockId]) -> PeerResult<Vec<Block>> {
        let blocks = self.chain()?.next_blocks(block_id, ids.len(), ids);
        blocks
            .iter()
            .map(|block| copy_block(block).map_err(|e| self.malformed(e)))
            .collect()
    }

    fn blacklist(&self, reason: &str) {
        info!("Blacklisting {}: {}", self.host, reason);
        self.blacklisted.store(true, Ordering::SeqCst);
        *self.blacklist_reason.lock() = Some(reason.to_string());
    }
}

impl std::fmt::Debug for LocalPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPeer")
            .field("host", &self.host)
            .field("blacklisted", &self.is_blacklisted())
            .finish()
    }
}

/// Peers of one chain, all living in this process
#[derive(Default)]
pub struct LocalNetwork {
    peers: RwLock<Vec<Arc<LocalPeer>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, host: impl Into<String>, chain: &Arc<Blockchain>) -> Arc<LocalPeer> {
        let peer = Arc::new(LocalPeer::new(host, chain));
        self.peers.write().push(peer.clone());
        peer
    }

    pub fn peers(&self) -> Vec<Arc<LocalPeer>> {
        self.peers.read().clone()
    }

    fn live_chains(&self) -> Vec<(String, Arc<Blockchain>)> {
        self.peers
            .read()
            .iter()
            .filter_map(|peer| peer.chain().ok().map(|chain| (peer.host.clone(), chain)))
            .collect()
    }
}

impl Network for LocalNetwork {
    fn connected_peers(&self) -> Vec<Arc<dyn Peer>> {
        self.peers
            .read()
            .iter()
            .filter(|peer| peer.is_connected())
            .map(|peer| peer.clone() as Arc<dyn Peer>)
            .collect()
    }

    fn broadcast_block(&self, block: &Block) {
        for (host, chain) in self.live_chains() {
            let copy = match copy_block(block) {
                Ok(copy) => copy,
                Err(e) => {
                    debug!("Cannot copy block {}: {}", block.id(), e);
                    return;
                }
            };
            if let Err(e) = chain.process_node_block(copy) {
                debug!("{} did not accept block {}: {}", host, block.id(), e);
            }
        }
    }

    fn broadcast_transactions(&self, transactions: &[Arc<Transaction>]) {
        for (host, chain) in self.live_chains() {
            let copies = match transactions
                .iter()
                .map(|tx| copy_transaction(tx))
                .collect::<CodecResult<Vec<_>>>()
            {
                Ok(copies) => copies,
                Err(e) => {
                    debug!("Cannot copy transactions: {}", e);
                    return;
                }
            };
            if let Err(e) = chain.process_node_transactions(copies) {
                debug!("{} refused transactions: {}", host, e);
            }
        }
    }
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("peers", &self.peers.read().len())
            .finish()
    }
}

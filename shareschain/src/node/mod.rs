//! Shareschain Node Implementation
//!
//! Ties together:
//! - Chain state (block store, ledger, unconfirmed pool) behind one lock
//! - Block processing (push, pop-off, fork resolution, rescan)
//! - Local forging
//! - Blockchain download from peers
//! - Periodic workers for the mempool and forging loops

pub mod chain;
pub mod config;
pub mod download;
pub mod forging;
pub mod mempool;
pub mod processor;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::crypto::KeyPair;
use crate::ledger::MemoryLedger;
use crate::network::Network;
use crate::storage::MemoryBlockStore;
use crate::time::{SystemClock, Timekeeper};
use crate::types::{AccountId, Block, BlockId, TransactionId};
use crate::{ChainConfig, ChainResult};

pub use chain::{Blockchain, ChainState};
pub use config::NodeConfig;
pub use download::{DownloadStats, Downloader};
pub use forging::ForgerInfo;
pub use mempool::{MempoolStats, TransactionPool, UnconfirmedTransaction};

/// Forging loop period
const FORGE_PERIOD: Duration = Duration::from_millis(500);
/// Waiting transactions are retried this often
const WAITING_PERIOD: Duration = Duration::from_secs(1);
/// Expired transactions are swept this often
const EXPIRED_PERIOD: Duration = Duration::from_secs(20);
/// Own transactions are rebroadcast this often
const REBROADCAST_PERIOD: Duration = Duration::from_secs(23);
/// Blockchain download period
const DOWNLOAD_PERIOD: Duration = Duration::from_secs(5);

/// Node status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Node is starting up
    Starting,
    /// Node is downloading the chain from peers
    Syncing,
    /// Node is running its workers
    Running,
    /// Node is running with at least one local forger
    Validating,
    /// Node is shutting down
    Stopping,
    /// Node has stopped
    Stopped,
}

/// Node events broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Block appended to the chain
    BlockPushed { id: BlockId, height: i32 },
    /// Block removed from the tip
    BlockPopped { id: BlockId, height: i32 },
    /// Block forged by a local account
    BlockGenerated {
        id: BlockId,
        height: i32,
        generator: AccountId,
    },
    /// Rescan started at this height
    RescanBegin(i32),
    /// Rescan finished at this height
    RescanEnd(i32),
    /// Transactions entered the unconfirmed pool
    TransactionsAdded(Vec<TransactionId>),
    /// Transactions left the unconfirmed pool
    TransactionsRemoved(Vec<TransactionId>),
    /// Transactions included in a pushed block
    TransactionsConfirmed(Vec<TransactionId>),
    ForgingStarted(AccountId),
    ForgingStopped(AccountId),
    /// A local forger's deadline on top of the current tip
    GenerationDeadline { account_id: AccountId, deadline: i64 },
    /// Node status changed
    StatusChanged(NodeStatus),
}

/// Node statistics
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    /// Current chain height
    pub height: i32,
    /// Blocks forged by this node since start
    pub blocks_generated: u64,
    /// Blocks downloaded from peers since start
    pub blocks_downloaded: u64,
    /// Transactions in the unconfirmed pool
    pub unconfirmed_transactions: usize,
    /// Transactions waiting to become valid
    pub waiting_transactions: usize,
    /// Local forgers
    pub forgers: usize,
    /// Peers connected
    pub peers_connected: usize,
    /// Uptime in seconds
    pub uptime_secs: u64,
}

/// Shareschain node
pub struct Node {
    /// Node configuration
    config: NodeConfig,
    /// Current status
    status: Arc<RwLock<NodeStatus>>,
    /// Chain engine shared with the workers
    chain: Arc<Blockchain>,
    /// Blockchain download
    downloader: Arc<Downloader>,
    /// Shutdown signal for the workers
    shutdown_tx: Option<watch::Sender<bool>>,
    workers: Vec<JoinHandle<()>>,
    /// Node statistics
    stats: Arc<RwLock<NodeStats>>,
    /// Start time
    start_time: std::time::Instant,
}

impl Node {
    /// Create a node with an in-memory chain
    pub fn new(config: NodeConfig) -> ChainResult<Self> {
        config.validate()?;
        let chain_config = config.chain_config()?;

        info!("Initializing Shareschain node...");
        info!("  Network: {}", config.network);
        info!("  Data dir: {}", config.data_dir.display());

        let timekeeper = Timekeeper::new(Arc::new(SystemClock), chain_config.epoch_beginning_ms);
        let ledger = MemoryLedger::new(chain_config.guaranteed_balance_confirmations);
        let chain = Blockchain::new(
            chain_config,
            timekeeper,
            Box::new(MemoryBlockStore::new()),
            Box::new(ledger),
        )?;
        Ok(Self::with_chain(config, Arc::new(chain)))
    }

    /// Create a node around an existing chain
    pub fn with_chain(config: NodeConfig, chain: Arc<Blockchain>) -> Self {
        info!("Node initialized at height {}", chain.height());
        Self {
            config,
            status: Arc::new(RwLock::new(NodeStatus::Starting)),
            downloader: Arc::new(Downloader::new(chain.clone())),
            chain,
            shutdown_tx: None,
            workers: Vec::new(),
            stats: Arc::new(RwLock::new(NodeStats::default())),
            start_time: std::time::Instant::now(),
        }
    }

    /// Start the workers
    pub async fn start(&mut self) -> ChainResult<()> {
        if self.shutdown_tx.is_some() {
            return Err(NodeError::AlreadyRunning.into());
        }
        info!("Starting Shareschain node...");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);
        self.downloader.resume();

        let offline = self.chain.config().offline;
        if !offline && !self.chain.network().connected_peers().is_empty() {
            self.set_status(NodeStatus::Syncing);
            let downloader = self.downloader.clone();
            let chain = self.chain.clone();
            let stats = self.stats.clone();
            let synced = tokio::task::spawn_blocking(move || {
                download_pass(&downloader, &stats);
                chain.height()
            })
            .await
            .map_err(|e| NodeError::Network(e.to_string()))?;
            info!("Initial download finished at height {}", synced);
        }

        let chain = self.chain.clone();
        let stats = self.stats.clone();
        self.spawn_worker("forging", FORGE_PERIOD, shutdown_rx.clone(), move || match chain.forge_tick() {
            Ok(Some(_)) => stats.write().blocks_generated += 1,
            Ok(None) => {}
            Err(e) => debug!("Forging pass failed: {}", e),
        });

        let chain = self.chain.clone();
        self.spawn_worker("waiting transactions", WAITING_PERIOD, shutdown_rx.clone(), move || {
            if let Err(e) = chain.process_waiting_transactions() {
                warn!("Processing waiting transactions failed: {}", e);
            }
        });

        let chain = self.chain.clone();
        self.spawn_worker("expired transactions", EXPIRED_PERIOD, shutdown_rx.clone(), move || {
            match chain.remove_expired_transactions() {
                Ok(0) => {}
                Ok(removed) => debug!("Removed {} expired transactions", removed),
                Err(e) => warn!("Removing expired transactions failed: {}", e),
            }
        });

        if self.chain.config().enable_transaction_rebroadcasting {
            let chain = self.chain.clone();
            self.spawn_worker("rebroadcast", REBROADCAST_PERIOD, shutdown_rx.clone(), move || {
                let sent = chain.rebroadcast_transactions();
                if sent > 0 {
                    debug!("Rebroadcast {} transactions", sent);
                }
            });
        }

        if !offline {
            let downloader = self.downloader.clone();
            let stats = self.stats.clone();
            self.spawn_worker("download", DOWNLOAD_PERIOD, shutdown_rx, move || {
                download_pass(&downloader, &stats);
            });
        }

        if self.chain.forgers().is_empty() {
            self.set_status(NodeStatus::Running);
        } else {
            self.set_status(NodeStatus::Validating);
        }

        info!("Node started successfully");
        info!("  Chain height: {}", self.chain.height());
        info!("  Last block: {}", self.chain.last_block().id());

        Ok(())
    }

    /// Stop the workers and every local forger
    pub async fn stop(&mut self) -> ChainResult<()> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return Err(NodeError::NotRunning.into());
        };
        info!("Stopping Shareschain node...");
        self.set_status(NodeStatus::Stopping);

        self.downloader.stop();
        let _ = shutdown_tx.send(true);
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                error!("Worker did not shut down cleanly: {}", e);
            }
        }
        let stopped = self.chain.stop_all_forging();
        if stopped > 0 {
            info!("Stopped {} forgers", stopped);
        }

        self.set_status(NodeStatus::Stopped);
        info!("Node stopped");

        Ok(())
    }

    /// Run `job` on the blocking pool every `period` until shutdown
    fn spawn_worker<F>(&mut self, name: &'static str, period: Duration, mut shutdown: watch::Receiver<bool>, job: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let job = Arc::new(job);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let job = job.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || job()).await {
                            error!("{} worker failed: {}", name, e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("{} worker stopped", name);
        });
        self.workers.push(handle);
    }

    /// Start forging with the account behind `secret_phrase`
    pub fn start_forging(&self, secret_phrase: &str) -> ChainResult<AccountId> {
        let account_id = self.chain.start_forging(KeyPair::from_secret_phrase(secret_phrase))?;
        if self.status() == NodeStatus::Running {
            self.set_status(NodeStatus::Validating);
        }
        Ok(account_id)
    }

    pub fn stop_forging(&self, account_id: AccountId) -> bool {
        let stopped = self.chain.stop_forging(account_id);
        if stopped && self.status() == NodeStatus::Validating && self.chain.forgers().is_empty() {
            self.set_status(NodeStatus::Running);
        }
        stopped
    }

    /// Attach the peer network used for broadcasts and downloads
    pub fn set_network(&self, network: Arc<dyn Network>) {
        self.chain.set_network(network);
    }

    /// Set node status and broadcast event
    fn set_status(&self, new_status: NodeStatus) {
        *self.status.write() = new_status;
        self.chain.emit(NodeEvent::StatusChanged(new_status));
    }

    /// Get current node status
    pub fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    /// Get node statistics
    pub fn stats(&self) -> NodeStats {
        let mut stats = self.stats.read().clone();
        let (unconfirmed, waiting) = self.chain.read(|s| (s.pool().len(), s.pool().waiting_len()));
        stats.height = self.chain.height();
        stats.unconfirmed_transactions = unconfirmed;
        stats.waiting_transactions = waiting;
        stats.forgers = self.chain.forgers().len();
        stats.peers_connected = self.chain.network().connected_peers().len();
        stats.uptime_secs = self.start_time.elapsed().as_secs();
        stats
    }

    /// Subscribe to node events
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.chain.subscribe()
    }

    pub fn chain(&self) -> &Arc<Blockchain> {
        &self.chain
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    pub fn chain_config(&self) -> &ChainConfig {
        self.chain.config()
    }

    /// Get current chain height
    pub fn height(&self) -> i32 {
        self.chain.height()
    }

    pub fn block_at_height(&self, height: i32) -> Option<Arc<Block>> {
        self.chain.block_at_height(height)
    }

    /// Get node configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
}

/// One download run, folding the blocks gained into the node stats
fn download_pass(downloader: &Downloader, stats: &RwLock<NodeStats>) {
    let before = downloader.stats().blocks_downloaded;
    if let Err(e) = downloader.run() {
        debug!("Download pass failed: {}", e);
    }
    let gained = downloader.stats().blocks_downloaded.saturating_sub(before);
    stats.write().blocks_downloaded += gained;
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("status", &self.status())
            .field("height", &self.chain.height())
            .field("unconfirmed", &self.chain.unconfirmed_count())
            .finish()
    }
}

/// Node result type
pub type NodeResult<T> = Result<T, NodeError>;

/// Node errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Node not running")]
    NotRunning,

    #[error("Node already running")]
    AlreadyRunning,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn devnet_node() -> (tempfile::TempDir, Node) {
        let tmp = tempdir().unwrap();
        let config = NodeConfig::devnet(tmp.path().to_path_buf());
        let node = Node::new(config).unwrap();
        (tmp, node)
    }

    #[test]
    fn test_node_creation() {
        let (_tmp, node) = devnet_node();
        assert_eq!(node.status(), NodeStatus::Starting);
        assert_eq!(node.height(), 0);
        assert!(node.block_at_height(0).is_some());
    }

    #[tokio::test]
    async fn test_node_start_stop() {
        let (_tmp, mut node) = devnet_node();
        let mut events = node.subscribe();

        node.start().await.unwrap();
        assert_eq!(node.status(), NodeStatus::Running);
        assert_eq!(
            node.start().await.unwrap_err(),
            NodeError::AlreadyRunning.into()
        );

        node.stop().await.unwrap();
        assert_eq!(node.status(), NodeStatus::Stopped);
        assert_eq!(node.stop().await.unwrap_err(), NodeError::NotRunning.into());

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let NodeEvent::StatusChanged(status) = event {
                statuses.push(status);
            }
        }
        assert_eq!(
            statuses,
            vec![NodeStatus::Running, NodeStatus::Stopping, NodeStatus::Stopped]
        );
    }

    #[test]
    fn test_invalid_config_is_a_config_error() {
        let tmp = tempdir().unwrap();
        let mut config = NodeConfig::devnet(tmp.path().to_path_buf());
        config.mempool_size = 0;
        let err = Node::new(config).unwrap_err();
        assert!(matches!(err, crate::ChainError::Config(_)));
    }

    #[test]
    fn test_node_stats() {
        let (_tmp, node) = devnet_node();
        let stats = node.stats();
        assert_eq!(stats.height, 0);
        assert_eq!(stats.blocks_generated, 0);
        assert_eq!(stats.unconfirmed_transactions, 0);
        assert_eq!(stats.peers_connected, 0);
    }

    #[test]
    fn test_forging_changes_status() {
        let (_tmp, node) = devnet_node();
        *node.status.write() = NodeStatus::Running;

        let account_id = node.start_forging("shareschain devnet forger").unwrap();
        assert_eq!(node.status(), NodeStatus::Validating);
        assert_eq!(node.chain().forgers().len(), 1);

        assert!(node.stop_forging(account_id));
        assert_eq!(node.status(), NodeStatus::Running);
        assert!(!node.stop_forging(account_id));
    }
}

//! Protocol constants
//!
//! Amounts are expressed in KER, the smallest unit of SCTK
//! (1 SCTK = 10^8 KER). Timestamps are seconds since the chain epoch.

/// Chain name
pub const CHAIN_NAME: &str = "SCTK";
/// Chain id written into every transaction
pub const CHAIN_ID: i32 = 1;

/// KER per SCTK
pub const KER_PER_SCTK: i64 = 100_000_000;
/// Total supply in SCTK
pub const MAX_BALANCE_SCTK: i64 = 2_000_000_000;
/// Total supply in KER
pub const MAX_BALANCE_KER: i64 = MAX_BALANCE_SCTK * KER_PER_SCTK;

/// Target block interval in seconds
pub const BLOCK_TIME: i64 = 60;
/// Base target of the genesis block on mainnet
pub const INITIAL_BASE_TARGET: i64 = 153_722_867;
/// Upper clamp for the base target on mainnet
pub const MAX_BASE_TARGET: i64 = INITIAL_BASE_TARGET * 50;
/// Upper clamp for the base target on testnet
pub const TESTNET_MAX_BASE_TARGET: i64 = INITIAL_BASE_TARGET * MAX_BALANCE_SCTK;
/// Lower clamp for the base target
pub const MIN_BASE_TARGET: i64 = INITIAL_BASE_TARGET * 9 / 10;
/// Average block time below which the base target stops shrinking
pub const MIN_BLOCKTIME_LIMIT: i64 = BLOCK_TIME - 7;
/// Average block time above which the base target stops growing
pub const MAX_BLOCKTIME_LIMIT: i64 = BLOCK_TIME + 7;
/// Percentage applied when lowering the base target
pub const BASE_TARGET_GAMMA: i64 = 64;

/// Smallest rollback window any node may use
pub const MIN_MAX_ROLLBACK: i32 = 720;
/// Allowed clock drift for incoming blocks and transactions, in seconds
pub const MAX_TIMEDRIFT: i32 = 15;
/// Upper bound on the configurable forging delay, in seconds
pub const MAX_FORGING_DELAY: i32 = 14;
/// Seconds after which a stalled chain accepts any hit
pub const IDLE_FORGING_LIMIT: i32 = 3600;
/// Idle limit on testnet
pub const TESTNET_IDLE_FORGING_LIMIT: i32 = 300;
/// Minimum effective balance for forging, in SCTK
pub const MIN_FORGING_BALANCE_SCTK: i64 = 1000;
/// Minimum effective balance for forging, in KER
pub const MIN_FORGING_BALANCE_KER: i64 = MIN_FORGING_BALANCE_SCTK * KER_PER_SCTK;
/// Confirmations before a balance counts toward forging on mainnet
pub const GUARANTEED_BALANCE_CONFIRMATIONS: i32 = 987_654_321;
/// Default confirmations on testnet
pub const TESTNET_GUARANTEED_BALANCE_CONFIRMATIONS: i32 = 1440;
/// Blocks between a lease transaction and the lease taking effect
pub const LEASING_DELAY: i32 = 0;

/// Maximum transactions per block
pub const MAX_NUMBER_OF_TRANSACTIONS: usize = 10;
/// Maximum serialized size of a single transaction
pub const MAX_PAYLOAD_LENGTH: usize = 128 * 1024;
/// Distance of the economic-clustering block below the tip
pub const EC_BLOCK_DISTANCE: i32 = 720;

/// Block version produced and accepted
pub const BLOCK_VERSION: i32 = 3;
/// Transaction version produced and accepted
pub const TRANSACTION_VERSION: u8 = 1;

/// Default fee for an ordinary payment
pub const DEFAULT_FEE_KER: i64 = KER_PER_SCTK;
/// Extra fee for sending to an account that does not exist yet
pub const NEW_ACCOUNT_FEE_KER: i64 = KER_PER_SCTK;
/// Fee for effective balance leasing
pub const LEASING_FEE_KER: i64 = KER_PER_SCTK / 10;

/// Mainnet epoch, 2018-01-01T00:00:00Z, in milliseconds
pub const EPOCH_BEGINNING_MS: i64 = 1_514_764_800_000;
/// Testnet epoch, 2017-12-26T14:00:00Z, in milliseconds
pub const TESTNET_EPOCH_BEGINNING_MS: i64 = 1_514_296_800_000;

/// Blocks per downloaded segment
pub const DOWNLOAD_SEGMENT_SIZE: usize = 36;
/// Maximum milestone ids accepted from a peer in one response
pub const MAX_MILESTONE_IDS: usize = 20;
/// Maximum block ids requested from a peer after the common milestone
pub const MAX_NEXT_BLOCK_IDS: usize = 1440;
/// Blocks newer than this many seconds are rebroadcast after being pushed
pub const BLOCK_BROADCAST_WINDOW: i32 = 600;
/// Seconds a non-currently-valid transaction may wait before being dropped
pub const MAX_WAITING_SECONDS: i32 = 3600;
/// Seconds the forger keeps retrying after a rejected transaction
pub const FORGING_RETRY_SECONDS: i32 = 10;
/// Own transactions younger than this many seconds are not rebroadcast
pub const REBROADCAST_MIN_AGE: i32 = 30;
/// Transactions per rebroadcast message
pub const REBROADCAST_BATCH_SIZE: usize = 10;
/// Blocks between rescan progress messages
pub const RESCAN_LOG_INTERVAL: i32 = 5000;
/// Forged blocks whose predecessor is older than this many seconds are never replaced
pub const FORK_REPLACEMENT_WINDOW: i32 = 600;
/// Blocks downloaded above which a fork needs confirmations from other peers
pub const FORK_CONFIRMATION_THRESHOLD: usize = 10;

/// Genesis generation signature seed used when there are no allocations
pub const GENESIS_GENERATION_SEED: &[u8] = b"shareschain genesis";

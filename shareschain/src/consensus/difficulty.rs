//! Base target retargeting and cumulative difficulty

use crate::constants::{
    BASE_TARGET_GAMMA, BLOCK_TIME, MAX_BLOCKTIME_LIMIT, MIN_BASE_TARGET, MIN_BLOCKTIME_LIMIT,
};
use crate::types::Block;
use crate::ChainConfig;

/// 2^64 * BLOCK_TIME
const CUMULATIVE_DIFFICULTY_MULTIPLIER: u128 = (1u128 << 64) * BLOCK_TIME as u128;

/// Base target of the block following `previous` at `timestamp`.
///
/// Retargets every second block above height 2, averaging the last three
/// block times; `two_back_timestamp` is the timestamp of the block at
/// `previous.height() - 2`. Without it the previous target is kept.
pub fn next_base_target(
    previous: &Block,
    timestamp: i32,
    two_back_timestamp: Option<i32>,
    config: &ChainConfig,
) -> i64 {
    let previous_target = previous.base_target();
    let height = previous.height();
    if height <= 2 || height % 2 != 0 {
        return previous_target;
    }
    let Some(two_back) = two_back_timestamp else {
        return previous_target;
    };

    let average = i64::from(timestamp - two_back) / 3;
    let prev = i128::from(previous_target);
    let target = if average > BLOCK_TIME {
        prev * i128::from(average.min(MAX_BLOCKTIME_LIMIT)) / i128::from(BLOCK_TIME)
    } else {
        prev - prev
            * i128::from(BASE_TARGET_GAMMA)
            * i128::from(BLOCK_TIME - average.max(MIN_BLOCKTIME_LIMIT))
            / i128::from(100 * BLOCK_TIME)
    };

    let max = config.max_base_target();
    let target = if target < 0 || target > i128::from(max) {
        max
    } else {
        target as i64
    };
    target.max(MIN_BASE_TARGET)
}

/// Cumulative difficulty of the block following `previous` at `timestamp`
pub fn next_cumulative_difficulty(previous: &Block, timestamp: i32) -> u128 {
    let elapsed = (i64::from(timestamp) - i64::from(previous.timestamp())).max(1) as u128;
    let base_target = previous.base_target().max(1) as u128;
    previous
        .cumulative_difficulty()
        .saturating_add(CUMULATIVE_DIFFICULTY_MULTIPLIER / (base_target * elapsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::INITIAL_BASE_TARGET;
    use crate::crypto::KeyPair;
    use crate::types::block::BlockTemplate;

    fn config() -> ChainConfig {
        ChainConfig::mainnet()
    }

    /// Chain of empty blocks spaced `spacing` seconds apart
    fn chain(spacing: &[i32]) -> Vec<Block> {
        let config = config();
        let keys = KeyPair::from_secret_phrase("difficulty");
        let mut blocks = vec![config.genesis().block()];
        for gap in spacing {
            let prev = blocks.last().unwrap();
            let timestamp = prev.timestamp() + gap;
            let two_back = prev
                .height()
                .checked_sub(2)
                .and_then(|h| blocks.get(h as usize))
                .map(|b| b.timestamp());
            let mut block = Block::forge(
                BlockTemplate {
                    version: crate::constants::BLOCK_VERSION,
                    timestamp,
                    previous_block_id: prev.id(),
                    previous_block_hash: prev.hash(),
                    generation_signature: [0u8; 32],
                    transactions: Vec::new(),
                },
                &keys,
            );
            block.set_previous(prev, two_back, &config);
            blocks.push(block);
        }
        blocks
    }

    #[test]
    fn test_no_retarget_on_odd_heights() {
        let blocks = chain(&[60, 60, 60, 60]);
        assert_eq!(blocks[1].base_target(), INITIAL_BASE_TARGET);
        assert_eq!(blocks[2].base_target(), INITIAL_BASE_TARGET);
        assert_eq!(blocks[3].base_target(), INITIAL_BASE_TARGET);
        assert_eq!(blocks[4].base_target(), INITIAL_BASE_TARGET);
    }

    #[test]
    fn test_slow_blocks_raise_target() {
        let blocks = chain(&[120, 120, 120, 120, 120]);
        // height 5 retargets from height 4 with the average capped at 67
        let expected = (i128::from(INITIAL_BASE_TARGET) * 67 / 60) as i64;
        assert_eq!(blocks[5].base_target(), expected);
    }

    #[test]
    fn test_fast_blocks_lower_target_to_floor() {
        let blocks = chain(&[1, 1, 1, 1, 1]);
        let prev = i128::from(INITIAL_BASE_TARGET);
        let expected = (prev - prev * 64 * (60 - 53) / 6000) as i64;
        assert_eq!(blocks[5].base_target(), expected.max(MIN_BASE_TARGET));
    }

    #[test]
    fn test_cumulative_difficulty_increases() {
        let blocks = chain(&[60, 30, 90]);
        for pair in blocks.windows(2) {
            assert!(pair[1].cumulative_difficulty() > pair[0].cumulative_difficulty());
        }
        let expected = CUMULATIVE_DIFFICULTY_MULTIPLIER / (INITIAL_BASE_TARGET as u128 * 60);
        assert_eq!(blocks[1].cumulative_difficulty(), expected);
    }

    #[test]
    fn test_faster_block_has_more_difficulty() {
        let fast = chain(&[30]);
        let slow = chain(&[90]);
        assert!(fast[1].cumulative_difficulty() > slow[1].cumulative_difficulty());
    }
}

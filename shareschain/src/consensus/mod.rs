//! Proof-of-Stake Consensus Rules
//!
//! The rules every node applies identically:
//!
//! ## Key Features
//! - Hit-based forging weighted by effective balance
//! - Base target retargeting every two blocks
//! - Fork choice by cumulative difficulty
//!
//! ## Modules
//! - `difficulty` - Base target and cumulative difficulty
//! - `forger` - Hits, hit times and local forgers
//! - `validator` - Block and transaction validation

pub mod difficulty;
pub mod forger;
pub mod validator;

pub use difficulty::{next_base_target, next_cumulative_difficulty};
pub use forger::{Forger, ForgerSet};
pub use validator::ValidationContext;

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Consensus errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    #[error("Cannot forge with more than {0} accounts on the same node")]
    TooManyForgers(usize),

    #[error("Account {0} is not forging")]
    NotForging(u64),
}

//! Error types for block and transaction acceptance
//!
//! Rule violations are split in two families. `ValidationError` describes
//! why a single transaction is refused and whether it might become valid
//! later. `BlockNotAccepted` describes why a block was refused and drives
//! how the caller reacts (retry, blacklist the peer, purge a transaction).

use thiserror::Error;

use crate::types::TransactionId;

/// Result type for transaction validation
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Transaction validation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    // ========== Permanent ==========

    /// The transaction can never become valid
    #[error("Not valid: {0}")]
    NotValid(String),

    // ========== Transient ==========

    /// Valid in principle, but not against the current chain state
    #[error("Not currently valid: {0}")]
    NotCurrentlyValid(String),

    /// Already pending or already confirmed
    #[error("Existing transaction: {0}")]
    ExistingTransaction(String),

    /// Feature not active at this height
    #[error("Not yet enabled: {0}")]
    NotYetEnabled(String),

    /// Unconfirmed balance cannot cover amount plus fee
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),
}

impl ValidationError {
    pub fn not_valid(reason: impl Into<String>) -> Self {
        Self::NotValid(reason.into())
    }

    pub fn not_currently_valid(reason: impl Into<String>) -> Self {
        Self::NotCurrentlyValid(reason.into())
    }

    /// True for every kind except `NotValid`
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::NotValid(_))
    }
}

/// Block acceptance failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockNotAccepted {
    /// Does not link to the current tip or is from the future
    #[error("Block out of order: {0}")]
    OutOfOrder(String),

    /// A competing fork did not beat the local cumulative difficulty
    #[error("Block of lower difficulty: {0}")]
    LowerDifficulty(String),

    /// Violates a block-level rule
    #[error("Block not accepted: {0}")]
    Rejected(String),

    /// One of the contained transactions is invalid
    #[error("Transaction {transaction_id} not accepted: {reason}")]
    TransactionRejected {
        transaction_id: TransactionId,
        reason: String,
    },
}

impl BlockNotAccepted {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    pub fn out_of_order(reason: impl Into<String>) -> Self {
        Self::OutOfOrder(reason.into())
    }

    pub fn transaction(transaction_id: TransactionId, reason: impl std::fmt::Display) -> Self {
        Self::TransactionRejected {
            transaction_id,
            reason: reason.to_string(),
        }
    }

    /// Protocol violations that justify blacklisting the sending peer
    pub fn is_peer_fault(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::TransactionRejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(!ValidationError::not_valid("bad").is_transient());
        assert!(ValidationError::not_currently_valid("later").is_transient());
        assert!(ValidationError::ExistingTransaction("dup".into()).is_transient());
        assert!(ValidationError::InsufficientBalance("poor".into()).is_transient());
    }

    #[test]
    fn test_peer_fault() {
        assert!(BlockNotAccepted::rejected("bad signature").is_peer_fault());
        assert!(BlockNotAccepted::transaction(7, "double spend").is_peer_fault());
        assert!(!BlockNotAccepted::out_of_order("gap").is_peer_fault());
        assert!(!BlockNotAccepted::LowerDifficulty("lost".into()).is_peer_fault());
    }

    #[test]
    fn test_display() {
        let err = BlockNotAccepted::transaction(42, ValidationError::not_valid("fee"));
        assert_eq!(err.to_string(), "Transaction 42 not accepted: Not valid: fee");
    }
}

//! Core chain data structures
//!
//! - `codec` - little-endian byte layout shared by blocks and transactions
//! - `appendix` - transaction types, attachments and optional appendages
//! - `transaction` - signed transactions and their identity
//! - `block` - blocks, linkage and identity
//! - `genesis` - the fixed first block and its allocations

pub mod appendix;
pub mod block;
pub mod codec;
pub mod genesis;
pub mod transaction;

/// Account identifier, the first eight bytes of SHA-256(public key)
pub type AccountId = u64;
/// Block identifier
pub type BlockId = u64;
/// Transaction identifier
pub type TransactionId = u64;
/// Ed25519 public key
pub type PublicKey = [u8; 32];
/// Ed25519 signature
pub type SignatureBytes = [u8; 64];
/// SHA-256 digest
pub type Hash = [u8; 32];

pub use appendix::{
    Appendix, Attachment, DuplicateRegistry, FeeSchedule, PublicKeyAnnouncement, TransactionType,
};
pub use block::{payload_hash, Block, BlockTemplate};
pub use codec::{ByteReader, ByteWriter, CodecError, CodecResult};
pub use genesis::{Genesis, GenesisAllocation};
pub use transaction::{Transaction, TransactionBuilder};

//! Blocks
//!
//! Byte layout (little-endian):
//!
//! ```text
//! version               i32
//! timestamp             i32
//! previous block id     i64
//! transaction count     i32
//! total fee             i64
//! payload hash          [32]
//! generator public key  [32]
//! generation signature  [32]
//! previous block hash   [32]
//! block signature       [64]  absent while unsigned
//! ```
//!
//! The block signature covers every byte before it. The id is the first
//! eight bytes of SHA-256 over the signed bytes, read little-endian.

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DisplayFromStr, PickFirst};

use super::codec::{hex_array, ByteReader, ByteWriter, CodecError, CodecResult};
use super::transaction::Transaction;
use super::{AccountId, BlockId, Hash, PublicKey, SignatureBytes};
use crate::consensus::difficulty;
use crate::crypto::{self, KeyPair};
use crate::ledger::{Ledger, LedgerEvent, LedgerResult};
use crate::ChainConfig;

const HEADER_LEN: usize = 4 + 4 + 8 + 4 + 8 + 32 + 32 + 32 + 32;
const SIGNATURE_LEN: usize = 64;

/// Fields chosen by a forger before the block is signed
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub version: i32,
    pub timestamp: i32,
    pub previous_block_id: BlockId,
    pub previous_block_hash: Hash,
    pub generation_signature: Hash,
    pub transactions: Vec<Arc<Transaction>>,
}

#[derive(Clone)]
pub struct Block {
    version: i32,
    timestamp: i32,
    previous_block_id: BlockId,
    total_fee_ker: i64,
    payload_hash: Hash,
    generator_public_key: PublicKey,
    generation_signature: Hash,
    previous_block_hash: Hash,
    block_signature: Option<SignatureBytes>,
    transactions: Vec<Arc<Transaction>>,

    /// -1 until linked to a predecessor
    height: i32,
    base_target: i64,
    cumulative_difficulty: u128,

    id: OnceLock<BlockId>,
    bytes: OnceLock<Vec<u8>>,
    generator_id: OnceLock<AccountId>,
}

impl Block {
    #[allow(clippy::too_many_arguments)]
    fn unlinked(
        version: i32,
        timestamp: i32,
        previous_block_id: BlockId,
        total_fee_ker: i64,
        payload_hash: Hash,
        generator_public_key: PublicKey,
        generation_signature: Hash,
        previous_block_hash: Hash,
        block_signature: Option<SignatureBytes>,
        transactions: Vec<Arc<Transaction>>,
    ) -> Self {
        Self {
            version,
            timestamp,
            previous_block_id,
            total_fee_ker,
            payload_hash,
            generator_public_key,
            generation_signature,
            previous_block_hash,
            block_signature,
            transactions,
            height: -1,
            base_target: 0,
            cumulative_difficulty: 0,
            id: OnceLock::new(),
            bytes: OnceLock::new(),
            generator_id: OnceLock::new(),
        }
    }

    /// Assemble and sign a new block
    pub fn forge(template: BlockTemplate, keys: &KeyPair) -> Self {
        let payload_hash = payload_hash(&template.transactions);
        let total_fee_ker = template.transactions.iter().map(|tx| tx.fee_ker()).sum();
        let mut block = Self::unlinked(
            template.version,
            template.timestamp,
            template.previous_block_id,
            total_fee_ker,
            payload_hash,
            keys.public_key(),
            template.generation_signature,
            template.previous_block_hash,
            None,
            template.transactions,
        );
        let signature = keys.sign(&block.unsigned_bytes());
        block.block_signature = Some(signature);
        block
    }

    /// The genesis block, already linked at height 0
    pub(crate) fn genesis(
        timestamp: i32,
        generation_signature: Hash,
        base_target: i64,
    ) -> Self {
        let mut block = Self::unlinked(
            -1,
            timestamp,
            0,
            0,
            [0u8; 32],
            [0u8; 32],
            generation_signature,
            [0u8; 32],
            Some([0u8; SIGNATURE_LEN]),
            Vec::new(),
        );
        block.height = 0;
        block.base_target = base_target;
        block.cumulative_difficulty = 0;
        block
    }

    // ========== Fields ==========

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn timestamp(&self) -> i32 {
        self.timestamp
    }

    pub fn previous_block_id(&self) -> BlockId {
        self.previous_block_id
    }

    pub fn previous_block_hash(&self) -> &Hash {
        &self.previous_block_hash
    }

    pub fn total_fee_ker(&self) -> i64 {
        self.total_fee_ker
    }

    pub fn payload_hash(&self) -> &Hash {
        &self.payload_hash
    }

    pub fn generator_public_key(&self) -> &PublicKey {
        &self.generator_public_key
    }

    pub fn generator_id(&self) -> AccountId {
        *self
            .generator_id
            .get_or_init(|| crypto::account_id(&self.generator_public_key))
    }

    pub fn generation_signature(&self) -> &Hash {
        &self.generation_signature
    }

    pub fn block_signature(&self) -> Option<&SignatureBytes> {
        self.block_signature.as_ref()
    }

    pub fn transactions(&self) -> &[Arc<Transaction>] {
        &self.transactions
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn base_target(&self) -> i64 {
        self.base_target
    }

    pub fn cumulative_difficulty(&self) -> u128 {
        self.cumulative_difficulty
    }

    // ========== Identity ==========

    pub fn id(&self) -> BlockId {
        *self
            .id
            .get_or_init(|| crypto::full_hash_to_id(&crypto::sha256(self.bytes())))
    }

    /// SHA-256 of the signed bytes, referenced by the next block
    pub fn hash(&self) -> Hash {
        crypto::sha256(self.bytes())
    }

    fn write_header(&self, w: &mut ByteWriter) {
        w.put_i32(self.version);
        w.put_i32(self.timestamp);
        w.put_u64(self.previous_block_id);
        w.put_i32(self.transactions.len() as i32);
        w.put_i64(self.total_fee_ker);
        w.put_bytes(&self.payload_hash);
        w.put_bytes(&self.generator_public_key);
        w.put_bytes(&self.generation_signature);
        w.put_bytes(&self.previous_block_hash);
    }

    /// Canonical bytes, including the signature when present
    pub fn bytes(&self) -> &[u8] {
        self.bytes.get_or_init(|| {
            let mut w = ByteWriter::with_capacity(HEADER_LEN + SIGNATURE_LEN);
            self.write_header(&mut w);
            if let Some(sig) = &self.block_signature {
                w.put_bytes(sig);
            }
            w.into_bytes()
        })
    }

    fn unsigned_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(HEADER_LEN);
        self.write_header(&mut w);
        w.into_bytes()
    }

    /// Parse signed header bytes and attach the block's transactions
    pub fn parse(bytes: &[u8], transactions: Vec<Arc<Transaction>>) -> CodecResult<Self> {
        let mut r = ByteReader::new(bytes);
        let version = r.get_i32()?;
        let timestamp = r.get_i32()?;
        let previous_block_id = r.get_u64()?;
        let count = r.get_i32()?;
        let total_fee_ker = r.get_i64()?;
        let payload_hash = r.get_array::<32>()?;
        let generator_public_key = r.get_array::<32>()?;
        let generation_signature = r.get_array::<32>()?;
        let previous_block_hash = r.get_array::<32>()?;
        let block_signature = r.get_array::<SIGNATURE_LEN>()?;
        r.finish()?;
        if count < 0 || count as usize != transactions.len() {
            return Err(CodecError::InvalidField {
                field: "transactionCount",
                reason: format!("header says {}, got {}", count, transactions.len()),
            });
        }
        Ok(Self::unlinked(
            version,
            timestamp,
            previous_block_id,
            total_fee_ker,
            payload_hash,
            generator_public_key,
            generation_signature,
            previous_block_hash,
            Some(block_signature),
            transactions,
        ))
    }

    /// Check the block signature against the generator key
    pub fn verify_block_signature(&self) -> bool {
        match &self.block_signature {
            Some(sig) => crypto::verify(sig, &self.unsigned_bytes(), &self.generator_public_key),
            None => false,
        }
    }

    // ========== Linkage ==========

    /// Link to `previous`, deriving height, base target and cumulative
    /// difficulty. `two_back_timestamp` is the timestamp of the block two
    /// below `previous`, needed on retarget heights.
    pub fn set_previous(&mut self, previous: &Block, two_back_timestamp: Option<i32>, config: &ChainConfig) {
        self.height = previous.height + 1;
        self.base_target =
            difficulty::next_base_target(previous, self.timestamp, two_back_timestamp, config);
        self.cumulative_difficulty = difficulty::next_cumulative_difficulty(previous, self.timestamp);
        let id = self.id();
        for (index, tx) in self.transactions.iter().enumerate() {
            tx.set_block(id, self.height, self.timestamp, index as i16);
        }
    }

    /// Credit fees to the generator
    pub fn apply(&self, ledger: &mut dyn Ledger) -> LedgerResult<()> {
        let generator = self.generator_id();
        ledger.apply_public_key(generator, &self.generator_public_key, self.height)?;
        ledger.add_to_balance_and_unconfirmed_balance(
            generator,
            LedgerEvent::BlockGenerated,
            self.id(),
            self.total_fee_ker,
            self.height,
        )?;
        ledger.add_to_forged_balance(generator, self.total_fee_ker, self.height)
    }

    // ========== JSON ==========

    pub fn to_json(&self) -> Value {
        let json = BlockJson {
            version: self.version,
            timestamp: self.timestamp,
            previous_block: self.previous_block_id,
            total_fee_ker: self.total_fee_ker,
            payload_hash: hex::encode(self.payload_hash),
            generator_public_key: hex::encode(self.generator_public_key),
            generation_signature: hex::encode(self.generation_signature),
            previous_block_hash: hex::encode(self.previous_block_hash),
            block_signature: self.block_signature.map(hex::encode),
            transactions: self.transactions.iter().map(|tx| tx.to_json()).collect(),
        };
        serde_json::to_value(json).unwrap_or(Value::Null)
    }

    pub fn from_json(value: &Value) -> CodecResult<Self> {
        let json: BlockJson = serde_json::from_value(value.clone())?;
        let transactions = json
            .transactions
            .iter()
            .map(|tx| Transaction::from_json(tx).map(Arc::new))
            .collect::<CodecResult<Vec<_>>>()?;
        let block_signature = match &json.block_signature {
            Some(s) => Some(hex_array::<SIGNATURE_LEN>("blockSignature", s)?),
            None => None,
        };
        Ok(Self::unlinked(
            json.version,
            json.timestamp,
            json.previous_block,
            json.total_fee_ker,
            hex_array("payloadHash", &json.payload_hash)?,
            hex_array("generatorPublicKey", &json.generator_public_key)?,
            hex_array("generationSignature", &json.generation_signature)?,
            hex_array("previousBlockHash", &json.previous_block_hash)?,
            block_signature,
            transactions,
        ))
    }
}

/// SHA-256 over the concatenated bytes of `transactions`
pub fn payload_hash(transactions: &[Arc<Transaction>]) -> Hash {
    let parts: Vec<&[u8]> = transactions.iter().map(|tx| tx.bytes()).collect();
    crypto::sha256_concat(&parts)
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.bytes() == other.bytes()
    }
}

impl Eq for Block {}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id())
            .field("height", &self.height)
            .field("timestamp", &self.timestamp)
            .field("previous", &self.previous_block_id)
            .field("generator", &self.generator_id())
            .field("transactions", &self.transactions.len())
            .finish()
    }
}

#[serde_as]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockJson {
    version: i32,
    timestamp: i32,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    previous_block: u64,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    #[serde(rename = "totalFeeKER")]
    total_fee_ker: i64,
    payload_hash: String,
    generator_public_key: String,
    generation_signature: String,
    previous_block_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    block_signature: Option<String>,
    #[serde(default)]
    transactions: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{BLOCK_VERSION, KER_PER_SCTK};
    use crate::types::appendix::Attachment;
    use crate::types::transaction::TransactionBuilder;

    fn sample_block(keys: &KeyPair, transactions: Vec<Arc<Transaction>>) -> Block {
        Block::forge(
            BlockTemplate {
                version: BLOCK_VERSION,
                timestamp: 120,
                previous_block_id: 55,
                previous_block_hash: [3u8; 32],
                generation_signature: [4u8; 32],
                transactions,
            },
            keys,
        )
    }

    fn payment(keys: &KeyPair, fee: i64) -> Arc<Transaction> {
        Arc::new(
            TransactionBuilder::new(keys.public_key(), KER_PER_SCTK, fee, 60, Attachment::Payment, 100)
                .recipient(1)
                .sign(keys)
                .unwrap(),
        )
    }

    #[test]
    fn test_forge_sets_fee_and_payload() {
        let keys = KeyPair::from_secret_phrase("forger");
        let txs = vec![payment(&keys, 3), payment(&keys, 4)];
        let block = sample_block(&keys, txs.clone());
        assert_eq!(block.total_fee_ker(), 7);
        let mut concatenated = Vec::new();
        for tx in &txs {
            concatenated.extend_from_slice(tx.bytes());
        }
        assert_eq!(block.payload_hash(), &crypto::sha256(&concatenated));
        assert!(block.verify_block_signature());
        assert_eq!(block.height(), -1);
    }

    #[test]
    fn test_layout_and_id() {
        let keys = KeyPair::from_secret_phrase("forger");
        let block = sample_block(&keys, Vec::new());
        let bytes = block.bytes();
        assert_eq!(bytes.len(), HEADER_LEN + SIGNATURE_LEN);
        assert_eq!(&bytes[0..4], &BLOCK_VERSION.to_le_bytes());
        assert_eq!(&bytes[8..16], &55u64.to_le_bytes());
        assert_eq!(block.id(), crypto::full_hash_to_id(&crypto::sha256(bytes)));
    }

    #[test]
    fn test_parse_round_trip() {
        let keys = KeyPair::from_secret_phrase("forger");
        let txs = vec![payment(&keys, 3)];
        let block = sample_block(&keys, txs.clone());
        let parsed = Block::parse(block.bytes(), txs).unwrap();
        assert_eq!(parsed.id(), block.id());
        assert!(parsed.verify_block_signature());
        assert!(Block::parse(block.bytes(), Vec::new()).is_err());
    }

    #[test]
    fn test_tampered_block_fails_signature() {
        let keys = KeyPair::from_secret_phrase("forger");
        let block = sample_block(&keys, Vec::new());
        let mut bytes = block.bytes().to_vec();
        bytes[5] ^= 0x10;
        let parsed = Block::parse(&bytes, Vec::new()).unwrap();
        assert!(!parsed.verify_block_signature());
    }

    #[test]
    fn test_json_round_trip() {
        let keys = KeyPair::from_secret_phrase("forger");
        let block = sample_block(&keys, vec![payment(&keys, 9)]);
        let json = block.to_json();
        assert_eq!(json["previousBlock"], Value::from("55"));
        let parsed = Block::from_json(&json).unwrap();
        assert_eq!(parsed, block);
        assert_eq!(parsed.transactions().len(), 1);
        assert_eq!(parsed.transactions()[0].id(), block.transactions()[0].id());
    }

    #[test]
    fn test_set_previous_links_transactions() {
        let keys = KeyPair::from_secret_phrase("forger");
        let config = ChainConfig::devnet();
        let genesis = config.genesis().block();
        let tx = payment(&keys, 3);
        let mut block = Block::forge(
            BlockTemplate {
                version: BLOCK_VERSION,
                timestamp: 60,
                previous_block_id: genesis.id(),
                previous_block_hash: genesis.hash(),
                generation_signature: [0u8; 32],
                transactions: vec![tx.clone()],
            },
            &keys,
        );
        block.set_previous(&genesis, None, &config);
        assert_eq!(block.height(), 1);
        assert!(block.cumulative_difficulty() > 0);
        assert_eq!(block.base_target(), genesis.base_target());
        assert_eq!(tx.block_id(), block.id());
        assert_eq!(tx.height(), 1);
        assert_eq!(tx.index(), 0);
    }
}

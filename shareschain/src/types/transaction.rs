//! Signed transactions
//!
//! Byte layout (little-endian):
//!
//! ```text
//! chain id        i32
//! type, subtype   i8, i8
//! version         i8
//! timestamp       i32
//! deadline        i16   minutes
//! sender key      [32]
//! recipient       i64
//! amount, fee     i64, i64
//! signature       [64]  zero while unsigned
//! ec height, id   i32, i64
//! flags           i32   OR of appendage flags
//! attachment      version byte (if > 0) + body
//! appendages      version byte (if > 0) + body, ascending flag order
//! ```
//!
//! The full hash is `SHA-256(bytes with zeroed signature ++ SHA-256(signature))`
//! and the id is its first eight bytes read little-endian.

use std::sync::OnceLock;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{serde_as, DisplayFromStr, PickFirst};

use super::appendix::{Appendix, Attachment, FeeSchedule, TransactionType};
use super::codec::{hex_array, ByteReader, ByteWriter, CodecError, CodecResult};
use super::{AccountId, BlockId, Hash, PublicKey, SignatureBytes, TransactionId};
use crate::constants::{CHAIN_ID, NEW_ACCOUNT_FEE_KER, TRANSACTION_VERSION};
use crate::crypto::{self, KeyPair};
use crate::ledger::{Ledger, LedgerEvent, LedgerResult};

/// Offset of the signature inside the transaction bytes
pub const SIGNATURE_OFFSET: usize = 4 + 1 + 1 + 1 + 4 + 2 + 32 + 8 + 8 + 8;
const SIGNATURE_LEN: usize = 64;

/// Position of a transaction inside the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLinkage {
    pub height: i32,
    pub block_id: BlockId,
    pub block_timestamp: i32,
    pub index: i16,
}

impl Default for BlockLinkage {
    fn default() -> Self {
        Self {
            height: i32::MAX,
            block_id: 0,
            block_timestamp: -1,
            index: -1,
        }
    }
}

/// A signed transfer of value or change of account state
pub struct Transaction {
    chain_id: i32,
    version: u8,
    timestamp: i32,
    deadline: i16,
    sender_public_key: PublicKey,
    recipient_id: AccountId,
    amount_ker: i64,
    fee_ker: i64,
    signature: Option<SignatureBytes>,
    ec_block_height: i32,
    ec_block_id: BlockId,
    attachment: Attachment,
    appendages: Vec<Appendix>,
    linkage: RwLock<BlockLinkage>,
    bytes: OnceLock<Vec<u8>>,
    full_hash: OnceLock<Hash>,
    sender_id: OnceLock<AccountId>,
}

impl Transaction {
    // ========== Fields ==========

    pub fn chain_id(&self) -> i32 {
        self.chain_id
    }

    pub fn tx_type(&self) -> TransactionType {
        self.attachment.transaction_type()
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn timestamp(&self) -> i32 {
        self.timestamp
    }

    pub fn deadline(&self) -> i16 {
        self.deadline
    }

    /// Last epoch second at which the transaction may be included
    pub fn expiration(&self) -> i32 {
        self.timestamp.saturating_add(i32::from(self.deadline) * 60)
    }

    pub fn sender_public_key(&self) -> &PublicKey {
        &self.sender_public_key
    }

    pub fn sender_id(&self) -> AccountId {
        *self
            .sender_id
            .get_or_init(|| crypto::account_id(&self.sender_public_key))
    }

    pub fn recipient_id(&self) -> AccountId {
        self.recipient_id
    }

    pub fn amount_ker(&self) -> i64 {
        self.amount_ker
    }

    pub fn fee_ker(&self) -> i64 {
        self.fee_ker
    }

    pub fn signature(&self) -> Option<&SignatureBytes> {
        self.signature.as_ref()
    }

    pub fn ec_block_height(&self) -> i32 {
        self.ec_block_height
    }

    pub fn ec_block_id(&self) -> BlockId {
        self.ec_block_id
    }

    pub fn attachment(&self) -> &Attachment {
        &self.attachment
    }

    pub fn appendages(&self) -> &[Appendix] {
        &self.appendages
    }

    // ========== Identity ==========

    pub fn full_hash(&self) -> &Hash {
        self.full_hash.get_or_init(|| {
            let unsigned = self.unsigned_bytes();
            let signature = self.signature.unwrap_or([0u8; SIGNATURE_LEN]);
            crypto::sha256_concat(&[&unsigned, &crypto::sha256(&signature)])
        })
    }

    pub fn id(&self) -> TransactionId {
        crypto::full_hash_to_id(self.full_hash())
    }

    /// `"<chain id>:<hex full hash>"`
    pub fn string_id(&self) -> String {
        format!("{}:{}", self.chain_id, hex::encode(self.full_hash()))
    }

    // ========== Linkage ==========

    pub fn linkage(&self) -> BlockLinkage {
        *self.linkage.read()
    }

    pub fn height(&self) -> i32 {
        self.linkage.read().height
    }

    pub fn block_id(&self) -> BlockId {
        self.linkage.read().block_id
    }

    pub fn index(&self) -> i16 {
        self.linkage.read().index
    }

    pub fn set_block(&self, block_id: BlockId, height: i32, block_timestamp: i32, index: i16) {
        *self.linkage.write() = BlockLinkage {
            height,
            block_id,
            block_timestamp,
            index,
        };
    }

    /// Detach from a popped block, keeping the last known height
    pub fn unset_block(&self) {
        let mut linkage = self.linkage.write();
        linkage.block_id = 0;
        linkage.block_timestamp = -1;
        linkage.index = -1;
    }

    /// Copy that shares no block linkage with the original
    pub fn detached(&self) -> Transaction {
        Transaction {
            chain_id: self.chain_id,
            version: self.version,
            timestamp: self.timestamp,
            deadline: self.deadline,
            sender_public_key: self.sender_public_key,
            recipient_id: self.recipient_id,
            amount_ker: self.amount_ker,
            fee_ker: self.fee_ker,
            signature: self.signature,
            ec_block_height: self.ec_block_height,
            ec_block_id: self.ec_block_id,
            attachment: self.attachment.clone(),
            appendages: self.appendages.clone(),
            linkage: RwLock::new(BlockLinkage::default()),
            bytes: self.bytes.clone(),
            full_hash: self.full_hash.clone(),
            sender_id: self.sender_id.clone(),
        }
    }

    // ========== Bytes ==========

    fn flags(&self) -> i32 {
        self.appendages.iter().fold(0, |flags, a| flags | a.flag())
    }

    fn write(&self, w: &mut ByteWriter, signature: Option<&SignatureBytes>) {
        w.put_i32(self.chain_id);
        w.put_i8(self.tx_type().code());
        w.put_i8(self.tx_type().subtype());
        w.put_u8(self.version);
        w.put_i32(self.timestamp);
        w.put_i16(self.deadline);
        w.put_bytes(&self.sender_public_key);
        w.put_u64(self.recipient_id);
        w.put_i64(self.amount_ker);
        w.put_i64(self.fee_ker);
        match signature {
            Some(sig) => w.put_bytes(sig),
            None => w.put_bytes(&[0u8; SIGNATURE_LEN]),
        }
        w.put_i32(self.ec_block_height);
        w.put_u64(self.ec_block_id);
        w.put_i32(self.flags());
        self.attachment.write(w);
        for appendix in &self.appendages {
            appendix.write(w);
        }
    }

    fn body_size(&self) -> usize {
        SIGNATURE_OFFSET
            + SIGNATURE_LEN
            + 4
            + 8
            + 4
            + self.attachment.size()
            + self.appendages.iter().map(Appendix::size).sum::<usize>()
    }

    /// Canonical bytes including the signature
    pub fn bytes(&self) -> &[u8] {
        self.bytes.get_or_init(|| {
            let mut w = ByteWriter::with_capacity(self.body_size());
            self.write(&mut w, self.signature.as_ref());
            w.into_bytes()
        })
    }

    /// Canonical bytes with the signature zeroed, the signed message
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(self.body_size());
        self.write(&mut w, None);
        w.into_bytes()
    }

    pub fn size(&self) -> usize {
        self.bytes().len()
    }

    /// Parse canonical bytes, rejecting any trailing input
    pub fn parse(bytes: &[u8]) -> CodecResult<Self> {
        let mut r = ByteReader::new(bytes);
        let chain_id = r.get_i32()?;
        let code = r.get_i8()?;
        let subtype = r.get_i8()?;
        let version = r.get_u8()?;
        let timestamp = r.get_i32()?;
        let deadline = r.get_i16()?;
        let sender_public_key = r.get_array::<32>()?;
        let recipient_id = r.get_u64()?;
        let amount_ker = r.get_i64()?;
        let fee_ker = r.get_i64()?;
        let signature = r.get_array::<SIGNATURE_LEN>()?;
        let ec_block_height = r.get_i32()?;
        let ec_block_id = r.get_u64()?;
        let flags = r.get_i32()?;

        let tx_type = TransactionType::from_code(code, subtype).ok_or(CodecError::UnknownType {
            tx_type: code,
            subtype,
        })?;
        let attachment = Attachment::parse(tx_type, &mut r)?;
        let known = Appendix::FLAGS.iter().fold(0, |m, f| m | f);
        if flags & !known != 0 {
            return Err(CodecError::InvalidAppendix(format!(
                "unknown appendix flags {:#x}",
                flags & !known
            )));
        }
        let mut appendages = Vec::new();
        for flag in Appendix::FLAGS {
            if flags & flag != 0 {
                appendages.push(Appendix::parse(flag, &mut r)?);
            }
        }
        r.finish()?;

        let signature = if signature.iter().all(|b| *b == 0) {
            None
        } else {
            Some(signature)
        };

        TransactionBuilder {
            chain_id,
            version,
            timestamp,
            deadline,
            sender_public_key,
            recipient_id,
            amount_ker,
            fee_ker,
            signature,
            ec_block_height,
            ec_block_id,
            attachment,
            appendages,
        }
        .build()
    }

    // ========== Signature ==========

    /// Verify the signature against the embedded sender key
    pub fn verify_signature(&self) -> bool {
        match &self.signature {
            Some(sig) => crypto::verify(sig, &self.unsigned_bytes(), &self.sender_public_key),
            None => false,
        }
    }

    // ========== Fees ==========

    fn fee_schedules(&self) -> impl Iterator<Item = FeeSchedule> + '_ {
        std::iter::once(self.attachment.fee_schedule())
            .chain(self.appendages.iter().map(Appendix::fee_schedule))
    }

    /// Smallest acceptable fee at `height`
    pub fn minimum_fee_ker(&self, height: i32, ledger: &dyn Ledger) -> i64 {
        let mut total: i64 = 0;
        for schedule in self.fee_schedules() {
            if height < schedule.baseline_height {
                return 0;
            }
            total = total.saturating_add(schedule.fee_at(height));
        }
        if self.recipient_id != 0 && !ledger.has_account(self.recipient_id, height) {
            total = total.saturating_add(NEW_ACCOUNT_FEE_KER);
        }
        total
    }

    // ========== Ledger effects ==========

    fn ledger_event(&self) -> LedgerEvent {
        match self.tx_type() {
            TransactionType::Payment => LedgerEvent::Payment,
            TransactionType::EffectiveBalanceLeasing => LedgerEvent::EffectiveBalanceLeasing,
        }
    }

    fn total_debit(&self) -> i64 {
        self.amount_ker.saturating_add(self.fee_ker)
    }

    /// Reserve amount and fee from the sender's unconfirmed balance.
    ///
    /// Returns false, changing nothing, when the balance cannot cover it.
    pub fn apply_unconfirmed(&self, ledger: &mut dyn Ledger, height: i32) -> LedgerResult<bool> {
        let sender = self.sender_id();
        let available = match ledger.account(sender) {
            Some(account) => account.unconfirmed_balance_ker,
            None => return Ok(false),
        };
        if available < self.total_debit() {
            return Ok(false);
        }
        ledger.add_to_unconfirmed_balance(
            sender,
            self.ledger_event(),
            self.id(),
            -self.total_debit(),
            height,
        )?;
        Ok(true)
    }

    /// Release a reservation made by `apply_unconfirmed`
    pub fn undo_unconfirmed(&self, ledger: &mut dyn Ledger, height: i32) -> LedgerResult<()> {
        ledger.add_to_unconfirmed_balance(
            self.sender_id(),
            self.ledger_event(),
            self.id(),
            self.total_debit(),
            height,
        )
    }

    /// Apply the confirmed effects of the transaction at `height`
    pub fn apply(&self, ledger: &mut dyn Ledger, height: i32) -> LedgerResult<()> {
        let sender = self.sender_id();
        ledger.apply_public_key(sender, &self.sender_public_key, height)?;
        if self.recipient_id != 0 && ledger.account(self.recipient_id).is_none() {
            ledger.add_account(self.recipient_id, height)?;
        }
        ledger.add_to_balance(sender, self.ledger_event(), self.id(), -self.total_debit(), height)?;
        if self.recipient_id != 0 {
            ledger.add_to_balance_and_unconfirmed_balance(
                self.recipient_id,
                self.ledger_event(),
                self.id(),
                self.amount_ker,
                height,
            )?;
        }
        self.attachment.apply(self, ledger, height)?;
        for appendix in &self.appendages {
            appendix.apply(self, ledger, height)?;
        }
        Ok(())
    }

    // ========== JSON ==========

    pub fn to_json(&self) -> Value {
        let mut attachment = Map::new();
        self.attachment.write_json(&mut attachment);
        for appendix in &self.appendages {
            appendix.write_json(&mut attachment);
        }
        let json = TransactionJson {
            chain: self.chain_id,
            tx_type: self.tx_type().code(),
            subtype: self.tx_type().subtype(),
            timestamp: self.timestamp,
            deadline: self.deadline,
            sender_public_key: hex::encode(self.sender_public_key),
            recipient: self.recipient_id,
            amount_ker: self.amount_ker,
            fee_ker: self.fee_ker,
            signature: self.signature.map(hex::encode),
            version: self.version,
            ec_block_height: self.ec_block_height,
            ec_block_id: self.ec_block_id,
            attachment,
        };
        serde_json::to_value(json).unwrap_or(Value::Null)
    }

    pub fn from_json(value: &Value) -> CodecResult<Self> {
        let json: TransactionJson = serde_json::from_value(value.clone())?;
        let tx_type = TransactionType::from_code(json.tx_type, json.subtype).ok_or(
            CodecError::UnknownType {
                tx_type: json.tx_type,
                subtype: json.subtype,
            },
        )?;
        let signature = match &json.signature {
            Some(s) => Some(hex_array::<SIGNATURE_LEN>("signature", s)?),
            None => None,
        };
        TransactionBuilder {
            chain_id: json.chain,
            version: json.version,
            timestamp: json.timestamp,
            deadline: json.deadline,
            sender_public_key: hex_array("senderPublicKey", &json.sender_public_key)?,
            recipient_id: json.recipient,
            amount_ker: json.amount_ker,
            fee_ker: json.fee_ker,
            signature,
            ec_block_height: json.ec_block_height,
            ec_block_id: json.ec_block_id,
            attachment: Attachment::parse_json(tx_type, &json.attachment)?,
            appendages: Appendix::parse_json(&json.attachment)?,
        }
        .build()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.bytes() == other.bytes()
    }
}

impl Eq for Transaction {}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("type", &self.tx_type())
            .field("sender", &self.sender_id())
            .field("recipient", &self.recipient_id)
            .field("amount_ker", &self.amount_ker)
            .field("fee_ker", &self.fee_ker)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

#[serde_as]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionJson {
    chain: i32,
    #[serde(rename = "type")]
    tx_type: i8,
    subtype: i8,
    timestamp: i32,
    deadline: i16,
    sender_public_key: String,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    #[serde(default)]
    recipient: u64,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    #[serde(rename = "amountKER")]
    amount_ker: i64,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    #[serde(rename = "feeKER")]
    fee_ker: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    version: u8,
    ec_block_height: i32,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    ec_block_id: u64,
    #[serde(default)]
    attachment: Map<String, Value>,
}

/// Assembles and signs transactions
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    chain_id: i32,
    version: u8,
    timestamp: i32,
    deadline: i16,
    sender_public_key: PublicKey,
    recipient_id: AccountId,
    amount_ker: i64,
    fee_ker: i64,
    signature: Option<SignatureBytes>,
    ec_block_height: i32,
    ec_block_id: BlockId,
    attachment: Attachment,
    appendages: Vec<Appendix>,
}

impl TransactionBuilder {
    pub fn new(
        sender_public_key: PublicKey,
        amount_ker: i64,
        fee_ker: i64,
        deadline: i16,
        attachment: Attachment,
        timestamp: i32,
    ) -> Self {
        Self {
            chain_id: CHAIN_ID,
            version: TRANSACTION_VERSION,
            timestamp,
            deadline,
            sender_public_key,
            recipient_id: 0,
            amount_ker,
            fee_ker,
            signature: None,
            ec_block_height: 0,
            ec_block_id: 0,
            attachment,
            appendages: Vec::new(),
        }
    }

    pub fn recipient(mut self, recipient_id: AccountId) -> Self {
        self.recipient_id = recipient_id;
        self
    }

    pub fn appendix(mut self, appendix: Appendix) -> Self {
        self.appendages.push(appendix);
        self
    }

    pub fn ec_block(mut self, height: i32, id: BlockId) -> Self {
        self.ec_block_height = height;
        self.ec_block_id = id;
        self
    }

    pub fn version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn chain_id(mut self, chain_id: i32) -> Self {
        self.chain_id = chain_id;
        self
    }

    /// Build without a signature
    pub fn build(mut self) -> CodecResult<Transaction> {
        self.appendages.sort_by_key(Appendix::flag);
        if self.appendages.windows(2).any(|w| w[0].flag() == w[1].flag()) {
            return Err(CodecError::InvalidAppendix(
                "appendages must have strictly increasing types".into(),
            ));
        }
        Ok(Transaction {
            chain_id: self.chain_id,
            version: self.version,
            timestamp: self.timestamp,
            deadline: self.deadline,
            sender_public_key: self.sender_public_key,
            recipient_id: self.recipient_id,
            amount_ker: self.amount_ker,
            fee_ker: self.fee_ker,
            signature: self.signature,
            ec_block_height: self.ec_block_height,
            ec_block_id: self.ec_block_id,
            attachment: self.attachment,
            appendages: self.appendages,
            linkage: RwLock::new(BlockLinkage::default()),
            bytes: OnceLock::new(),
            full_hash: OnceLock::new(),
            sender_id: OnceLock::new(),
        })
    }

    /// Build and sign with `keys`
    pub fn sign(mut self, keys: &KeyPair) -> CodecResult<Transaction> {
        self.sender_public_key = keys.public_key();
        self.signature = None;
        let unsigned = self.clone().build()?;
        self.signature = Some(keys.sign(&unsigned.unsigned_bytes()));
        self.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::KER_PER_SCTK;
    use crate::types::appendix::PublicKeyAnnouncement;

    fn signed_payment(keys: &KeyPair, recipient: AccountId) -> Transaction {
        TransactionBuilder::new(keys.public_key(), 5 * KER_PER_SCTK, KER_PER_SCTK, 1440, Attachment::Payment, 1000)
            .recipient(recipient)
            .ec_block(0, 42)
            .sign(keys)
            .unwrap()
    }

    #[test]
    fn test_signature_offset() {
        assert_eq!(SIGNATURE_OFFSET, 69);
        let keys = KeyPair::from_secret_phrase("sender");
        let tx = signed_payment(&keys, 7);
        assert_eq!(&tx.bytes()[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 64], tx.signature().unwrap());
        assert_eq!(tx.size(), 69 + 64 + 16);
    }

    #[test]
    fn test_parse_round_trip() {
        let keys = KeyPair::from_secret_phrase("sender");
        let tx = signed_payment(&keys, 7);
        let parsed = Transaction::parse(tx.bytes()).unwrap();
        assert_eq!(parsed, tx);
        assert_eq!(parsed.id(), tx.id());
        assert_eq!(parsed.full_hash(), tx.full_hash());
        assert!(parsed.verify_signature());
    }

    #[test]
    fn test_parse_rejects_trailing_bytes() {
        let keys = KeyPair::from_secret_phrase("sender");
        let tx = signed_payment(&keys, 7);
        let mut bytes = tx.bytes().to_vec();
        bytes.push(0);
        assert!(matches!(
            Transaction::parse(&bytes),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_parse_unknown_type() {
        let keys = KeyPair::from_secret_phrase("sender");
        let tx = signed_payment(&keys, 7);
        let mut bytes = tx.bytes().to_vec();
        bytes[4] = 9;
        assert!(matches!(
            Transaction::parse(&bytes),
            Err(CodecError::UnknownType { tx_type: 9, .. })
        ));
    }

    #[test]
    fn test_id_derivation() {
        let keys = KeyPair::from_secret_phrase("sender");
        let tx = signed_payment(&keys, 7);
        let expected = crypto::sha256_concat(&[
            &tx.unsigned_bytes(),
            &crypto::sha256(tx.signature().unwrap()),
        ]);
        assert_eq!(tx.full_hash(), &expected);
        assert_eq!(tx.id(), crypto::full_hash_to_id(&expected));
        assert_eq!(tx.string_id(), format!("1:{}", hex::encode(expected)));
    }

    #[test]
    fn test_tampered_signature_fails() {
        let keys = KeyPair::from_secret_phrase("sender");
        let tx = signed_payment(&keys, 7);
        let mut bytes = tx.bytes().to_vec();
        bytes[SIGNATURE_OFFSET + 3] ^= 0x01;
        let parsed = Transaction::parse(&bytes).unwrap();
        assert!(!parsed.verify_signature());
        assert_ne!(parsed.id(), tx.id());
    }

    #[test]
    fn test_public_key_announcement_flag() {
        let keys = KeyPair::from_secret_phrase("sender");
        let recipient = KeyPair::from_secret_phrase("recipient");
        let tx = TransactionBuilder::new(keys.public_key(), 1, KER_PER_SCTK, 60, Attachment::Payment, 5)
            .recipient(recipient.account_id())
            .appendix(Appendix::PublicKeyAnnouncement(PublicKeyAnnouncement::new(recipient.public_key())))
            .sign(&keys)
            .unwrap();
        let flags_at = SIGNATURE_OFFSET + 64 + 12;
        let flags = i32::from_le_bytes(tx.bytes()[flags_at..flags_at + 4].try_into().unwrap());
        assert_eq!(flags, 32);

        let parsed = Transaction::parse(tx.bytes()).unwrap();
        assert_eq!(parsed.appendages().len(), 1);
        assert_eq!(parsed, tx);
    }

    #[test]
    fn test_duplicate_appendages_rejected() {
        let keys = KeyPair::from_secret_phrase("sender");
        let pka = Appendix::PublicKeyAnnouncement(PublicKeyAnnouncement::new([1u8; 32]));
        let result = TransactionBuilder::new(keys.public_key(), 1, 1, 60, Attachment::Payment, 5)
            .appendix(pka.clone())
            .appendix(pka)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let keys = KeyPair::from_secret_phrase("sender");
        let tx = TransactionBuilder::new(keys.public_key(), 0, KER_PER_SCTK / 10, 60, Attachment::leasing(1440), 5)
            .recipient(99)
            .sign(&keys)
            .unwrap();
        let json = tx.to_json();
        assert_eq!(json["amountKER"], Value::from("0"));
        assert_eq!(json["attachment"]["period"], Value::from(1440));
        let parsed = Transaction::from_json(&json).unwrap();
        assert_eq!(parsed, tx);
    }

    #[test]
    fn test_linkage() {
        let keys = KeyPair::from_secret_phrase("sender");
        let tx = signed_payment(&keys, 7);
        assert_eq!(tx.height(), i32::MAX);
        tx.set_block(11, 5, 300, 2);
        assert_eq!(tx.block_id(), 11);
        assert_eq!(tx.index(), 2);
        tx.unset_block();
        assert_eq!(tx.block_id(), 0);
        assert_eq!(tx.index(), -1);
        assert_eq!(tx.height(), 5);

        let copy = tx.detached();
        assert_eq!(copy.height(), i32::MAX);
        assert_eq!(copy.id(), tx.id());
    }

    #[test]
    fn test_expiration() {
        let keys = KeyPair::from_secret_phrase("sender");
        let tx = signed_payment(&keys, 7);
        assert_eq!(tx.expiration(), 1000 + 1440 * 60);

        let late = TransactionBuilder::new(keys.public_key(), KER_PER_SCTK, KER_PER_SCTK, 1440, Attachment::Payment, i32::MAX - 10)
            .recipient(7)
            .ec_block(0, 42)
            .sign(&keys)
            .unwrap();
        assert_eq!(late.expiration(), i32::MAX);
    }
}

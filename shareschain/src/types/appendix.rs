//! Transaction types and appendages
//!
//! A transaction carries exactly one attachment, which fixes its type, and
//! any number of optional appendages selected by a bitmask. Each part
//! contributes bytes, a fee and its own validation and ledger effects.
//!
//! Supported types:
//! - `SmcPayment` (type -2, subtype 0): plain transfer
//! - `EffectiveBalanceLeasing` (type -3, subtype 0): lend forging power
//!
//! Supported appendages:
//! - `PublicKeyAnnouncement` (bit 32): reveal the recipient's public key

use std::collections::HashMap;

use serde_json::{Map, Value};

use super::codec::{hex_array, ByteReader, ByteWriter, CodecError, CodecResult};
use super::transaction::Transaction;
use super::PublicKey;
use crate::constants::{
    DEFAULT_FEE_KER, LEASING_DELAY, LEASING_FEE_KER, MAX_BALANCE_KER,
};
use crate::crypto;
use crate::error::{ValidationError, ValidationResult};
use crate::ledger::{Ledger, LedgerResult};

/// Transaction type, identified on the wire by a (type, subtype) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransactionType {
    Payment,
    EffectiveBalanceLeasing,
}

impl TransactionType {
    pub fn from_code(tx_type: i8, subtype: i8) -> Option<Self> {
        match (tx_type, subtype) {
            (-2, 0) => Some(Self::Payment),
            (-3, 0) => Some(Self::EffectiveBalanceLeasing),
            _ => None,
        }
    }

    pub fn code(&self) -> i8 {
        match self {
            Self::Payment => -2,
            Self::EffectiveBalanceLeasing => -3,
        }
    }

    pub fn subtype(&self) -> i8 {
        0
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Payment => "SmcPayment",
            Self::EffectiveBalanceLeasing => "EffectiveBalanceLeasing",
        }
    }

    pub fn can_have_recipient(&self) -> bool {
        true
    }

    pub fn must_have_recipient(&self) -> bool {
        true
    }

    fn fee_schedule(&self) -> FeeSchedule {
        match self {
            Self::Payment => FeeSchedule::constant(DEFAULT_FEE_KER),
            Self::EffectiveBalanceLeasing => FeeSchedule::constant(LEASING_FEE_KER),
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Baseline fee with an optional switch to a different fee at a height
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    /// Below this height the transaction pays no minimum fee at all
    pub baseline_height: i32,
    pub baseline_fee: i64,
    /// From this height on `next_fee` applies
    pub next_height: i32,
    pub next_fee: i64,
}

impl FeeSchedule {
    pub const NONE: FeeSchedule = FeeSchedule::constant(0);

    pub const fn constant(fee: i64) -> Self {
        Self {
            baseline_height: 0,
            baseline_fee: fee,
            next_height: i32::MAX,
            next_fee: fee,
        }
    }

    pub fn fee_at(&self, height: i32) -> i64 {
        if height >= self.next_height {
            self.next_fee
        } else {
            self.baseline_fee
        }
    }
}

/// Mandatory type-specific part of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Payment,
    EffectiveBalanceLeasing { version: u8, period: u16 },
}

impl Attachment {
    pub fn leasing(period: u16) -> Self {
        Self::EffectiveBalanceLeasing { version: 1, period }
    }

    pub fn transaction_type(&self) -> TransactionType {
        match self {
            Self::Payment => TransactionType::Payment,
            Self::EffectiveBalanceLeasing { .. } => TransactionType::EffectiveBalanceLeasing,
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            Self::Payment => 0,
            Self::EffectiveBalanceLeasing { version, .. } => *version,
        }
    }

    /// Serialized size including the version prefix
    pub fn size(&self) -> usize {
        let body = match self {
            Self::Payment => 0,
            Self::EffectiveBalanceLeasing { .. } => 2,
        };
        body + usize::from(self.version() > 0)
    }

    pub fn write(&self, w: &mut ByteWriter) {
        if self.version() > 0 {
            w.put_u8(self.version());
        }
        if let Self::EffectiveBalanceLeasing { period, .. } = self {
            w.put_u16(*period);
        }
    }

    pub fn parse(tx_type: TransactionType, r: &mut ByteReader<'_>) -> CodecResult<Self> {
        match tx_type {
            TransactionType::Payment => Ok(Self::Payment),
            TransactionType::EffectiveBalanceLeasing => {
                let version = r.get_u8()?;
                let period = r.get_u16()?;
                Ok(Self::EffectiveBalanceLeasing { version, period })
            }
        }
    }

    pub fn write_json(&self, json: &mut Map<String, Value>) {
        if let Self::EffectiveBalanceLeasing { version, period } = self {
            json.insert(
                "version.EffectiveBalanceLeasing".into(),
                Value::from(*version),
            );
            json.insert("period".into(), Value::from(*period));
        }
    }

    pub fn parse_json(tx_type: TransactionType, json: &Map<String, Value>) -> CodecResult<Self> {
        match tx_type {
            TransactionType::Payment => Ok(Self::Payment),
            TransactionType::EffectiveBalanceLeasing => {
                let version = json_u64(json, "version.EffectiveBalanceLeasing")?;
                let period = json_u64(json, "period")?;
                let period = u16::try_from(period).map_err(|_| CodecError::InvalidField {
                    field: "period",
                    reason: format!("{} out of range", period),
                })?;
                Ok(Self::EffectiveBalanceLeasing {
                    version: version as u8,
                    period,
                })
            }
        }
    }

    pub fn verify_version(&self) -> bool {
        match self {
            Self::Payment => true,
            Self::EffectiveBalanceLeasing { version, .. } => *version == 1,
        }
    }

    pub fn fee_schedule(&self) -> FeeSchedule {
        self.transaction_type().fee_schedule()
    }

    /// Type-specific rules
    pub fn validate(&self, tx: &Transaction, ledger: &dyn Ledger) -> ValidationResult<()> {
        match self {
            Self::Payment => {
                if tx.amount_ker() <= 0 || tx.amount_ker() >= MAX_BALANCE_KER {
                    return Err(ValidationError::not_valid(format!(
                        "Invalid ordinary payment amount {}",
                        tx.amount_ker()
                    )));
                }
            }
            Self::EffectiveBalanceLeasing { period, .. } => {
                if tx.sender_id() == tx.recipient_id() {
                    return Err(ValidationError::not_valid(
                        "Account cannot lease balance to itself",
                    ));
                }
                if tx.amount_ker() != 0 {
                    return Err(ValidationError::not_valid(
                        "Transaction amount must be 0 for effective balance leasing",
                    ));
                }
                if i32::from(*period) < LEASING_DELAY {
                    return Err(ValidationError::not_valid(format!(
                        "Invalid effective balance leasing period: {}",
                        period
                    )));
                }
                if ledger.public_key(tx.recipient_id()).is_none() {
                    return Err(ValidationError::not_currently_valid(format!(
                        "Invalid effective balance leasing: recipient account {} not found or no public key published",
                        tx.recipient_id()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Key and per-block limit for duplicate detection, if this type has one
    pub fn duplicate_key(&self, tx: &Transaction) -> Option<(String, u32)> {
        match self {
            Self::Payment => None,
            Self::EffectiveBalanceLeasing { .. } => Some((tx.sender_id().to_string(), 0)),
        }
    }

    pub fn apply(&self, tx: &Transaction, ledger: &mut dyn Ledger, height: i32) -> LedgerResult<()> {
        match self {
            Self::Payment => Ok(()),
            Self::EffectiveBalanceLeasing { period, .. } => {
                ledger.lease_effective_balance(tx.sender_id(), tx.recipient_id(), *period, height)
            }
        }
    }
}

/// Bit assigned to the public key announcement appendage
pub const PUBLIC_KEY_ANNOUNCEMENT_FLAG: i32 = 32;

/// Optional appendage revealing the recipient's public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyAnnouncement {
    pub version: u8,
    pub public_key: PublicKey,
}

impl PublicKeyAnnouncement {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            version: 1,
            public_key,
        }
    }
}

/// Optional appendages, ordered by their flag bit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Appendix {
    PublicKeyAnnouncement(PublicKeyAnnouncement),
}

impl Appendix {
    /// Flag bits in ascending order; parsing and writing follow this order
    pub const FLAGS: [i32; 1] = [PUBLIC_KEY_ANNOUNCEMENT_FLAG];

    pub fn flag(&self) -> i32 {
        match self {
            Self::PublicKeyAnnouncement(_) => PUBLIC_KEY_ANNOUNCEMENT_FLAG,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PublicKeyAnnouncement(_) => "PublicKeyAnnouncement",
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            Self::PublicKeyAnnouncement(a) => a.version,
        }
    }

    pub fn size(&self) -> usize {
        let body = match self {
            Self::PublicKeyAnnouncement(_) => 32,
        };
        body + usize::from(self.version() > 0)
    }

    pub fn write(&self, w: &mut ByteWriter) {
        if self.version() > 0 {
            w.put_u8(self.version());
        }
        match self {
            Self::PublicKeyAnnouncement(a) => w.put_bytes(&a.public_key),
        }
    }

    /// Parse the appendage selected by `flag`
    pub fn parse(flag: i32, r: &mut ByteReader<'_>) -> CodecResult<Self> {
        match flag {
            PUBLIC_KEY_ANNOUNCEMENT_FLAG => {
                let version = r.get_u8()?;
                let public_key = r.get_array::<32>()?;
                Ok(Self::PublicKeyAnnouncement(PublicKeyAnnouncement {
                    version,
                    public_key,
                }))
            }
            other => Err(CodecError::InvalidAppendix(format!(
                "unknown appendix flag {}",
                other
            ))),
        }
    }

    pub fn write_json(&self, json: &mut Map<String, Value>) {
        match self {
            Self::PublicKeyAnnouncement(a) => {
                json.insert(
                    "version.PublicKeyAnnouncement".into(),
                    Value::from(a.version),
                );
                json.insert(
                    "recipientPublicKey".into(),
                    Value::from(hex::encode(a.public_key)),
                );
            }
        }
    }

    /// Parse every appendage present in an attachment JSON object
    pub fn parse_json(json: &Map<String, Value>) -> CodecResult<Vec<Self>> {
        let mut appendages = Vec::new();
        if json.contains_key("version.PublicKeyAnnouncement") {
            let version = json_u64(json, "version.PublicKeyAnnouncement")? as u8;
            let key = json
                .get("recipientPublicKey")
                .and_then(Value::as_str)
                .ok_or(CodecError::InvalidField {
                    field: "recipientPublicKey",
                    reason: "missing".into(),
                })?;
            appendages.push(Self::PublicKeyAnnouncement(PublicKeyAnnouncement {
                version,
                public_key: hex_array("recipientPublicKey", key)?,
            }));
        }
        Ok(appendages)
    }

    pub fn verify_version(&self) -> bool {
        self.version() == 1
    }

    pub fn fee_schedule(&self) -> FeeSchedule {
        match self {
            Self::PublicKeyAnnouncement(_) => FeeSchedule::NONE,
        }
    }

    pub fn is_allowed(&self, tx_type: TransactionType) -> bool {
        match self {
            Self::PublicKeyAnnouncement(_) => tx_type.can_have_recipient(),
        }
    }

    pub fn validate(&self, tx: &Transaction, ledger: &dyn Ledger) -> ValidationResult<()> {
        match self {
            Self::PublicKeyAnnouncement(a) => {
                if tx.recipient_id() == 0 {
                    return Err(ValidationError::not_valid(
                        "PublicKeyAnnouncement cannot be attached to transactions with no recipient",
                    ));
                }
                if !crypto::is_canonical_public_key(&a.public_key) {
                    return Err(ValidationError::not_valid(format!(
                        "Invalid recipient public key: {}",
                        hex::encode(a.public_key)
                    )));
                }
                if crypto::account_id(&a.public_key) != tx.recipient_id() {
                    return Err(ValidationError::not_valid(
                        "Announced public key does not match recipient accountId",
                    ));
                }
                if let Some(existing) = ledger.public_key(tx.recipient_id()) {
                    if existing != a.public_key {
                        return Err(ValidationError::not_currently_valid(
                            "A different public key for this account has already been announced",
                        ));
                    }
                }
                Ok(())
            }
        }
    }

    pub fn apply(&self, tx: &Transaction, ledger: &mut dyn Ledger, height: i32) -> LedgerResult<()> {
        match self {
            Self::PublicKeyAnnouncement(a) => {
                match ledger.public_key(tx.recipient_id()) {
                    Some(existing) if existing != a.public_key => Ok(()),
                    _ => ledger.apply_public_key(tx.recipient_id(), &a.public_key, height),
                }
            }
        }
    }
}

fn json_u64(json: &Map<String, Value>, field: &'static str) -> CodecResult<u64> {
    json.get(field)
        .and_then(Value::as_u64)
        .ok_or(CodecError::InvalidField {
            field,
            reason: "missing or not a number".into(),
        })
}

/// Per-block (or per-pool) counter of attachment uniqueness keys
#[derive(Debug, Clone, Default)]
pub struct DuplicateRegistry {
    counts: HashMap<TransactionType, HashMap<String, u32>>,
}

impl DuplicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence of `key`.
    ///
    /// Returns true once the key has been seen more than `max_count` times.
    /// A `max_count` of 0 makes the key exclusive: the first sighting passes
    /// and every later one is a duplicate.
    pub fn is_duplicate(&mut self, tx_type: TransactionType, key: &str, max_count: u32) -> bool {
        let by_key = self.counts.entry(tx_type).or_default();
        match by_key.get(key).copied() {
            None => {
                by_key.insert(key.to_string(), if max_count > 0 { 1 } else { 0 });
                false
            }
            Some(0) => true,
            Some(count) if count < max_count => {
                by_key.insert(key.to_string(), count + 1);
                false
            }
            Some(_) => true,
        }
    }

    /// Check a transaction's attachment against the registry
    pub fn check(&mut self, tx: &Transaction) -> bool {
        match tx.attachment().duplicate_key(tx) {
            Some((key, max_count)) => self.is_duplicate(tx.tx_type(), &key, max_count),
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes() {
        assert_eq!(TransactionType::from_code(-2, 0), Some(TransactionType::Payment));
        assert_eq!(
            TransactionType::from_code(-3, 0),
            Some(TransactionType::EffectiveBalanceLeasing)
        );
        assert_eq!(TransactionType::from_code(-2, 1), None);
        assert_eq!(TransactionType::Payment.name(), "SmcPayment");
    }

    #[test]
    fn test_attachment_sizes() {
        assert_eq!(Attachment::Payment.size(), 0);
        assert_eq!(Attachment::leasing(1440).size(), 3);

        let mut w = ByteWriter::default();
        Attachment::leasing(0x0102).write(&mut w);
        assert_eq!(w.into_bytes(), vec![1, 0x02, 0x01]);
    }

    #[test]
    fn test_public_key_announcement_size() {
        let a = Appendix::PublicKeyAnnouncement(PublicKeyAnnouncement::new([7u8; 32]));
        assert_eq!(a.size(), 33);
        let mut w = ByteWriter::default();
        a.write(&mut w);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 33);

        let mut r = ByteReader::new(&bytes);
        assert_eq!(Appendix::parse(PUBLIC_KEY_ANNOUNCEMENT_FLAG, &mut r).unwrap(), a);
    }

    #[test]
    fn test_fee_schedule() {
        let schedule = FeeSchedule {
            baseline_height: 0,
            baseline_fee: 10,
            next_height: 100,
            next_fee: 20,
        };
        assert_eq!(schedule.fee_at(99), 10);
        assert_eq!(schedule.fee_at(100), 20);
        assert_eq!(Attachment::Payment.fee_schedule().fee_at(5), DEFAULT_FEE_KER);
        assert_eq!(Attachment::leasing(10).fee_schedule().fee_at(5), LEASING_FEE_KER);
    }

    #[test]
    fn test_duplicate_registry_exclusive() {
        let mut registry = DuplicateRegistry::new();
        let t = TransactionType::EffectiveBalanceLeasing;
        assert!(!registry.is_duplicate(t, "a", 0));
        assert!(registry.is_duplicate(t, "a", 0));
        assert!(!registry.is_duplicate(t, "b", 0));
    }

    #[test]
    fn test_duplicate_registry_counted() {
        let mut registry = DuplicateRegistry::new();
        let t = TransactionType::Payment;
        assert!(!registry.is_duplicate(t, "k", 2));
        assert!(!registry.is_duplicate(t, "k", 2));
        assert!(registry.is_duplicate(t, "k", 2));

        registry.clear();
        assert!(!registry.is_duplicate(t, "k", 2));
    }

    #[test]
    fn test_attachment_json() {
        let mut json = Map::new();
        Attachment::leasing(77).write_json(&mut json);
        let parsed = Attachment::parse_json(TransactionType::EffectiveBalanceLeasing, &json).unwrap();
        assert_eq!(parsed, Attachment::leasing(77));
    }
}

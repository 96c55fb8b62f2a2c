//! Cryptographic primitives
//!
//! SHA-256 for every digest on the chain and Ed25519 for account keys.
//! A forging or sending key is derived from a secret phrase as
//! `SHA-256(phrase)`, so the phrase alone recovers the account.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::types::{AccountId, PublicKey, SignatureBytes};

/// SHA-256 of a single buffer
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 over several buffers, in order
pub fn sha256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Reads the first eight bytes of a hash as a little-endian integer.
///
/// Block, transaction and account ids are all derived this way.
pub fn full_hash_to_id(hash: &[u8]) -> u64 {
    let mut id = [0u8; 8];
    id.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(id)
}

/// Account id of a public key
pub fn account_id(public_key: &PublicKey) -> AccountId {
    full_hash_to_id(&sha256(public_key))
}

/// Check that a public key decodes to a usable curve point
pub fn is_canonical_public_key(public_key: &PublicKey) -> bool {
    match VerifyingKey::from_bytes(public_key) {
        Ok(key) => !key.is_weak(),
        Err(_) => false,
    }
}

/// Verify a detached signature
pub fn verify(signature: &SignatureBytes, message: &[u8], public_key: &PublicKey) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let signature = Signature::from_bytes(signature);
    key.verify_strict(message, &signature).is_ok()
}

/// Signing key of an account
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Derive the key pair of a secret phrase
    pub fn from_secret_phrase(secret_phrase: &str) -> Self {
        let seed = sha256(secret_phrase.as_bytes());
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Random key pair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::thread_rng()),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn account_id(&self) -> AccountId {
        account_id(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        self.signing_key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("account_id", &self.account_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_phrase_is_deterministic() {
        let a = KeyPair::from_secret_phrase("correct horse battery staple");
        let b = KeyPair::from_secret_phrase("correct horse battery staple");
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.account_id(), b.account_id());

        let c = KeyPair::from_secret_phrase("another phrase");
        assert_ne!(a.public_key(), c.public_key());
    }

    #[test]
    fn test_sign_verify() {
        let keys = KeyPair::generate();
        let sig = keys.sign(b"block bytes");
        assert!(verify(&sig, b"block bytes", &keys.public_key()));
        assert!(!verify(&sig, b"other bytes", &keys.public_key()));

        let other = KeyPair::generate();
        assert!(!verify(&sig, b"block bytes", &other.public_key()));
    }

    #[test]
    fn test_full_hash_to_id_little_endian() {
        let mut hash = [0u8; 32];
        hash[0] = 0x01;
        hash[7] = 0x80;
        assert_eq!(full_hash_to_id(&hash), 0x8000_0000_0000_0001);
    }

    #[test]
    fn test_canonical_public_key() {
        let keys = KeyPair::generate();
        assert!(is_canonical_public_key(&keys.public_key()));
        assert!(!is_canonical_public_key(&[0u8; 32]));
    }

    #[test]
    fn test_sha256_concat_matches_single_buffer() {
        let joined = sha256(b"helloworld");
        assert_eq!(sha256_concat(&[b"hello", b"world"]), joined);
    }
}

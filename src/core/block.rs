//! Block implementation for the ledger
//!
//! A block is immutable once mined: its hash binds the parent hash, the
//! transaction list, the timestamp, the chain difficulty and the nonce.

use crate::core::transaction::{LedgerTransaction, Transaction, TxId};
use crate::crypto::{calculate_merkle_root, sha256, Hash};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A block in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block<T = Transaction> {
    /// Proof-of-work hash of this block
    #[serde(with = "hex::serde")]
    pub hash: Hash,
    /// Hash of the parent block, `None` only for genesis
    #[serde(with = "opt_hex")]
    pub prev_hash: Option<Hash>,
    /// Seconds since the Unix epoch, recorded when mining started
    pub timestamp: i64,
    /// Ordered transactions; order feeds the content hash
    pub transactions: Vec<T>,
    /// Nonce found by the proof-of-work search
    pub nonce: i64,
    /// Height of the block, genesis is 0
    pub height: u64,
}

impl<T: LedgerTransaction> Block<T> {
    /// Create an unmined block on top of `prev_hash`. The hash and nonce are
    /// filled in by the proof-of-work search.
    pub fn new(prev_hash: Option<Hash>, height: u64, transactions: Vec<T>) -> Self {
        Self {
            hash: [0u8; 32],
            prev_hash,
            timestamp: Utc::now().timestamp(),
            transactions,
            nonce: 0,
            height,
        }
    }

    /// Content hash of the transaction list (merkle root over each
    /// transaction's canonical encoding)
    pub fn hash_transactions(&self) -> Hash {
        let leaves: Vec<Hash> = self
            .transactions
            .iter()
            .map(|tx| sha256(&tx.content_bytes()))
            .collect();
        calculate_merkle_root(&leaves)
    }

    /// Whether this is the parentless first block
    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_none()
    }

    /// Find a transaction in this block by id
    pub fn transaction(&self, id: &TxId) -> Option<&T> {
        self.transactions.iter().find(|tx| tx.id() == *id)
    }

    /// Get number of transactions in this block
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }
}

/// Serde adapter for an optional hex-encoded hash
mod opt_hex {
    use crate::crypto::Hash;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Hash>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(hash) => serializer.serialize_some(&hex::encode(hash)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Hash>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| {
                let mut hash = [0u8; 32];
                hex::decode_to_slice(&s, &mut hash).map_err(D::Error::custom)?;
                Ok(hash)
            })
            .transpose()
    }
}

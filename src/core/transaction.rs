//! Transaction handling for the ledger
//!
//! The ledger core never looks inside a transaction's encoding. It talks to
//! transactions through the [`LedgerTransaction`] capability set:
//! identity, the coinbase predicate, signing and verification against the
//! referenced transactions, and per-input / per-output key predicates.
//!
//! [`Transaction`] is the one implementation shipped with the crate: a
//! pay-to-public-key-hash model with one ECDSA signature per input.

use crate::crypto::{
    hash160, public_key_from_bytes, sha256, verify_signature, Hash, KeyError, KeyPair,
};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Output index carried by the single input of a coinbase transaction
pub const COINBASE_VOUT: u32 = u32::MAX;

/// Bytes of random memo data used when a coinbase is created without a memo
pub const COINBASE_MEMO_LEN: usize = 20;

/// Transaction identity: a 32-byte content digest
pub type TxId = Hash;

// =============================================================================
// Error Types
// =============================================================================

/// Transaction-related errors
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Referenced transaction {0} was not supplied")]
    MissingPrevious(String),
    #[error("Referenced output {vout} does not exist in transaction {txid}")]
    InvalidOutputIndex { txid: String, vout: u32 },
    #[error("Crypto error: {0}")]
    CryptoError(#[from] KeyError),
}

// =============================================================================
// Capability traits
// =============================================================================

/// Reference to one output of an earlier transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: TxId,
    pub vout: u32,
}

/// What the ledger needs to know about a transaction input
pub trait SpendingInput {
    /// The output this input consumes
    fn outpoint(&self) -> OutPoint;

    /// Whether this input was made with the key hashing to `pub_key_hash`
    fn uses_key(&self, pub_key_hash: &[u8]) -> bool;
}

/// What the ledger needs to know about a transaction output
pub trait LockedOutput: Clone + Debug + PartialEq + Serialize + DeserializeOwned {
    fn value(&self) -> u64;

    /// Whether the output can be unlocked by the key hashing to `pub_key_hash`
    fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool;
}

/// Capability contract the chain and the UTXO index consume
pub trait LedgerTransaction: Clone + Debug + Serialize + DeserializeOwned + Send + Sync {
    type Input: SpendingInput;
    type Output: LockedOutput;

    fn id(&self) -> TxId;

    /// Whether the stored id is the digest of the transaction's contents
    fn has_consistent_id(&self) -> bool;

    /// A coinbase has no real inputs and is exempt from spend, signing and
    /// verification checks
    fn is_coinbase(&self) -> bool;

    fn inputs(&self) -> &[Self::Input];

    fn outputs(&self) -> &[Self::Output];

    /// Canonical encoding of the whole transaction, signatures included.
    /// Feeds the block content hash.
    fn content_bytes(&self) -> Vec<u8>;

    /// Build a reward-minting transaction paying `value` to `to`
    fn coinbase(to: &[u8], value: u64, memo: &str) -> Self;

    /// Sign every input. `prev_txs` must hold each referenced transaction.
    fn sign(
        &mut self,
        key_pair: &KeyPair,
        prev_txs: &HashMap<TxId, Self>,
    ) -> Result<(), TransactionError>;

    /// Check the id, every input signature, and that outputs do not spend
    /// more than the referenced outputs hold
    fn verify(&self, prev_txs: &HashMap<TxId, Self>) -> Result<bool, TransactionError>;
}

// =============================================================================
// Transaction Input / Output
// =============================================================================

/// Transaction input (reference to a previous output)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    /// Transaction ID of the previous transaction
    #[serde(with = "hex::serde")]
    pub txid: TxId,
    /// Index of the output in the previous transaction
    pub vout: u32,
    /// Compact ECDSA signature
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    /// Serialized public key of the spender (memo bytes for a coinbase)
    #[serde(with = "hex::serde")]
    pub pub_key: Vec<u8>,
}

impl SpendingInput for TxInput {
    fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.vout,
        }
    }

    fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash160(&self.pub_key) == pub_key_hash
    }
}

/// Transaction output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    /// Amount of coins
    pub value: u64,
    /// Locking key hash (RIPEMD160(SHA256(pubkey)))
    #[serde(with = "hex::serde")]
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, pub_key_hash: &[u8]) -> Self {
        Self {
            value,
            pub_key_hash: pub_key_hash.to_vec(),
        }
    }
}

impl LockedOutput for TxOutput {
    fn value(&self) -> u64 {
        self.value
    }

    fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// A pay-to-public-key-hash transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    /// Content digest over inputs and outputs, signatures blanked
    #[serde(with = "hex::serde")]
    pub id: TxId,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Create a new unsigned transaction and compute its id
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        let mut tx = Self {
            id: [0u8; 32],
            inputs,
            outputs,
        };
        tx.id = tx.calculate_hash();
        tx
    }

    /// Deterministic encoding of everything except signatures and the id
    fn signing_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&(self.inputs.len() as u32).to_be_bytes());
        for input in &self.inputs {
            data.extend_from_slice(&input.txid);
            data.extend_from_slice(&input.vout.to_be_bytes());
            data.extend_from_slice(&(input.pub_key.len() as u32).to_be_bytes());
            data.extend_from_slice(&input.pub_key);
        }
        data.extend_from_slice(&(self.outputs.len() as u32).to_be_bytes());
        for output in &self.outputs {
            data.extend_from_slice(&output.value.to_be_bytes());
            data.extend_from_slice(&(output.pub_key_hash.len() as u32).to_be_bytes());
            data.extend_from_slice(&output.pub_key_hash);
        }
        data
    }

    /// Calculate the transaction id. Signatures never feed the id.
    pub fn calculate_hash(&self) -> TxId {
        sha256(&self.signing_bytes())
    }

    /// Copy with signatures and public keys stripped from every input
    fn trimmed_copy(&self) -> Self {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                txid: input.txid,
                vout: input.vout,
                signature: Vec::new(),
                pub_key: Vec::new(),
            })
            .collect();

        Self {
            id: self.id,
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Digest signed for input `index`: the trimmed transaction with that
    /// input's key slot holding the locking hash of the output it spends
    fn input_digest(
        &self,
        trimmed: &mut Self,
        index: usize,
        prev_txs: &HashMap<TxId, Self>,
    ) -> Result<Hash, TransactionError> {
        let input = &self.inputs[index];
        let prev_tx = prev_txs
            .get(&input.txid)
            .ok_or_else(|| TransactionError::MissingPrevious(hex::encode(input.txid)))?;
        let prev_out = prev_tx.outputs.get(input.vout as usize).ok_or_else(|| {
            TransactionError::InvalidOutputIndex {
                txid: hex::encode(input.txid),
                vout: input.vout,
            }
        })?;

        trimmed.inputs[index].pub_key = prev_out.pub_key_hash.clone();
        let digest = sha256(&trimmed.signing_bytes());
        trimmed.inputs[index].pub_key = Vec::new();
        Ok(digest)
    }

    /// Get total output amount, `None` if it does not fit in a `u64`
    pub fn total_output(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |total, output| total.checked_add(output.value))
    }
}

impl LedgerTransaction for Transaction {
    type Input = TxInput;
    type Output = TxOutput;

    fn id(&self) -> TxId {
        self.id
    }

    fn has_consistent_id(&self) -> bool {
        self.id == self.calculate_hash()
    }

    fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].txid == [0u8; 32]
            && self.inputs[0].vout == COINBASE_VOUT
    }

    fn inputs(&self) -> &[TxInput] {
        &self.inputs
    }

    fn outputs(&self) -> &[TxOutput] {
        &self.outputs
    }

    fn content_bytes(&self) -> Vec<u8> {
        let mut data = self.id.to_vec();
        data.extend_from_slice(&self.signing_bytes());
        for input in &self.inputs {
            data.extend_from_slice(&(input.signature.len() as u32).to_be_bytes());
            data.extend_from_slice(&input.signature);
        }
        data
    }

    fn coinbase(to: &[u8], value: u64, memo: &str) -> Self {
        let memo = if memo.is_empty() {
            let mut random = [0u8; COINBASE_MEMO_LEN];
            rand::thread_rng().fill_bytes(&mut random);
            hex::encode(random).into_bytes()
        } else {
            memo.as_bytes().to_vec()
        };

        let input = TxInput {
            txid: [0u8; 32],
            vout: COINBASE_VOUT,
            signature: Vec::new(),
            pub_key: memo,
        };
        Self::new(vec![input], vec![TxOutput::new(value, to)])
    }

    fn sign(
        &mut self,
        key_pair: &KeyPair,
        prev_txs: &HashMap<TxId, Self>,
    ) -> Result<(), TransactionError> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut trimmed = self.trimmed_copy();
        for index in 0..self.inputs.len() {
            let digest = self.input_digest(&mut trimmed, index, prev_txs)?;
            self.inputs[index].signature = key_pair.sign(&digest)?;
        }

        Ok(())
    }

    fn verify(&self, prev_txs: &HashMap<TxId, Self>) -> Result<bool, TransactionError> {
        if !self.has_consistent_id() {
            return Ok(false);
        }
        if self.is_coinbase() {
            return Ok(true);
        }

        let mut trimmed = self.trimmed_copy();
        let mut input_total = Some(0u64);
        for (index, input) in self.inputs.iter().enumerate() {
            let digest = self.input_digest(&mut trimmed, index, prev_txs)?;

            // The spender's key must be the one the output is locked to
            let prev_out = &prev_txs[&input.txid].outputs[input.vout as usize];
            input_total = input_total.and_then(|total| total.checked_add(prev_out.value));
            if !input.uses_key(&prev_out.pub_key_hash) {
                return Ok(false);
            }

            let public_key = match public_key_from_bytes(&input.pub_key) {
                Ok(key) => key,
                Err(_) => return Ok(false),
            };
            match verify_signature(&public_key, &digest, &input.signature) {
                Ok(true) => {}
                Ok(false) | Err(KeyError::InvalidSignature) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }

        match (input_total, self.total_output()) {
            (Some(inputs), Some(outputs)) => Ok(outputs <= inputs),
            _ => Ok(false),
        }
    }
}

// =============================================================================
// Transaction Builder
// =============================================================================

/// Builder for spending transactions
#[derive(Debug, Default)]
pub struct TransactionBuilder {
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spend output `vout` of `txid` with the given public key
    pub fn add_input(mut self, txid: TxId, vout: u32, pub_key: &[u8]) -> Self {
        self.inputs.push(TxInput {
            txid,
            vout,
            signature: Vec::new(),
            pub_key: pub_key.to_vec(),
        });
        self
    }

    /// Pay `value` to the owner of `pub_key_hash`
    pub fn add_output(mut self, value: u64, pub_key_hash: &[u8]) -> Self {
        self.outputs.push(TxOutput::new(value, pub_key_hash));
        self
    }

    /// Build without signing
    pub fn build(self) -> Transaction {
        Transaction::new(self.inputs, self.outputs)
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Proof-of-work puzzle
//!
//! The puzzle input is the concatenation, in fixed order, of the parent hash,
//! the content hash of the block's transactions, the timestamp, the
//! difficulty and a candidate nonce, each integer as 8 big-endian bytes.
//! A nonce solves the puzzle when SHA-256 of that input, read as a 256-bit
//! big-endian integer, is strictly below `1 << (256 - difficulty_bits)`.

use crate::core::block::Block;
use crate::core::transaction::LedgerTransaction;
use crate::crypto::{sha256, Hash};
use primitive_types::U256;
use thiserror::Error;

/// Default mining difficulty (number of leading zero bits)
pub const DEFAULT_DIFFICULTY: u32 = 16;

/// Largest accepted difficulty; the target must stay non-zero
pub const MAX_DIFFICULTY: u32 = 255;

/// Upper bound of the nonce search
pub const MAX_NONCE: i64 = i64::MAX;

/// The abort predicate is polled once per this many nonces
pub const ABORT_CHECK_INTERVAL: i64 = 1 << 12;

/// Proof-of-work errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PowError {
    #[error("Invalid difficulty {0} (expected 1..={max})", max = MAX_DIFFICULTY)]
    InvalidDifficulty(u32),
    #[error("Nonce space exhausted without a solution")]
    Exhausted,
    #[error("Mining aborted after {0} attempts")]
    Aborted(u64),
}

/// A winning nonce and the hash it produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Solution {
    pub nonce: i64,
    pub hash: Hash,
    /// Number of hashes computed to find it
    pub attempts: u64,
}

/// Mining target for a difficulty: `1 << (256 - difficulty_bits)`
pub fn target(difficulty_bits: u32) -> Result<U256, PowError> {
    if difficulty_bits == 0 || difficulty_bits > MAX_DIFFICULTY {
        return Err(PowError::InvalidDifficulty(difficulty_bits));
    }
    Ok(U256::one() << (256 - difficulty_bits as usize))
}

/// Interpret a hash as an unsigned big-endian 256-bit integer
pub fn hash_to_u256(hash: &Hash) -> U256 {
    U256::from_big_endian(hash)
}

/// Puzzle bound to one block's contents
#[derive(Debug, Clone)]
pub struct ProofOfWork {
    prev_hash: Option<Hash>,
    tx_hash: Hash,
    timestamp: i64,
    difficulty_bits: u32,
    target: U256,
}

impl ProofOfWork {
    /// Capture the puzzle inputs of `block`. The transaction content hash is
    /// computed once here, not per nonce.
    pub fn new<T: LedgerTransaction>(
        block: &Block<T>,
        difficulty_bits: u32,
    ) -> Result<Self, PowError> {
        Ok(Self {
            prev_hash: block.prev_hash,
            tx_hash: block.hash_transactions(),
            timestamp: block.timestamp,
            difficulty_bits,
            target: target(difficulty_bits)?,
        })
    }

    pub fn target(&self) -> U256 {
        self.target
    }

    /// Puzzle input for a candidate nonce
    pub fn prepare_data(&self, nonce: i64) -> Vec<u8> {
        let mut data = Vec::with_capacity(32 + 32 + 8 * 3);
        if let Some(prev_hash) = &self.prev_hash {
            data.extend_from_slice(prev_hash);
        }
        data.extend_from_slice(&self.tx_hash);
        data.extend_from_slice(&self.timestamp.to_be_bytes());
        data.extend_from_slice(&i64::from(self.difficulty_bits).to_be_bytes());
        data.extend_from_slice(&nonce.to_be_bytes());
        data
    }

    /// Hash for a candidate nonce
    pub fn hash_with_nonce(&self, nonce: i64) -> Hash {
        sha256(&self.prepare_data(nonce))
    }

    fn meets_target(&self, hash: &Hash) -> bool {
        hash_to_u256(hash) < self.target
    }

    /// Search nonces upward from 0 and return the first solution.
    ///
    /// `should_abort` is polled every [`ABORT_CHECK_INTERVAL`] nonces; once it
    /// returns true the search stops with [`PowError::Aborted`].
    pub fn run(&self, should_abort: impl Fn() -> bool) -> Result<Solution, PowError> {
        let mut nonce: i64 = 0;

        while nonce < MAX_NONCE {
            if nonce % ABORT_CHECK_INTERVAL == 0 && should_abort() {
                return Err(PowError::Aborted(nonce as u64));
            }

            let hash = self.hash_with_nonce(nonce);
            if self.meets_target(&hash) {
                return Ok(Solution {
                    nonce,
                    hash,
                    attempts: nonce as u64 + 1,
                });
            }

            nonce += 1;
        }

        Err(PowError::Exhausted)
    }

    /// Recompute the hash for `nonce` and test it against the target.
    ///
    /// This only checks the inequality; whether the result equals the hash a
    /// block claims is the caller's check.
    pub fn validate(&self, nonce: i64) -> bool {
        self.meets_target(&self.hash_with_nonce(nonce))
    }
}

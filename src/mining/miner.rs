//! Mining engine for the ledger
//!
//! Wraps [`Blockchain::mine_block`] with the block reward and keeps the UTXO
//! set in step with every block it mines.

use crate::core::blockchain::{BlockchainError, MinedBlock, RejectPolicy, BLOCK_REWARD};
use crate::core::transaction::{LedgerTransaction, Transaction};
use crate::crypto::short_hex;
use crate::storage::utxo_set::UtxoSet;
use log::{info, warn};

/// Mining statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MiningStats {
    /// Number of hash attempts
    pub hash_attempts: u64,
    /// Time taken in milliseconds
    pub time_ms: u128,
    /// Hash rate (hashes per second)
    pub hash_rate: f64,
}

impl MiningStats {
    pub fn new(hash_attempts: u64, time_ms: u128) -> Self {
        let hash_rate = if time_ms > 0 {
            (hash_attempts as f64) / (time_ms as f64 / 1000.0)
        } else {
            hash_attempts as f64
        };

        Self {
            hash_attempts,
            time_ms,
            hash_rate,
        }
    }
}

/// Miner for creating new blocks
pub struct Miner {
    /// Locking key hash receiving the block reward
    pub reward_key_hash: Vec<u8>,
    /// Reward per mined block
    pub reward: u64,
}

impl Miner {
    /// Create a miner paying [`BLOCK_REWARD`] to `reward_key_hash`
    pub fn new(reward_key_hash: &[u8]) -> Self {
        Self {
            reward_key_hash: reward_key_hash.to_vec(),
            reward: BLOCK_REWARD,
        }
    }

    /// Mine a block holding a reward coinbase followed by `transactions`, then
    /// fold it into `utxo_set`.
    ///
    /// Transactions that fail verification are left out. Once the block is
    /// on the chain a failed cache update does not fail the call: the block
    /// stays, and [`MinedBlock::utxo_stale`] is set until the set is reindexed.
    pub fn mine_block<T: LedgerTransaction>(
        &self,
        utxo_set: &UtxoSet<'_, T>,
        transactions: Vec<T>,
    ) -> Result<MinedBlock<T>, BlockchainError> {
        let coinbase = T::coinbase(&self.reward_key_hash, self.reward, "");

        let mut all_transactions = Vec::with_capacity(transactions.len() + 1);
        all_transactions.push(coinbase);
        all_transactions.extend(transactions);

        let mut mined = utxo_set
            .blockchain()
            .mine_block(all_transactions, RejectPolicy::DropInvalid)?;

        if let Err(e) = utxo_set.update(&mined.block) {
            mined.utxo_stale = true;
            warn!(
                "Block {} is on the chain but the UTXO set update failed ({}); run a reindex",
                short_hex(&mined.block.hash),
                e
            );
        }

        if !mined.rejected.is_empty() {
            info!(
                "Block {} left out {} invalid transaction(s)",
                mined.block.height,
                mined.rejected.len()
            );
        }

        Ok(mined)
    }

    /// Mine `count` empty reward blocks in a row
    pub fn mine_continuously(
        &self,
        utxo_set: &UtxoSet<'_, Transaction>,
        count: u64,
    ) -> Result<Vec<MinedBlock>, BlockchainError> {
        (0..count).map(|_| self.mine_block(utxo_set, vec![])).collect()
    }
}

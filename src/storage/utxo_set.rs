//! UTXO set
//!
//! A cache over the chain mapping each transaction id to the outputs of that
//! transaction nobody has spent yet. It lives in the store's `chainstate`
//! column family and is either rebuilt from a full chain scan
//! ([`UtxoSet::reindex`]) or folded forward one block at a time
//! ([`UtxoSet::update`]). Both paths produce the same entries for the same
//! chain.
//!
//! Outputs keep their original position inside their transaction, so a
//! partially spent entry never renumbers the survivors.
//!
//! A block is persisted and the cache updated in two separate commits. If the
//! process dies in between, the cache is stale until [`UtxoSet::reindex`] runs.

use crate::core::block::Block;
use crate::core::blockchain::{AcceptOutcome, Blockchain, BlockchainError};
use crate::core::transaction::{
    LedgerTransaction, LockedOutput, SpendingInput, Transaction, TxId, TxOutput,
};
use crate::crypto::short_hex;
use crate::storage::block_store::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

/// Unspent outputs of one transaction, keyed by original output index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "O: Serialize", deserialize = "O: serde::de::DeserializeOwned"))]
pub struct TxOutputs<O = TxOutput> {
    pub outputs: BTreeMap<u32, O>,
}

impl<O> Default for TxOutputs<O> {
    fn default() -> Self {
        Self {
            outputs: BTreeMap::new(),
        }
    }
}

impl<O: Clone> TxOutputs<O> {
    /// Every output of a transaction, all unspent
    pub fn from_outputs(outputs: &[O]) -> Self {
        Self {
            outputs: outputs
                .iter()
                .cloned()
                .enumerate()
                .map(|(index, output)| (index as u32, output))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Unspent-output index over a [`Blockchain`]
pub struct UtxoSet<'a, T: LedgerTransaction = Transaction> {
    chain: &'a Blockchain<T>,
}

impl<'a, T: LedgerTransaction> UtxoSet<'a, T> {
    pub fn new(chain: &'a Blockchain<T>) -> Self {
        Self { chain }
    }

    pub fn blockchain(&self) -> &'a Blockchain<T> {
        self.chain
    }

    /// Drop the whole cache and rebuild it from a full chain scan. Returns the
    /// number of entries written.
    pub fn reindex(&self) -> Result<usize, BlockchainError> {
        let _guard = self.chain.index_lock();
        let store = self.chain.store();

        let utxo = self.chain.find_utxo()?;

        let mut batch = store.batch();
        let mut removed = 0;
        store.scan_utxos(|txid, _| {
            batch.delete_utxo(&txid)?;
            removed += 1;
            Ok(true)
        })?;

        for (txid, outs) in &utxo {
            batch.put_utxo(txid, &serde_json::to_vec(outs).map_err(StorageError::from)?)?;
        }
        batch.commit()?;

        log::info!(
            "Reindexed UTXO set: {} stale entries dropped, {} written",
            removed,
            utxo.len()
        );
        Ok(utxo.len())
    }

    /// Fold a newly appended block into the cache.
    ///
    /// All changes of the block are staged and written in a single batch, so
    /// either the whole block lands or nothing does.
    pub fn update(&self, block: &Block<T>) -> Result<(), BlockchainError> {
        let _guard = self.chain.index_lock();
        let store = self.chain.store();

        // None marks an entry to delete
        let mut staged: HashMap<TxId, Option<TxOutputs<T::Output>>> = HashMap::new();

        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in tx.inputs() {
                    let outpoint = input.outpoint();
                    let entry = match staged.entry(outpoint.txid) {
                        Entry::Occupied(entry) => entry.into_mut(),
                        Entry::Vacant(slot) => slot.insert(self.load_entry(&outpoint.txid)?),
                    };

                    let spent = entry
                        .as_mut()
                        .and_then(|outs| outs.outputs.remove(&outpoint.vout));
                    if spent.is_none() {
                        log::warn!(
                            "Block {} spends {}:{} which is not in the UTXO set",
                            short_hex(&block.hash),
                            short_hex(&outpoint.txid),
                            outpoint.vout
                        );
                        continue;
                    }
                    if entry.as_ref().is_some_and(|outs| outs.is_empty()) {
                        *entry = None;
                    }
                }
            }

            let outs = TxOutputs::from_outputs(tx.outputs());
            staged.insert(tx.id(), (!outs.is_empty()).then_some(outs));
        }

        let mut batch = store.batch();
        for (txid, entry) in &staged {
            match entry {
                Some(outs) => {
                    batch.put_utxo(txid, &serde_json::to_vec(outs).map_err(StorageError::from)?)?
                }
                None => batch.delete_utxo(txid)?,
            }
        }
        batch.commit()?;

        log::debug!(
            "UTXO set updated with block {} ({} entries touched)",
            short_hex(&block.hash),
            staged.len()
        );
        Ok(())
    }

    /// Bring the cache in line after [`Blockchain::accept_block`]: fold a
    /// direct extension, rebuild after a branch switch, nothing otherwise.
    pub fn apply_accepted(
        &self,
        block: &Block<T>,
        outcome: AcceptOutcome,
    ) -> Result<(), BlockchainError> {
        match outcome {
            AcceptOutcome::NewTip => self.update(block),
            AcceptOutcome::Reorganized => self.reindex().map(|_| ()),
            AcceptOutcome::AlreadyKnown | AcceptOutcome::SideBranch => Ok(()),
        }
    }

    fn load_entry(&self, txid: &TxId) -> Result<Option<TxOutputs<T::Output>>, BlockchainError> {
        match self.chain.store().get_utxo(txid)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(StorageError::from)?)),
            None => Ok(None),
        }
    }

    /// First-fit selection of outputs locked to `pub_key_hash` until
    /// `amount` is covered.
    ///
    /// On a shortfall the total of every matching output is returned; the
    /// caller decides that this means insufficient funds.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, HashMap<TxId, Vec<u32>>), BlockchainError> {
        let mut accumulated = 0u64;
        let mut unspent: HashMap<TxId, Vec<u32>> = HashMap::new();

        self.chain.store().scan_utxos(|txid, bytes| {
            let outs: TxOutputs<T::Output> = serde_json::from_slice(bytes)?;
            for (index, output) in &outs.outputs {
                if accumulated >= amount {
                    return Ok(false);
                }
                if output.is_locked_with_key(pub_key_hash) {
                    accumulated = accumulated.saturating_add(output.value());
                    unspent.entry(txid).or_default().push(*index);
                }
            }
            Ok(accumulated < amount)
        })?;

        Ok((accumulated, unspent))
    }

    /// Every unspent output locked to `pub_key_hash`
    pub fn find_unspent_outputs_for(
        &self,
        pub_key_hash: &[u8],
    ) -> Result<Vec<T::Output>, BlockchainError> {
        let mut found = Vec::new();
        self.chain.store().scan_utxos(|_, bytes| {
            let outs: TxOutputs<T::Output> = serde_json::from_slice(bytes)?;
            found.extend(
                outs.outputs
                    .into_values()
                    .filter(|output| output.is_locked_with_key(pub_key_hash)),
            );
            Ok(true)
        })?;
        Ok(found)
    }

    /// Sum of every unspent output locked to `pub_key_hash`, capped at
    /// `u64::MAX`
    pub fn balance(&self, pub_key_hash: &[u8]) -> Result<u64, BlockchainError> {
        Ok(self
            .find_unspent_outputs_for(pub_key_hash)?
            .iter()
            .fold(0u64, |total, output| total.saturating_add(output.value())))
    }

    /// Number of transactions with at least one unspent output
    pub fn count_entries(&self) -> Result<usize, BlockchainError> {
        let mut count = 0;
        self.chain.store().scan_utxos(|_, _| {
            count += 1;
            Ok(true)
        })?;
        Ok(count)
    }

    /// The whole cache, decoded
    pub fn entries(&self) -> Result<HashMap<TxId, TxOutputs<T::Output>>, BlockchainError> {
        let mut entries = HashMap::new();
        for (txid, bytes) in self.chain.store().utxo_entries()? {
            let outs = serde_json::from_slice(&bytes).map_err(StorageError::from)?;
            entries.insert(txid, outs);
        }
        Ok(entries)
    }
}

//! Shared fixtures for unit tests

use crate::core::block::Block;
use crate::core::blockchain::{Blockchain, ChainConfig, RejectPolicy, BLOCK_REWARD};
use crate::core::transaction::{LedgerTransaction, Transaction, TransactionBuilder, TxId};
use crate::crypto::KeyPair;
use crate::storage::block_store::StorageConfig;
use std::path::Path;
use tempfile::TempDir;

/// Low enough that a block is found within a few hundred hashes
pub const TEST_DIFFICULTY: u32 = 8;

pub fn test_config(data_dir: &Path) -> ChainConfig {
    ChainConfig {
        storage: StorageConfig {
            data_dir: data_dir.to_path_buf(),
            node_id: "test".to_string(),
        },
        difficulty: TEST_DIFFICULTY,
    }
}

/// Fresh chain in a temp dir whose genesis pays [`BLOCK_REWARD`] to `owner`
pub fn new_chain(owner: &KeyPair) -> (TempDir, Blockchain) {
    let temp_dir = tempfile::tempdir().unwrap();
    let coinbase = Transaction::coinbase(&owner.pub_key_hash(), BLOCK_REWARD, "genesis");
    let chain = Blockchain::create(&test_config(temp_dir.path()), coinbase).unwrap();
    (temp_dir, chain)
}

/// Mine a block holding only a reward coinbase for `owner`
pub fn mine_empty(chain: &Blockchain, owner: &KeyPair) -> Block {
    let coinbase = Transaction::coinbase(&owner.pub_key_hash(), BLOCK_REWARD, "");
    chain
        .mine_block(vec![coinbase], RejectPolicy::AbortBatch)
        .unwrap()
        .block
}

/// Spend output `vout` of `txid` held by `from` into the given payments,
/// signed against the chain
pub fn spend(
    chain: &Blockchain,
    from: &KeyPair,
    txid: TxId,
    vout: u32,
    payments: &[(u64, &KeyPair)],
) -> Transaction {
    let mut builder = TransactionBuilder::new().add_input(txid, vout, &from.public_key_bytes());
    for (value, to) in payments {
        builder = builder.add_output(*value, &to.pub_key_hash());
    }
    let mut tx = builder.build();
    chain.sign_transaction(&mut tx, from).unwrap();
    tx
}

//! Mini-Ledger: a single-node proof-of-work ledger in Rust
//!
//! This crate provides:
//! - Proof of Work with a fixed, tunable difficulty
//! - A RocksDB block store with an atomically updated tip
//! - Longest-height fork choice for blocks received from elsewhere
//! - A persistent UTXO set, rebuilt by reindex or updated per block
//! - ECDSA signatures (secp256k1) and Base58Check addresses
//!
//! # Example
//!
//! ```rust,no_run
//! use mini_ledger::core::{Blockchain, ChainConfig, LedgerTransaction, Transaction, BLOCK_REWARD};
//! use mini_ledger::mining::Miner;
//! use mini_ledger::storage::UtxoSet;
//! use mini_ledger::wallet::Wallet;
//!
//! let wallet = Wallet::new();
//! let config = ChainConfig::default();
//!
//! // Create a new blockchain paying the genesis reward to the wallet
//! let coinbase = Transaction::coinbase(&wallet.pub_key_hash(), BLOCK_REWARD, "");
//! let blockchain = Blockchain::create(&config, coinbase).unwrap();
//! let utxo_set = UtxoSet::new(&blockchain);
//! utxo_set.reindex().unwrap();
//!
//! // Mine a block
//! let miner = Miner::new(&wallet.pub_key_hash());
//! let mined = miner.mine_block(&utxo_set, vec![]).unwrap();
//! println!("Mined block {} in {}ms", mined.block.height, mined.stats.time_ms);
//!
//! // Check balance
//! println!("Balance: {} coins", wallet.balance(&utxo_set).unwrap());
//! ```

pub mod cli;
pub mod core;
pub mod crypto;
pub mod mining;
pub mod storage;
pub mod wallet;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use crate::core::{
    AcceptOutcome, Block, Blockchain, BlockchainError, ChainConfig, RejectPolicy, Transaction,
    BLOCK_REWARD,
};
pub use crypto::KeyPair;
pub use mining::{Miner, ProofOfWork, DEFAULT_DIFFICULTY};
pub use storage::{BlockStore, StorageConfig, UtxoSet};
pub use wallet::Wallet;

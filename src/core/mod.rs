//! Core ledger components
//!
//! This module contains the fundamental building blocks:
//! - Transactions (UTXO model, behind the `LedgerTransaction` capability trait)
//! - Blocks (hash-linked, sealed by proof of work)
//! - Blockchain (persistent chain with a lock-guarded tip and fork choice)

pub mod block;
pub mod blockchain;
pub mod transaction;

pub use block::Block;
pub use blockchain::{
    AcceptOutcome, Blockchain, BlockchainError, BlockchainIterator, ChainConfig, MinedBlock,
    RejectPolicy, BLOCK_REWARD, GENESIS_COINBASE_MEMO,
};
pub use transaction::{
    LedgerTransaction, LockedOutput, OutPoint, SpendingInput, Transaction, TransactionBuilder,
    TransactionError, TxId, TxInput, TxOutput, COINBASE_MEMO_LEN, COINBASE_VOUT,
};

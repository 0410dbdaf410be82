//! Storage module: the RocksDB-backed block store and the UTXO set cache

pub mod block_store;
pub mod utxo_set;

pub use block_store::{BlockStore, StorageConfig, StorageError, StoreBatch};
pub use utxo_set::{TxOutputs, UtxoSet};

//! Persistent key-value layer for the ledger
//!
//! One RocksDB database per node identity with three column families:
//! - `blocks`: block hash -> serialized block, plus the reserved tip key
//! - `chainstate`: transaction id -> serialized unspent outputs
//! - `meta`: chain parameters fixed at creation (difficulty)
//!
//! Multi-key updates go through [`StoreBatch`], which commits as a single
//! RocksDB write batch: either every put/delete lands or none does.

use crate::crypto::Hash;
use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, DB};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Column family holding blocks and the tip pointer
pub const CF_BLOCKS: &str = "blocks";
/// Column family holding the UTXO cache
pub const CF_CHAINSTATE: &str = "chainstate";
/// Column family holding chain parameters
pub const CF_META: &str = "meta";

/// Reserved key of the tip pointer. Never collides with a 32-byte block hash.
pub const TIP_KEY: &[u8] = b"l";
/// Meta key of the difficulty the chain was created with
pub const DIFFICULTY_KEY: &[u8] = b"difficulty";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage unavailable at {path:?}: {reason}")]
    Unavailable { path: PathBuf, reason: String },
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Node identity; each node keeps its own ledger
    pub node_id: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".ledger_data"),
            node_id: "3000".to_string(),
        }
    }
}

impl StorageConfig {
    /// Directory of this node's ledger database
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(format!("blockchain_{}", self.node_id))
    }
}

/// Block ledger and UTXO cache store
pub struct BlockStore {
    db: DB,
    path: PathBuf,
}

impl BlockStore {
    /// Whether a store has been created at `path`
    pub fn exists(path: &Path) -> bool {
        path.join("CURRENT").exists()
    }

    /// Open the store at `path`, creating it and its column families if
    /// missing. Fails with [`StorageError::Unavailable`] if the backing files
    /// cannot be created or opened.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, [CF_BLOCKS, CF_CHAINSTATE, CF_META]).map_err(|e| {
            StorageError::Unavailable {
                path: path.to_path_buf(),
                reason: e.into_string(),
            }
        })?;

        log::debug!("Opened block store at {:?}", path);

        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::InvalidData(format!("missing column family {}", name)))
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Serialized block stored under `hash`
    pub fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get_cf(self.cf(CF_BLOCKS)?, hash)?)
    }

    /// Idempotent upsert of a serialized block
    pub fn put(&self, hash: &Hash, block: &[u8]) -> Result<(), StorageError> {
        self.db.put_cf(self.cf(CF_BLOCKS)?, hash, block)?;
        Ok(())
    }

    pub fn contains(&self, hash: &Hash) -> Result<bool, StorageError> {
        Ok(self.get(hash)?.is_some())
    }

    /// Current tip hash, `None` for an empty store
    pub fn tip(&self) -> Result<Option<Hash>, StorageError> {
        match self.db.get_cf(self.cf(CF_BLOCKS)?, TIP_KEY)? {
            Some(bytes) => Ok(Some(to_hash(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_tip(&self, hash: &Hash) -> Result<(), StorageError> {
        self.db.put_cf(self.cf(CF_BLOCKS)?, TIP_KEY, hash)?;
        Ok(())
    }

    // =========================================================================
    // Meta
    // =========================================================================

    pub fn difficulty(&self) -> Result<Option<u32>, StorageError> {
        match self.db.get_cf(self.cf(CF_META)?, DIFFICULTY_KEY)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
                    StorageError::InvalidData(format!("difficulty has {} bytes", bytes.len()))
                })?;
                Ok(Some(u32::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    // =========================================================================
    // Chainstate (UTXO cache)
    // =========================================================================

    /// Serialized unspent outputs of transaction `txid`
    pub fn get_utxo(&self, txid: &Hash) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get_cf(self.cf(CF_CHAINSTATE)?, txid)?)
    }

    /// Every chainstate entry, in the store's key order
    pub fn utxo_entries(&self) -> Result<Vec<(Hash, Vec<u8>)>, StorageError> {
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_CHAINSTATE)?, IteratorMode::Start) {
            let (key, value) = item?;
            entries.push((to_hash(&key)?, value.into_vec()));
        }
        Ok(entries)
    }

    /// Visit chainstate entries in key order until `visit` returns false
    pub fn scan_utxos(
        &self,
        mut visit: impl FnMut(Hash, &[u8]) -> Result<bool, StorageError>,
    ) -> Result<(), StorageError> {
        for item in self.db.iterator_cf(self.cf(CF_CHAINSTATE)?, IteratorMode::Start) {
            let (key, value) = item?;
            if !visit(to_hash(&key)?, &value)? {
                break;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Batches
    // =========================================================================

    /// Start an atomic multi-key update
    pub fn batch(&self) -> StoreBatch<'_> {
        StoreBatch {
            store: self,
            batch: WriteBatch::default(),
        }
    }
}

/// Pending atomic update; nothing is visible until [`StoreBatch::commit`]
pub struct StoreBatch<'a> {
    store: &'a BlockStore,
    batch: WriteBatch,
}

impl StoreBatch<'_> {
    pub fn put_block(&mut self, hash: &Hash, block: &[u8]) -> Result<(), StorageError> {
        self.batch.put_cf(self.store.cf(CF_BLOCKS)?, hash, block);
        Ok(())
    }

    pub fn set_tip(&mut self, hash: &Hash) -> Result<(), StorageError> {
        self.batch.put_cf(self.store.cf(CF_BLOCKS)?, TIP_KEY, hash);
        Ok(())
    }

    pub fn set_difficulty(&mut self, difficulty_bits: u32) -> Result<(), StorageError> {
        self.batch
            .put_cf(self.store.cf(CF_META)?, DIFFICULTY_KEY, difficulty_bits.to_be_bytes());
        Ok(())
    }

    pub fn put_utxo(&mut self, txid: &Hash, outputs: &[u8]) -> Result<(), StorageError> {
        self.batch.put_cf(self.store.cf(CF_CHAINSTATE)?, txid, outputs);
        Ok(())
    }

    pub fn delete_utxo(&mut self, txid: &Hash) -> Result<(), StorageError> {
        self.batch.delete_cf(self.store.cf(CF_CHAINSTATE)?, txid);
        Ok(())
    }

    /// Number of queued operations
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Apply every queued operation atomically
    pub fn commit(self) -> Result<(), StorageError> {
        self.store.db.write(self.batch)?;
        Ok(())
    }
}

fn to_hash(bytes: &[u8]) -> Result<Hash, StorageError> {
    bytes
        .try_into()
        .map_err(|_| StorageError::InvalidData(format!("expected 32-byte key, got {}", bytes.len())))
}

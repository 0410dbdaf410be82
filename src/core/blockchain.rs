//! Blockchain implementation
//!
//! The chain owns the block store and the tip pointer. The tip only moves
//! through [`Blockchain::mine_block`] and [`Blockchain::accept_block`], and
//! both advance it while holding the tip write lock, so "build on the current
//! tip" and "advance the tip" are observed as one step.
//!
//! Mining runs outside the lock. The search is abandoned as soon as another
//! block moves the tip, and a solution found on a superseded tip is refused
//! with [`BlockchainError::StaleTip`].

use crate::core::block::Block;
use crate::core::transaction::{
    LedgerTransaction, LockedOutput, SpendingInput, Transaction, TxId,
};
use crate::crypto::{short_hex, Hash, KeyPair};
use crate::mining::miner::MiningStats;
use crate::mining::pow::{self, PowError, ProofOfWork, DEFAULT_DIFFICULTY};
use crate::storage::block_store::{BlockStore, StorageConfig, StorageError};
use crate::storage::utxo_set::TxOutputs;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;

/// Block reward in coins
pub const BLOCK_REWARD: u64 = 50;

/// Memo of the genesis coinbase created by the command line front end
pub const GENESIS_COINBASE_MEMO: &str = "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

/// Blockchain-related errors
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Blockchain already exists at {0:?}")]
    AlreadyExists(PathBuf),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("Proof of work failed: {0}")]
    ProofOfWork(#[from] PowError),
    #[error("Tip moved from {expected} to {actual} while mining")]
    StaleTip { expected: String, actual: String },
    #[error("Mining cancelled")]
    MiningCancelled,
}

/// What to do with a pending transaction that fails verification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RejectPolicy {
    /// Leave the transaction out of the block and keep mining the rest
    #[default]
    DropInvalid,
    /// Refuse the whole batch
    AbortBatch,
}

/// Result of integrating a block obtained from elsewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// The block was already stored; nothing changed
    AlreadyKnown,
    /// Stored, but not higher than the tip
    SideBranch,
    /// Stored and became the tip, directly on top of the previous tip
    NewTip,
    /// Stored and became the tip of a different branch
    Reorganized,
}

/// A freshly mined block
#[derive(Debug, Clone)]
pub struct MinedBlock<T = Transaction> {
    pub block: Block<T>,
    /// Ids of pending transactions left out because they failed verification
    pub rejected: Vec<TxId>,
    pub stats: MiningStats,
    /// The block is on the chain but the UTXO set missed it; a reindex
    /// brings the set back in line
    pub utxo_stale: bool,
}

/// Chain configuration
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub storage: StorageConfig,
    /// Leading zero bits a block hash needs; fixed per chain
    pub difficulty: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            difficulty: DEFAULT_DIFFICULTY,
        }
    }
}

/// The ledger: blocks in a persistent store plus the current tip
pub struct Blockchain<T: LedgerTransaction = Transaction> {
    store: BlockStore,
    tip: RwLock<Hash>,
    /// Bumped on every tip change; lets a running search notice it
    tip_epoch: AtomicU64,
    difficulty: u32,
    /// Serializes writers of the UTXO cache
    index_lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: LedgerTransaction> Blockchain<T> {
    /// Create a new chain whose genesis block holds `coinbase`.
    ///
    /// Fails with [`BlockchainError::AlreadyExists`] if a chain is already
    /// stored at the configured location.
    pub fn create(config: &ChainConfig, coinbase: T) -> Result<Self, BlockchainError> {
        pow::target(config.difficulty)?;
        if !coinbase.is_coinbase() {
            return Err(BlockchainError::InvalidTransaction(
                "genesis block needs a coinbase transaction".to_string(),
            ));
        }

        let path = config.storage.ledger_path();
        let store = BlockStore::open(&path)?;
        if store.tip()?.is_some() {
            return Err(BlockchainError::AlreadyExists(path));
        }

        let mut genesis = Block::new(None, 0, vec![coinbase]);
        let solution = ProofOfWork::new(&genesis, config.difficulty)?.run(|| false)?;
        genesis.nonce = solution.nonce;
        genesis.hash = solution.hash;

        let mut batch = store.batch();
        batch.put_block(&genesis.hash, &serde_json::to_vec(&genesis).map_err(StorageError::from)?)?;
        batch.set_tip(&genesis.hash)?;
        batch.set_difficulty(config.difficulty)?;
        batch.commit()?;

        log::info!(
            "Created blockchain at {:?} with genesis {} (difficulty {})",
            path,
            short_hex(&genesis.hash),
            config.difficulty
        );

        Ok(Self::with_store(store, genesis.hash, config.difficulty))
    }

    /// Open an existing chain.
    ///
    /// Fails with [`BlockchainError::NotFound`] if no chain is stored at the
    /// configured location. The difficulty recorded at creation wins over
    /// the configured one.
    pub fn open(config: &ChainConfig) -> Result<Self, BlockchainError> {
        let path = config.storage.ledger_path();
        if !BlockStore::exists(&path) {
            return Err(BlockchainError::NotFound(format!("no blockchain at {:?}", path)));
        }

        let store = BlockStore::open(&path)?;
        let tip = store
            .tip()?
            .ok_or_else(|| BlockchainError::NotFound(format!("no blockchain at {:?}", path)))?;

        let difficulty = match store.difficulty()? {
            Some(stored) => {
                if stored != config.difficulty {
                    log::warn!(
                        "Chain was created with difficulty {}, ignoring configured {}",
                        stored,
                        config.difficulty
                    );
                }
                stored
            }
            None => config.difficulty,
        };
        pow::target(difficulty)?;

        log::info!("Opened blockchain at {:?}, tip {}", path, short_hex(&tip));

        Ok(Self::with_store(store, tip, difficulty))
    }

    fn with_store(store: BlockStore, tip: Hash, difficulty: u32) -> Self {
        Self {
            store,
            tip: RwLock::new(tip),
            tip_epoch: AtomicU64::new(0),
            difficulty,
            index_lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    /// Hash of the current tip
    pub fn tip(&self) -> Hash {
        *self.tip.read()
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub(crate) fn store(&self) -> &BlockStore {
        &self.store
    }

    pub(crate) fn index_lock(&self) -> MutexGuard<'_, ()> {
        self.index_lock.lock()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Blocks from the current tip back to genesis, one store read per step
    pub fn iter(&self) -> BlockchainIterator<'_, T> {
        self.iter_from(self.tip())
    }

    /// Blocks from `hash` back to genesis
    pub fn iter_from(&self, hash: Hash) -> BlockchainIterator<'_, T> {
        BlockchainIterator {
            chain: self,
            current: Some(hash),
        }
    }

    /// Get a block by hash
    pub fn get_block(&self, hash: &Hash) -> Result<Block<T>, BlockchainError> {
        let bytes = self
            .store
            .get(hash)?
            .ok_or_else(|| BlockchainError::NotFound(format!("block {}", hex::encode(hash))))?;
        Ok(serde_json::from_slice(&bytes).map_err(StorageError::from)?)
    }

    /// Height of the block at the tip
    pub fn best_height(&self) -> Result<u64, BlockchainError> {
        Ok(self.get_block(&self.tip())?.height)
    }

    /// Block hashes from tip to genesis
    pub fn block_hashes(&self) -> Result<Vec<Hash>, BlockchainError> {
        self.iter().map(|block| block.map(|b| b.hash)).collect()
    }

    /// Find a transaction on the active chain by id (linear scan from the tip)
    pub fn find_transaction(&self, id: &TxId) -> Result<T, BlockchainError> {
        for block in self.iter() {
            if let Some(tx) = block?.transaction(id) {
                return Ok(tx.clone());
            }
        }
        Err(BlockchainError::NotFound(format!("transaction {}", hex::encode(id))))
    }

    /// Resolve every transaction referenced by `tx`'s inputs
    fn previous_transactions(&self, tx: &T) -> Result<HashMap<TxId, T>, BlockchainError> {
        let mut prev_txs = HashMap::new();
        for input in tx.inputs() {
            let txid = input.outpoint().txid;
            if prev_txs.contains_key(&txid) {
                continue;
            }
            let prev = self.find_transaction(&txid).map_err(|e| match e {
                BlockchainError::NotFound(_) => BlockchainError::InvalidTransaction(format!(
                    "referenced transaction {} is not on the chain",
                    hex::encode(txid)
                )),
                other => other,
            })?;
            prev_txs.insert(txid, prev);
        }
        Ok(prev_txs)
    }

    /// Sign `tx` with `key_pair` against the transactions it spends
    pub fn sign_transaction(&self, tx: &mut T, key_pair: &KeyPair) -> Result<(), BlockchainError> {
        if tx.is_coinbase() {
            return Ok(());
        }
        let prev_txs = self.previous_transactions(tx)?;
        tx.sign(key_pair, &prev_txs)
            .map_err(|e| BlockchainError::InvalidTransaction(e.to_string()))
    }

    /// Verify `tx` against the transactions it spends. A coinbase only needs
    /// an id matching its contents.
    pub fn verify_transaction(&self, tx: &T) -> Result<bool, BlockchainError> {
        if !tx.has_consistent_id() {
            return Ok(false);
        }
        if tx.is_coinbase() {
            return Ok(true);
        }
        let prev_txs = self.previous_transactions(tx)?;
        tx.verify(&prev_txs)
            .map_err(|e| BlockchainError::InvalidTransaction(e.to_string()))
    }

    /// Every unspent output reachable from the tip, keyed by transaction id
    /// and indexed by original output position.
    pub fn find_utxo(&self) -> Result<HashMap<TxId, TxOutputs<T::Output>>, BlockchainError> {
        let mut utxo: HashMap<TxId, TxOutputs<T::Output>> = HashMap::new();
        let mut spent: HashMap<TxId, HashSet<u32>> = HashMap::new();

        // Newest first, and back to front inside a block, so every input is
        // seen before the output it spends
        for block in self.iter() {
            let block = block?;
            for tx in block.transactions.iter().rev() {
                let txid = tx.id();
                let spent_here = spent.get(&txid);

                for (index, output) in tx.outputs().iter().enumerate() {
                    let index = index as u32;
                    if spent_here.is_some_and(|s| s.contains(&index)) {
                        continue;
                    }
                    utxo.entry(txid).or_default().outputs.insert(index, output.clone());
                }

                if !tx.is_coinbase() {
                    for input in tx.inputs() {
                        let outpoint = input.outpoint();
                        spent.entry(outpoint.txid).or_default().insert(outpoint.vout);
                    }
                }
            }
        }

        Ok(utxo)
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Check a block's proof of work and that its hash matches its contents
    pub fn validate_block(&self, block: &Block<T>) -> Result<(), BlockchainError> {
        let pow = ProofOfWork::new(block, self.difficulty)?;

        if pow.hash_with_nonce(block.nonce) != block.hash {
            return Err(BlockchainError::InvalidBlock(format!(
                "hash {} does not match block contents",
                short_hex(&block.hash)
            )));
        }
        if !pow.validate(block.nonce) {
            return Err(BlockchainError::InvalidBlock(format!(
                "hash {} does not meet the difficulty target",
                short_hex(&block.hash)
            )));
        }

        let mut seen = HashSet::with_capacity(block.transactions.len());
        for (index, tx) in block.transactions.iter().enumerate() {
            let problem = if !tx.has_consistent_id() {
                Some("id does not match its contents")
            } else if !seen.insert(tx.id()) {
                Some("appears twice")
            } else {
                coinbase_problem(index, tx)
            };
            if let Some(problem) = problem {
                return Err(BlockchainError::InvalidBlock(format!(
                    "block {}: transaction {} {}",
                    short_hex(&block.hash),
                    short_hex(&tx.id()),
                    problem
                )));
            }
        }

        Ok(())
    }

    /// Walk the active chain and re-check every block: proof of work, hash
    /// binding, parent links and contiguous heights ending at genesis.
    pub fn verify_chain(&self) -> Result<(), BlockchainError> {
        let mut expected_height: Option<u64> = None;
        let mut expected_hash = self.tip();

        for block in self.iter() {
            let block = block?;
            self.validate_block(&block)?;

            if block.hash != expected_hash {
                return Err(BlockchainError::InvalidBlock(format!(
                    "block stored under {} claims hash {}",
                    short_hex(&expected_hash),
                    short_hex(&block.hash)
                )));
            }
            if let Some(height) = expected_height {
                if block.height != height {
                    return Err(BlockchainError::InvalidBlock(format!(
                        "block {} has height {}, expected {}",
                        short_hex(&block.hash),
                        block.height,
                        height
                    )));
                }
            }

            match block.prev_hash {
                Some(prev_hash) => {
                    if block.height == 0 {
                        return Err(BlockchainError::InvalidBlock(
                            "height 0 block has a parent".to_string(),
                        ));
                    }
                    expected_hash = prev_hash;
                    expected_height = Some(block.height - 1);
                }
                None if block.height != 0 => {
                    return Err(BlockchainError::InvalidBlock(format!(
                        "parentless block {} at height {}",
                        short_hex(&block.hash),
                        block.height
                    )));
                }
                None => {}
            }
        }

        Ok(())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Verify the pending transactions, mine a block on the current tip and
    /// make it the new tip.
    pub fn mine_block(
        &self,
        transactions: Vec<T>,
        policy: RejectPolicy,
    ) -> Result<MinedBlock<T>, BlockchainError> {
        self.mine_block_with_cancel(transactions, policy, &AtomicBool::new(false))
    }

    /// [`Blockchain::mine_block`] with an external cancel flag, polled during
    /// the nonce search
    pub fn mine_block_with_cancel(
        &self,
        transactions: Vec<T>,
        policy: RejectPolicy,
        cancel: &AtomicBool,
    ) -> Result<MinedBlock<T>, BlockchainError> {
        let start = Instant::now();

        let mut accepted: Vec<T> = Vec::with_capacity(transactions.len());
        let mut rejected = Vec::new();
        let mut seen = HashSet::with_capacity(transactions.len());
        for tx in transactions {
            let structural = if seen.contains(&tx.id()) {
                Some("duplicate transaction")
            } else {
                coinbase_problem(accepted.len(), &tx)
            };
            let reason = match structural {
                Some(problem) => problem.to_string(),
                None => match self.verify_transaction(&tx) {
                    Ok(true) => {
                        seen.insert(tx.id());
                        accepted.push(tx);
                        continue;
                    }
                    Ok(false) => "verification failed".to_string(),
                    Err(BlockchainError::InvalidTransaction(reason)) => reason,
                    Err(e) => return Err(e),
                },
            };

            if policy == RejectPolicy::AbortBatch {
                return Err(BlockchainError::InvalidTransaction(format!(
                    "{}: {}",
                    hex::encode(tx.id()),
                    reason
                )));
            }
            log::warn!("Dropping transaction {}: {}", short_hex(&tx.id()), reason);
            rejected.push(tx.id());
        }

        let (parent, epoch) = {
            let tip = self.tip.read();
            (*tip, self.tip_epoch.load(Ordering::SeqCst))
        };
        let height = self.get_block(&parent)?.height + 1;

        let mut block = Block::new(Some(parent), height, accepted);
        log::info!(
            "Mining block {} with {} transaction(s), difficulty {}...",
            height,
            block.tx_count(),
            self.difficulty
        );

        let pow = ProofOfWork::new(&block, self.difficulty)?;
        let solution = pow
            .run(|| {
                cancel.load(Ordering::Relaxed) || self.tip_epoch.load(Ordering::Relaxed) != epoch
            })
            .map_err(|e| match e {
                PowError::Aborted(_) if cancel.load(Ordering::Relaxed) => {
                    BlockchainError::MiningCancelled
                }
                PowError::Aborted(_) => BlockchainError::StaleTip {
                    expected: hex::encode(parent),
                    actual: hex::encode(self.tip()),
                },
                other => other.into(),
            })?;
        block.nonce = solution.nonce;
        block.hash = solution.hash;

        {
            let mut tip = self.tip.write();
            if *tip != parent {
                return Err(BlockchainError::StaleTip {
                    expected: hex::encode(parent),
                    actual: hex::encode(*tip),
                });
            }

            let mut batch = self.store.batch();
            batch.put_block(&block.hash, &serde_json::to_vec(&block).map_err(StorageError::from)?)?;
            batch.set_tip(&block.hash)?;
            batch.commit()?;

            *tip = block.hash;
            self.tip_epoch.fetch_add(1, Ordering::SeqCst);
        }

        let stats = MiningStats::new(solution.attempts, start.elapsed().as_millis());
        log::info!(
            "Block {} mined: {} in {}ms ({} attempts, {:.2} H/s)",
            block.height,
            short_hex(&block.hash),
            stats.time_ms,
            stats.hash_attempts,
            stats.hash_rate
        );

        Ok(MinedBlock {
            block,
            rejected,
            stats,
            utxo_stale: false,
        })
    }

    /// Integrate a block obtained from elsewhere.
    ///
    /// The block's proof of work and hash binding are checked first, and a
    /// non-genesis block must extend a known parent at the next height.
    /// Accepting a stored block is a no-op. The tip moves only when the new
    /// block is strictly higher than the current tip.
    pub fn accept_block(&self, block: &Block<T>) -> Result<AcceptOutcome, BlockchainError> {
        self.validate_block(block)?;

        match &block.prev_hash {
            Some(prev_hash) => {
                let parent = self.get_block(prev_hash).map_err(|e| match e {
                    BlockchainError::NotFound(_) => BlockchainError::InvalidBlock(format!(
                        "parent {} of block {} is unknown",
                        short_hex(prev_hash),
                        short_hex(&block.hash)
                    )),
                    other => other,
                })?;
                if block.height != parent.height + 1 {
                    return Err(BlockchainError::InvalidBlock(format!(
                        "block {} has height {}, parent has {}",
                        short_hex(&block.hash),
                        block.height,
                        parent.height
                    )));
                }
            }
            None if block.height != 0 => {
                return Err(BlockchainError::InvalidBlock(format!(
                    "parentless block {} at height {}",
                    short_hex(&block.hash),
                    block.height
                )));
            }
            None => {}
        }

        let mut tip = self.tip.write();
        if self.store.contains(&block.hash)? {
            log::debug!("Block {} already known", short_hex(&block.hash));
            return Ok(AcceptOutcome::AlreadyKnown);
        }

        let bytes = serde_json::to_vec(block).map_err(StorageError::from)?;
        let tip_height = self.get_block(&tip)?.height;

        if block.height <= tip_height {
            self.store.put(&block.hash, &bytes)?;
            log::info!(
                "Stored side block {} at height {} (tip height {})",
                short_hex(&block.hash),
                block.height,
                tip_height
            );
            return Ok(AcceptOutcome::SideBranch);
        }

        let mut batch = self.store.batch();
        batch.put_block(&block.hash, &bytes)?;
        batch.set_tip(&block.hash)?;
        batch.commit()?;

        let outcome = if block.prev_hash == Some(*tip) {
            AcceptOutcome::NewTip
        } else {
            AcceptOutcome::Reorganized
        };
        *tip = block.hash;
        self.tip_epoch.fetch_add(1, Ordering::SeqCst);

        log::info!(
            "Tip advanced to {} at height {} ({:?})",
            short_hex(&block.hash),
            block.height,
            outcome
        );
        Ok(outcome)
    }
}

/// Why a transaction at `index` cannot stand there as a coinbase, if it is one.
/// Only the first transaction of a block may mint, and at most the block reward.
fn coinbase_problem<T: LedgerTransaction>(index: usize, tx: &T) -> Option<&'static str> {
    if !tx.is_coinbase() {
        return None;
    }
    if index != 0 {
        return Some("is a coinbase after the first position");
    }
    let minted = tx
        .outputs()
        .iter()
        .fold(0u64, |total, output| total.saturating_add(output.value()));
    (minted > BLOCK_REWARD).then_some("mints more than the block reward")
}

/// Lazy walk from a block back to genesis. Stops after the first error.
pub struct BlockchainIterator<'a, T: LedgerTransaction = Transaction> {
    chain: &'a Blockchain<T>,
    current: Option<Hash>,
}

impl<T: LedgerTransaction> Iterator for BlockchainIterator<'_, T> {
    type Item = Result<Block<T>, BlockchainError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current.take()?;
        match self.chain.get_block(&hash) {
            Ok(block) => {
                self.current = block.prev_hash;
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::TransactionBuilder;
    use crate::test_utils::{mine_empty, new_chain, spend, test_config, TEST_DIFFICULTY};
    use std::sync::Arc;

    #[test]
    fn test_create_genesis() {
        let owner = KeyPair::generate();
        let (_dir, chain) = new_chain(&owner);

        let genesis = chain.get_block(&chain.tip()).unwrap();
        assert!(genesis.is_genesis());
        assert_eq!(genesis.height, 0);
        assert_eq!(chain.best_height().unwrap(), 0);
        assert_eq!(chain.difficulty(), TEST_DIFFICULTY);
        chain.validate_block(&genesis).unwrap();
    }

    #[test]
    fn test_create_twice_fails() {
        let owner = KeyPair::generate();
        let temp_dir = tempfile::tempdir().unwrap();
        let config = test_config(temp_dir.path());
        let coinbase = || Transaction::coinbase(&owner.pub_key_hash(), BLOCK_REWARD, "");

        let chain = Blockchain::create(&config, coinbase()).unwrap();
        drop(chain);

        assert!(matches!(
            Blockchain::create(&config, coinbase()),
            Err(BlockchainError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_create_rejects_non_coinbase() {
        let temp_dir = tempfile::tempdir().unwrap();
        let tx = TransactionBuilder::new()
            .add_input([1u8; 32], 0, b"key")
            .add_output(1, &[2u8; 20])
            .build();
        assert!(matches!(
            Blockchain::create(&test_config(temp_dir.path()), tx),
            Err(BlockchainError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_open_missing_chain() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Blockchain::<Transaction>::open(&test_config(temp_dir.path())),
            Err(BlockchainError::NotFound(_))
        ));
    }

    #[test]
    fn test_open_restores_tip_and_difficulty() {
        let owner = KeyPair::generate();
        let temp_dir = tempfile::tempdir().unwrap();
        let config = test_config(temp_dir.path());
        let tip = {
            let chain = Blockchain::create(
                &config,
                Transaction::coinbase(&owner.pub_key_hash(), BLOCK_REWARD, ""),
            )
            .unwrap();
            mine_empty(&chain, &owner);
            chain.tip()
        };

        let reopened_config = ChainConfig {
            difficulty: TEST_DIFFICULTY + 4,
            ..config
        };
        let chain = Blockchain::<Transaction>::open(&reopened_config).unwrap();
        assert_eq!(chain.tip(), tip);
        assert_eq!(chain.difficulty(), TEST_DIFFICULTY);
        assert_eq!(chain.best_height().unwrap(), 1);
    }

    #[test]
    fn test_mined_blocks_validate_and_link() {
        let owner = KeyPair::generate();
        let (_dir, chain) = new_chain(&owner);
        for _ in 0..3 {
            let block = mine_empty(&chain, &owner);
            chain.validate_block(&block).unwrap();
            let pow = ProofOfWork::new(&block, chain.difficulty()).unwrap();
            assert!(pow.validate(block.nonce));
            assert_eq!(pow.hash_with_nonce(block.nonce), block.hash);
        }

        let heights: Vec<u64> = chain.iter().map(|b| b.unwrap().height).collect();
        assert_eq!(heights, vec![3, 2, 1, 0]);

        let last = chain.iter().last().unwrap().unwrap();
        assert!(last.prev_hash.is_none());
        assert_eq!(chain.block_hashes().unwrap().len(), 4);
        assert_eq!(chain.block_hashes().unwrap()[0], chain.tip());
        chain.verify_chain().unwrap();
    }

    #[test]
    fn test_find_transaction() {
        let owner = KeyPair::generate();
        let (_dir, chain) = new_chain(&owner);
        let block = mine_empty(&chain, &owner);
        let coinbase = &block.transactions[0];

        assert_eq!(chain.find_transaction(&coinbase.id).unwrap(), *coinbase);
        assert!(matches!(
            chain.find_transaction(&[0xee; 32]),
            Err(BlockchainError::NotFound(_))
        ));
    }

    #[test]
    fn test_get_missing_block() {
        let owner = KeyPair::generate();
        let (_dir, chain) = new_chain(&owner);
        assert!(matches!(
            chain.get_block(&[0xee; 32]),
            Err(BlockchainError::NotFound(_))
        ));
    }

    #[test]
    fn test_sign_and_verify_through_chain() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (_dir, chain) = new_chain(&alice);
        let genesis_tx = chain.get_block(&chain.tip()).unwrap().transactions[0].clone();

        let tx = spend(&chain, &alice, genesis_tx.id, 0, &[(30, &bob), (20, &alice)]);
        assert!(chain.verify_transaction(&tx).unwrap());

        let mut forged = tx.clone();
        forged.outputs[0].value = 50;
        assert!(!chain.verify_transaction(&forged).unwrap());
    }

    #[test]
    fn test_unresolvable_input_is_invalid_transaction() {
        let alice = KeyPair::generate();
        let (_dir, chain) = new_chain(&alice);
        let mut tx = TransactionBuilder::new()
            .add_input([0xab; 32], 0, &alice.public_key_bytes())
            .add_output(10, &alice.pub_key_hash())
            .build();

        assert!(matches!(
            chain.verify_transaction(&tx),
            Err(BlockchainError::InvalidTransaction(_))
        ));
        assert!(matches!(
            chain.sign_transaction(&mut tx, &alice),
            Err(BlockchainError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_mine_drops_invalid_transaction() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (_dir, chain) = new_chain(&alice);
        let genesis_tx = chain.get_block(&chain.tip()).unwrap().transactions[0].clone();

        let good = spend(&chain, &alice, genesis_tx.id, 0, &[(50, &bob)]);
        let mut bad = good.clone();
        bad.outputs[0].pub_key_hash = alice.pub_key_hash();

        let mined = chain
            .mine_block(vec![bad.clone(), good.clone()], RejectPolicy::DropInvalid)
            .unwrap();
        assert_eq!(mined.rejected, vec![bad.id]);
        assert_eq!(mined.block.transactions, vec![good]);
        assert_eq!(chain.tip(), mined.block.hash);
    }

    #[test]
    fn test_mine_abort_batch_leaves_tip() {
        let alice = KeyPair::generate();
        let (_dir, chain) = new_chain(&alice);
        let tip = chain.tip();
        let orphan_spend = TransactionBuilder::new()
            .add_input([0xab; 32], 0, &alice.public_key_bytes())
            .add_output(10, &alice.pub_key_hash())
            .build();

        assert!(matches!(
            chain.mine_block(vec![orphan_spend], RejectPolicy::AbortBatch),
            Err(BlockchainError::InvalidTransaction(_))
        ));
        assert_eq!(chain.tip(), tip);
    }

    #[test]
    fn test_mine_cancelled() {
        let owner = KeyPair::generate();
        let (_dir, chain) = new_chain(&owner);
        let tip = chain.tip();
        let cancel = AtomicBool::new(true);

        assert!(matches!(
            chain.mine_block_with_cancel(vec![], RejectPolicy::DropInvalid, &cancel),
            Err(BlockchainError::MiningCancelled)
        ));
        assert_eq!(chain.tip(), tip);
    }

    #[test]
    fn test_forged_id_is_refused() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (_dir, chain) = new_chain(&alice);
        let genesis_tx = chain.get_block(&chain.tip()).unwrap().transactions[0].clone();
        let tip = chain.tip();

        let mut forged = spend(&chain, &alice, genesis_tx.id, 0, &[(50, &bob)]);
        forged.id = [0x42; 32];
        assert!(!chain.verify_transaction(&forged).unwrap());
        assert!(matches!(
            chain.mine_block(vec![forged.clone()], RejectPolicy::AbortBatch),
            Err(BlockchainError::InvalidTransaction(_))
        ));
        assert_eq!(chain.tip(), tip);

        let mut coinbase = Transaction::coinbase(&bob.pub_key_hash(), BLOCK_REWARD, "");
        coinbase.id = [0x43; 32];
        assert!(!chain.verify_transaction(&coinbase).unwrap());

        let mined = chain
            .mine_block(vec![coinbase.clone(), forged.clone()], RejectPolicy::DropInvalid)
            .unwrap();
        assert_eq!(mined.rejected, vec![coinbase.id, forged.id]);
        assert!(mined.block.transactions.is_empty());
    }

    #[test]
    fn test_mine_screens_coinbase_placement_and_duplicates() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (_dir, chain) = new_chain(&alice);
        let genesis_tx = chain.get_block(&chain.tip()).unwrap().transactions[0].clone();

        let payment = spend(&chain, &alice, genesis_tx.id, 0, &[(50, &bob)]);
        let late_coinbase = Transaction::coinbase(&bob.pub_key_hash(), BLOCK_REWARD, "");
        let mined = chain
            .mine_block(
                vec![payment.clone(), payment.clone(), late_coinbase.clone()],
                RejectPolicy::DropInvalid,
            )
            .unwrap();
        assert_eq!(mined.rejected, vec![payment.id, late_coinbase.id]);
        assert_eq!(mined.block.transactions, vec![payment]);

        let reward = Transaction::coinbase(&alice.pub_key_hash(), BLOCK_REWARD, "");
        let second = Transaction::coinbase(&bob.pub_key_hash(), BLOCK_REWARD, "");
        let mined = chain
            .mine_block(vec![reward.clone(), second.clone()], RejectPolicy::DropInvalid)
            .unwrap();
        assert_eq!(mined.rejected, vec![second.id]);
        assert_eq!(mined.block.transactions, vec![reward]);

        let inflated = Transaction::coinbase(&alice.pub_key_hash(), BLOCK_REWARD + 1, "");
        assert!(matches!(
            chain.mine_block(vec![inflated], RejectPolicy::AbortBatch),
            Err(BlockchainError::InvalidTransaction(_))
        ));
        chain.verify_chain().unwrap();
    }

    /// Mine a block on `parent` without touching the chain's tip
    fn mine_detached(chain: &Blockchain, parent: &Block, owner: &KeyPair, memo: &str) -> Block {
        let coinbase = Transaction::coinbase(&owner.pub_key_hash(), BLOCK_REWARD, memo);
        solve_on(chain, parent, vec![coinbase])
    }

    /// Solve a block holding exactly `transactions` on top of `parent`
    fn solve_on(chain: &Blockchain, parent: &Block, transactions: Vec<Transaction>) -> Block {
        let mut block = Block::new(Some(parent.hash), parent.height + 1, transactions);
        let solution = ProofOfWork::new(&block, chain.difficulty())
            .unwrap()
            .run(|| false)
            .unwrap();
        block.nonce = solution.nonce;
        block.hash = solution.hash;
        block
    }

    #[test]
    fn test_accept_block_is_idempotent() {
        let owner = KeyPair::generate();
        let (_dir, chain) = new_chain(&owner);
        let genesis = chain.get_block(&chain.tip()).unwrap();
        let block = mine_detached(&chain, &genesis, &owner, "a");

        assert_eq!(chain.accept_block(&block).unwrap(), AcceptOutcome::NewTip);
        let tip = chain.tip();
        assert_eq!(chain.accept_block(&block).unwrap(), AcceptOutcome::AlreadyKnown);
        assert_eq!(chain.tip(), tip);
        assert_eq!(chain.block_hashes().unwrap().len(), 2);
    }

    #[test]
    fn test_competing_blocks_first_wins() {
        let owner = KeyPair::generate();
        let (_dir, chain) = new_chain(&owner);
        let genesis = chain.get_block(&chain.tip()).unwrap();
        let first = mine_detached(&chain, &genesis, &owner, "first");
        let second = mine_detached(&chain, &genesis, &owner, "second");

        assert_eq!(chain.accept_block(&first).unwrap(), AcceptOutcome::NewTip);
        assert_eq!(chain.accept_block(&second).unwrap(), AcceptOutcome::SideBranch);

        assert_eq!(chain.tip(), first.hash);
        assert_eq!(chain.get_block(&second.hash).unwrap(), second);
    }

    #[test]
    fn test_lower_block_does_not_move_tip() {
        let owner = KeyPair::generate();
        let (_dir, chain) = new_chain(&owner);
        let genesis = chain.get_block(&chain.tip()).unwrap();
        mine_empty(&chain, &owner);
        mine_empty(&chain, &owner);
        let tip = chain.tip();

        let low = mine_detached(&chain, &genesis, &owner, "low");
        assert_eq!(chain.accept_block(&low).unwrap(), AcceptOutcome::SideBranch);
        assert_eq!(chain.tip(), tip);
    }

    #[test]
    fn test_longer_branch_reorganizes() {
        let owner = KeyPair::generate();
        let (_dir, chain) = new_chain(&owner);
        let genesis = chain.get_block(&chain.tip()).unwrap();
        mine_empty(&chain, &owner);

        let side1 = mine_detached(&chain, &genesis, &owner, "side1");
        let side2 = mine_detached(&chain, &side1, &owner, "side2");
        assert_eq!(chain.accept_block(&side1).unwrap(), AcceptOutcome::SideBranch);
        assert_eq!(chain.accept_block(&side2).unwrap(), AcceptOutcome::Reorganized);

        assert_eq!(chain.tip(), side2.hash);
        assert_eq!(
            chain.block_hashes().unwrap(),
            vec![side2.hash, side1.hash, genesis.hash]
        );
    }

    #[test]
    fn test_accept_rejects_bad_pow_and_binding() {
        let owner = KeyPair::generate();
        let (_dir, chain) = new_chain(&owner);
        let genesis = chain.get_block(&chain.tip()).unwrap();
        let block = mine_detached(&chain, &genesis, &owner, "x");

        let mut tampered = block.clone();
        tampered.transactions[0].outputs[0].value = 1_000;
        assert!(matches!(
            chain.accept_block(&tampered),
            Err(BlockchainError::InvalidBlock(_))
        ));

        let mut wrong_nonce = block.clone();
        wrong_nonce.nonce += 1;
        assert!(matches!(
            chain.accept_block(&wrong_nonce),
            Err(BlockchainError::InvalidBlock(_))
        ));

        assert!(!chain.store().contains(&block.hash).unwrap());
        assert_eq!(chain.tip(), genesis.hash);
    }

    #[test]
    fn test_accept_rejects_forged_transaction_id() {
        let owner = KeyPair::generate();
        let (_dir, chain) = new_chain(&owner);
        let genesis = chain.get_block(&chain.tip()).unwrap();

        let mut coinbase = Transaction::coinbase(&owner.pub_key_hash(), BLOCK_REWARD, "");
        coinbase.id = [0x42; 32];
        let block = solve_on(&chain, &genesis, vec![coinbase]);

        assert!(matches!(
            chain.accept_block(&block),
            Err(BlockchainError::InvalidBlock(_))
        ));
        assert!(!chain.store().contains(&block.hash).unwrap());
    }

    #[test]
    fn test_accept_rejects_repeated_transaction() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (_dir, chain) = new_chain(&alice);
        let genesis_tx = chain.get_block(&chain.tip()).unwrap().transactions[0].clone();
        let parent = mine_empty(&chain, &alice);

        let first = spend(&chain, &alice, genesis_tx.id, 0, &[(50, &bob)]);
        let second = spend(&chain, &alice, parent.transactions[0].id, 0, &[(50, &bob)]);
        let reward = Transaction::coinbase(&alice.pub_key_hash(), BLOCK_REWARD, "");
        let honest = solve_on(&chain, &parent, vec![reward, first, second]);

        // An odd leaf is paired with itself, so repeating the last
        // transaction leaves the content hash unchanged
        let mut mutated = honest.clone();
        mutated.transactions.push(honest.transactions[2].clone());
        let pow = ProofOfWork::new(&mutated, chain.difficulty()).unwrap();
        assert_eq!(pow.hash_with_nonce(mutated.nonce), honest.hash);

        assert!(matches!(
            chain.accept_block(&mutated),
            Err(BlockchainError::InvalidBlock(_))
        ));
        assert!(!chain.store().contains(&honest.hash).unwrap());
        assert_eq!(chain.accept_block(&honest).unwrap(), AcceptOutcome::NewTip);
        assert_eq!(chain.get_block(&honest.hash).unwrap(), honest);
    }

    #[test]
    fn test_accept_rejects_misplaced_or_inflated_coinbase() {
        let owner = KeyPair::generate();
        let (_dir, chain) = new_chain(&owner);
        let genesis = chain.get_block(&chain.tip()).unwrap();
        let reward = || Transaction::coinbase(&owner.pub_key_hash(), BLOCK_REWARD, "");

        let doubled = solve_on(&chain, &genesis, vec![reward(), reward()]);
        assert!(matches!(
            chain.accept_block(&doubled),
            Err(BlockchainError::InvalidBlock(_))
        ));

        let inflated = Transaction::coinbase(&owner.pub_key_hash(), BLOCK_REWARD * 2, "");
        let greedy = solve_on(&chain, &genesis, vec![inflated]);
        assert!(matches!(
            chain.accept_block(&greedy),
            Err(BlockchainError::InvalidBlock(_))
        ));
        assert_eq!(chain.tip(), genesis.hash);
    }

    #[test]
    fn test_accept_rejects_unmet_target() {
        let owner = KeyPair::generate();
        let (_dir, chain) = new_chain(&owner);
        let genesis = chain.get_block(&chain.tip()).unwrap();

        // Correctly bound hash that misses the target
        let mut block = Block::new(
            Some(genesis.hash),
            1,
            vec![Transaction::coinbase(&owner.pub_key_hash(), BLOCK_REWARD, "")],
        );
        let pow = ProofOfWork::new(&block, chain.difficulty()).unwrap();
        let nonce = (0..).find(|n| !pow.validate(*n)).unwrap();
        block.nonce = nonce;
        block.hash = pow.hash_with_nonce(nonce);

        assert!(matches!(
            chain.accept_block(&block),
            Err(BlockchainError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_accept_rejects_orphan_and_bad_height() {
        let owner = KeyPair::generate();
        let (_dir, chain) = new_chain(&owner);
        let genesis = chain.get_block(&chain.tip()).unwrap();

        let mut fake_parent = genesis.clone();
        fake_parent.hash = [0x11; 32];
        let orphan = mine_detached(&chain, &fake_parent, &owner, "orphan");
        assert!(matches!(
            chain.accept_block(&orphan),
            Err(BlockchainError::InvalidBlock(_))
        ));

        let mut skipping = genesis.clone();
        skipping.height = 5;
        let bad_height = mine_detached(&chain, &skipping, &owner, "skip");
        assert!(matches!(
            chain.accept_block(&bad_height),
            Err(BlockchainError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_find_utxo_tracks_spends() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (_dir, chain) = new_chain(&alice);
        let genesis_tx = chain.get_block(&chain.tip()).unwrap().transactions[0].clone();

        let tx = spend(&chain, &alice, genesis_tx.id, 0, &[(30, &bob), (20, &alice)]);
        chain.mine_block(vec![tx.clone()], RejectPolicy::AbortBatch).unwrap();

        let utxo = chain.find_utxo().unwrap();
        assert!(!utxo.contains_key(&genesis_tx.id));
        let outs = &utxo[&tx.id].outputs;
        assert_eq!(outs.len(), 2);
        assert_eq!(outs[&0].value, 30);
        assert_eq!(outs[&1].value, 20);
    }

    #[test]
    fn test_concurrent_miners_never_fork_the_tip() {
        let owner = KeyPair::generate();
        let (_dir, chain) = new_chain(&owner);
        let chain = Arc::new(chain);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let chain = Arc::clone(&chain);
                let key_hash = owner.pub_key_hash();
                std::thread::spawn(move || {
                    let coinbase = Transaction::coinbase(&key_hash, BLOCK_REWARD, "");
                    chain.mine_block(vec![coinbase], RejectPolicy::DropInvalid)
                })
            })
            .collect();

        let mut mined = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(_) => mined += 1,
                Err(BlockchainError::StaleTip { .. }) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert!(mined >= 1);
        assert_eq!(chain.best_height().unwrap(), mined);
        chain.verify_chain().unwrap();
    }
}

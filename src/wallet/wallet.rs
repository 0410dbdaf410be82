//! Wallet implementation for the ledger
//!
//! Holds a key pair in memory and builds signed transfers from the UTXO set.
//! Nothing is written to disk.

use crate::core::blockchain::BlockchainError;
use crate::core::transaction::{Transaction, TransactionBuilder, TransactionError, TxId};
use crate::crypto::{address_to_pub_key_hash, KeyError, KeyPair};
use crate::storage::utxo_set::UtxoSet;
use thiserror::Error;

/// Wallet-related errors
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("Amount must be positive")]
    InvalidAmount,
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),
    #[error("Chain error: {0}")]
    ChainError(#[from] BlockchainError),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] KeyError),
}

/// A wallet holding one key pair
pub struct Wallet {
    key_pair: KeyPair,
}

impl Wallet {
    /// Create a new wallet with a fresh key pair
    pub fn new() -> Self {
        Self {
            key_pair: KeyPair::generate(),
        }
    }

    /// Import a wallet from a private key
    pub fn from_private_key(private_key_hex: &str) -> Result<Self, WalletError> {
        let key_pair = KeyPair::from_private_key_hex(private_key_hex)?;
        Ok(Self { key_pair })
    }

    /// Get the wallet's address
    pub fn address(&self) -> String {
        self.key_pair.address()
    }

    /// Locking key hash of this wallet's outputs
    pub fn pub_key_hash(&self) -> Vec<u8> {
        self.key_pair.pub_key_hash()
    }

    /// Get the wallet's private key (hex)
    /// WARNING: Keep this secret!
    pub fn private_key(&self) -> String {
        self.key_pair.private_key_hex()
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    /// Get the balance from the UTXO set
    pub fn balance(&self, utxo_set: &UtxoSet<'_>) -> Result<u64, WalletError> {
        Ok(utxo_set.balance(&self.pub_key_hash())?)
    }

    /// Build and sign a transfer of `amount` to the owner of `to_pub_key_hash`.
    /// Any excess over `amount` comes back as a change output.
    pub fn create_transaction(
        &self,
        to_pub_key_hash: &[u8],
        amount: u64,
        utxo_set: &UtxoSet<'_>,
    ) -> Result<Transaction, WalletError> {
        if amount == 0 {
            return Err(WalletError::InvalidAmount);
        }

        let own_key_hash = self.pub_key_hash();
        let (accumulated, spendable) = utxo_set.find_spendable_outputs(&own_key_hash, amount)?;

        if accumulated < amount {
            return Err(WalletError::InsufficientFunds {
                have: accumulated,
                need: amount,
            });
        }

        // Deterministic input order
        let mut outpoints: Vec<(TxId, u32)> = spendable
            .into_iter()
            .flat_map(|(txid, indices)| indices.into_iter().map(move |vout| (txid, vout)))
            .collect();
        outpoints.sort_unstable();

        let public_key = self.key_pair.public_key_bytes();
        let mut builder = TransactionBuilder::new();
        for (txid, vout) in outpoints {
            builder = builder.add_input(txid, vout, &public_key);
        }

        builder = builder.add_output(amount, to_pub_key_hash);

        let change = accumulated - amount;
        if change > 0 {
            builder = builder.add_output(change, &own_key_hash);
        }

        let mut tx = builder.build();
        utxo_set
            .blockchain()
            .sign_transaction(&mut tx, &self.key_pair)?;
        Ok(tx)
    }

    /// [`Wallet::create_transaction`] to a Base58Check address
    pub fn send_to_address(
        &self,
        address: &str,
        amount: u64,
        utxo_set: &UtxoSet<'_>,
    ) -> Result<Transaction, WalletError> {
        let to_pub_key_hash = address_to_pub_key_hash(address)?;
        self.create_transaction(&to_pub_key_hash, amount, utxo_set)
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::blockchain::RejectPolicy;
    use crate::core::transaction::LedgerTransaction;
    use crate::mining::Miner;
    use crate::test_utils::new_chain;

    #[test]
    fn test_wallet_creation() {
        let wallet = Wallet::new();
        assert!(!wallet.address().is_empty());
        assert_eq!(wallet.pub_key_hash().len(), 20);
        assert!(!wallet.private_key().is_empty());
    }

    #[test]
    fn test_wallet_import() {
        let wallet1 = Wallet::new();
        let private_key = wallet1.private_key();

        let wallet2 = Wallet::from_private_key(&private_key).unwrap();
        assert_eq!(wallet1.address(), wallet2.address());
        assert!(Wallet::from_private_key("not hex").is_err());
    }

    #[test]
    fn test_transaction_creation() {
        let wallet = Wallet::new();
        let recipient = Wallet::new();
        let (_dir, chain) = new_chain(wallet.key_pair());
        let utxo_set = UtxoSet::new(&chain);
        utxo_set.reindex().unwrap();

        Miner::new(&wallet.pub_key_hash())
            .mine_block(&utxo_set, vec![])
            .unwrap();
        assert_eq!(wallet.balance(&utxo_set).unwrap(), 100);

        let tx = wallet
            .create_transaction(&recipient.pub_key_hash(), 70, &utxo_set)
            .unwrap();

        assert_eq!(tx.inputs.len(), 2);
        assert_eq!(tx.outputs[0].value, 70);
        assert_eq!(tx.outputs[1].value, 30);
        assert_eq!(tx.outputs[1].pub_key_hash, wallet.pub_key_hash());
        assert!(chain.verify_transaction(&tx).unwrap());

        let mined = chain.mine_block(vec![tx], RejectPolicy::AbortBatch).unwrap();
        utxo_set.update(&mined.block).unwrap();
        assert_eq!(wallet.balance(&utxo_set).unwrap(), 30);
        assert_eq!(recipient.balance(&utxo_set).unwrap(), 70);
    }

    #[test]
    fn test_exact_amount_has_no_change() {
        let wallet = Wallet::new();
        let recipient = Wallet::new();
        let (_dir, chain) = new_chain(wallet.key_pair());
        let utxo_set = UtxoSet::new(&chain);
        utxo_set.reindex().unwrap();

        let tx = wallet
            .send_to_address(&recipient.address(), 50, &utxo_set)
            .unwrap();
        assert_eq!(tx.outputs.len(), 1);
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn test_insufficient_funds() {
        let wallet = Wallet::new();
        let (_dir, chain) = new_chain(wallet.key_pair());
        let utxo_set = UtxoSet::new(&chain);
        utxo_set.reindex().unwrap();

        let result = wallet.create_transaction(&[9u8; 20], 51, &utxo_set);
        assert!(matches!(
            result,
            Err(WalletError::InsufficientFunds { have: 50, need: 51 })
        ));
        assert!(matches!(
            wallet.create_transaction(&[9u8; 20], 0, &utxo_set),
            Err(WalletError::InvalidAmount)
        ));
    }
}

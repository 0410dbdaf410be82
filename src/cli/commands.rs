//! CLI commands for the ledger
//!
//! Implements all command handlers for the CLI interface. Each command opens
//! the node's ledger, does its work and drops it again.

use crate::core::{
    Blockchain, ChainConfig, LedgerTransaction, Transaction, BLOCK_REWARD, GENESIS_COINBASE_MEMO,
};
use crate::crypto::{address_to_pub_key_hash, short_hex, validate_address, KeyPair};
use crate::mining::Miner;
use crate::storage::UtxoSet;
use crate::wallet::Wallet;
use chrono::{TimeZone, Utc};

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn parse_address(address: &str) -> CliResult<Vec<u8>> {
    if !validate_address(address) {
        return Err(format!("invalid address: {}", address).into());
    }
    Ok(address_to_pub_key_hash(address)?)
}

/// Create a new ledger whose genesis reward goes to `address`
pub fn cmd_create_blockchain(config: &ChainConfig, address: &str) -> CliResult<()> {
    let pub_key_hash = parse_address(address)?;
    let coinbase = Transaction::coinbase(&pub_key_hash, BLOCK_REWARD, GENESIS_COINBASE_MEMO);

    let blockchain = Blockchain::create(config, coinbase)?;
    let utxo_set = UtxoSet::new(&blockchain);
    utxo_set.reindex()?;

    println!("✅ Blockchain created!");
    println!("   📁 Data directory: {:?}", config.storage.ledger_path());
    println!("   🔧 Difficulty: {}", blockchain.difficulty());
    println!("   🧱 Genesis block hash: {}", hex::encode(blockchain.tip()));

    Ok(())
}

/// Print every block from the tip back to genesis
pub fn cmd_print_chain(config: &ChainConfig) -> CliResult<()> {
    let blockchain = Blockchain::<Transaction>::open(config)?;

    for block in blockchain.iter() {
        let block = block?;
        let time = Utc
            .timestamp_opt(block.timestamp, 0)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| block.timestamp.to_string());

        println!("============ Block {} ============", hex::encode(block.hash));
        println!("Height: {}", block.height);
        println!(
            "Prev. block: {}",
            block.prev_hash.map(hex::encode).unwrap_or_default()
        );
        println!("Time: {}", time);
        println!("Nonce: {}", block.nonce);
        for tx in &block.transactions {
            let kind = if tx.is_coinbase() { "coinbase" } else { "transfer" };
            println!(
                "  └─ {} ({}, {} in / {} out, {} coins)",
                short_hex(&tx.id),
                kind,
                tx.inputs.len(),
                tx.outputs.len(),
                tx.total_output()
                    .map_or_else(|| "overflowing".to_string(), |total| total.to_string())
            );
        }
        println!();
    }

    Ok(())
}

/// Show the balance of `address`
pub fn cmd_get_balance(config: &ChainConfig, address: &str) -> CliResult<()> {
    let pub_key_hash = parse_address(address)?;
    let blockchain = Blockchain::<Transaction>::open(config)?;
    let utxo_set = UtxoSet::new(&blockchain);

    let outputs = utxo_set.find_unspent_outputs_for(&pub_key_hash)?;
    let balance = outputs
        .iter()
        .fold(0u64, |total, output| total.saturating_add(output.value));

    println!("💰 Balance of {}: {} coins", address, balance);
    println!("   UTXOs: {}", outputs.len());

    Ok(())
}

/// Send `amount` from the wallet of `from_key` to `to`, mining the transfer
/// into a block right away
pub fn cmd_send(config: &ChainConfig, from_key: &str, to: &str, amount: u64) -> CliResult<()> {
    let to_pub_key_hash = parse_address(to)?;
    let wallet = Wallet::from_private_key(from_key)?;

    let blockchain = Blockchain::<Transaction>::open(config)?;
    let utxo_set = UtxoSet::new(&blockchain);

    let tx = wallet.create_transaction(&to_pub_key_hash, amount, &utxo_set)?;
    let tx_id = tx.id;

    // The sender mines the block and takes the reward
    let miner = Miner::new(&wallet.pub_key_hash());
    let mined = miner.mine_block(&utxo_set, vec![tx])?;

    if mined.rejected.contains(&tx_id) {
        return Err(format!("transaction {} was rejected", hex::encode(tx_id)).into());
    }
    if mined.utxo_stale {
        println!("⚠️  The UTXO set missed this block. Run `ledger reindex-utxo` before the next send.");
    }

    println!("📤 Sent {} coins", amount);
    println!("   From: {}", wallet.address());
    println!("   To: {}", to);
    println!("   ID: {}", hex::encode(tx_id));
    println!("\n   Block {} mined!", mined.block.height);
    println!("   ├─ Hash: {}", short_hex(&mined.block.hash));
    println!("   ├─ Time: {}ms", mined.stats.time_ms);
    println!("   ├─ Attempts: {}", mined.stats.hash_attempts);
    println!("   └─ Hash rate: {:.2} H/s", mined.stats.hash_rate);

    Ok(())
}

/// Rebuild the UTXO set from the chain
pub fn cmd_reindex_utxo(config: &ChainConfig) -> CliResult<()> {
    let blockchain = Blockchain::<Transaction>::open(config)?;
    let utxo_set = UtxoSet::new(&blockchain);

    let count = utxo_set.reindex()?;
    println!("🔄 Done! There are {} transactions in the UTXO set.", count);

    Ok(())
}

/// Re-check every block on the chain
pub fn cmd_verify_chain(config: &ChainConfig) -> CliResult<()> {
    let blockchain = Blockchain::<Transaction>::open(config)?;

    println!("🔍 Validating blockchain...");
    match blockchain.verify_chain() {
        Ok(()) => {
            println!("✅ Blockchain is valid!");
            println!("   {} blocks verified", blockchain.best_height()? + 1);
            Ok(())
        }
        Err(e) => {
            println!("❌ Blockchain validation FAILED!");
            Err(e.into())
        }
    }
}

/// Print a fresh key pair. Nothing is stored.
pub fn cmd_new_key() -> CliResult<()> {
    let key_pair = KeyPair::generate();

    println!("🔐 New key pair");
    println!("   📍 Address: {}", key_pair.address());
    println!("   🔑 Private key: {}", key_pair.private_key_hex());
    println!("\n   ⚠️  The private key is not saved anywhere. Keep it safe!");

    Ok(())
}

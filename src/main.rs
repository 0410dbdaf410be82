//! Mini-Ledger CLI Application
//!
//! A command-line interface for a single node's ledger.

use clap::{Parser, Subcommand};
use mini_ledger::cli;
use mini_ledger::core::ChainConfig;
use mini_ledger::mining::DEFAULT_DIFFICULTY;
use mini_ledger::storage::StorageConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ledger")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "A proof-of-work ledger with a UTXO index", long_about = None)]
struct Cli {
    /// Data directory for ledger storage
    #[arg(short, long, default_value = ".ledger_data")]
    data_dir: PathBuf,

    /// Node identity; each node keeps its own ledger
    #[arg(short, long, env = "NODE_ID", default_value = "3000")]
    node_id: String,

    /// Mining difficulty (number of leading zero bits) for new chains
    #[arg(long, default_value_t = DEFAULT_DIFFICULTY)]
    difficulty: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a blockchain and send the genesis reward to an address
    CreateBlockchain {
        /// Address receiving the genesis reward
        #[arg(short, long)]
        address: String,
    },

    /// Print all blocks from the tip back to genesis
    PrintChain,

    /// Show the balance of an address
    GetBalance {
        /// Address to query
        #[arg(short, long)]
        address: String,
    },

    /// Send coins and mine the transfer into a new block
    Send {
        /// Sender's private key (hex)
        #[arg(short, long)]
        from_key: String,

        /// Recipient's address
        #[arg(short, long)]
        to: String,

        /// Amount to send
        #[arg(short, long)]
        amount: u64,
    },

    /// Rebuild the UTXO set from the chain
    ReindexUtxo,

    /// Validate every block on the chain
    VerifyChain,

    /// Generate a new key pair and print its address
    NewKey,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = ChainConfig {
        storage: StorageConfig {
            data_dir: cli.data_dir,
            node_id: cli.node_id,
        },
        difficulty: cli.difficulty,
    };

    match cli.command {
        Commands::CreateBlockchain { address } => {
            cli::cmd_create_blockchain(&config, &address)?;
        }
        Commands::PrintChain => {
            cli::cmd_print_chain(&config)?;
        }
        Commands::GetBalance { address } => {
            cli::cmd_get_balance(&config, &address)?;
        }
        Commands::Send {
            from_key,
            to,
            amount,
        } => {
            cli::cmd_send(&config, &from_key, &to, amount)?;
        }
        Commands::ReindexUtxo => {
            cli::cmd_reindex_utxo(&config)?;
        }
        Commands::VerifyChain => {
            cli::cmd_verify_chain(&config)?;
        }
        Commands::NewKey => {
            cli::cmd_new_key()?;
        }
    }

    Ok(())
}

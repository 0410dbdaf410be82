//! Mining module: the proof-of-work puzzle and block reward orchestration

pub mod miner;
pub mod pow;

pub use miner::{Miner, MiningStats};
pub use pow::{ProofOfWork, PowError, Solution, DEFAULT_DIFFICULTY, MAX_DIFFICULTY};

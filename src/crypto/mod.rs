//! Cryptographic utilities for the ledger
//!
//! This module provides:
//! - SHA-256 hashing and public-key hashing
//! - ECDSA key management (secp256k1) and Base58Check addresses
//! - Merkle root calculation

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{double_sha256, hash160, sha256, sha256_hex, short_hex, Hash};
pub use keys::{
    address_to_pub_key_hash, pub_key_hash_to_address, public_key_from_bytes, sign_message,
    validate_address, verify_signature, KeyError, KeyPair,
};
pub use merkle::calculate_merkle_root;

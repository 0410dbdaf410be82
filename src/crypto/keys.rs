//! ECDSA key management for the ledger
//!
//! Key pairs, signing and verification on secp256k1, plus the Base58Check
//! address encoding used by the command line front end.

use rand::rngs::OsRng;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use super::hash::{double_sha256, hash160, sha256};

/// Address version byte
pub const ADDRESS_VERSION: u8 = 0x00;

/// Number of checksum bytes appended to an address payload
pub const ADDRESS_CHECKSUM_LEN: usize = 4;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Get the private key as a hex string
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Serialized (compressed) public key
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }

    /// Locking key hash outputs paid to this key are restricted to
    pub fn pub_key_hash(&self) -> Vec<u8> {
        hash160(&self.public_key.serialize())
    }

    /// Base58Check address of this key
    pub fn address(&self) -> String {
        pub_key_hash_to_address(&self.pub_key_hash())
    }

    /// Sign a message hash with the private key
    pub fn sign(&self, message_hash: &[u8]) -> Result<Vec<u8>, KeyError> {
        sign_message(&self.secret_key, message_hash)
    }
}

/// Encode a locking key hash as a Base58Check address
pub fn pub_key_hash_to_address(pub_key_hash: &[u8]) -> String {
    let mut payload = vec![ADDRESS_VERSION];
    payload.extend_from_slice(pub_key_hash);
    let checksum = double_sha256(&payload);
    payload.extend_from_slice(&checksum[..ADDRESS_CHECKSUM_LEN]);
    bs58::encode(payload).into_string()
}

/// Decode a Base58Check address back to its locking key hash,
/// rejecting bad encodings and checksum mismatches
pub fn address_to_pub_key_hash(address: &str) -> Result<Vec<u8>, KeyError> {
    let payload = bs58::decode(address)
        .into_vec()
        .map_err(|e| KeyError::InvalidAddress(e.to_string()))?;
    if payload.len() <= 1 + ADDRESS_CHECKSUM_LEN {
        return Err(KeyError::InvalidAddress("address too short".to_string()));
    }

    let (versioned, checksum) = payload.split_at(payload.len() - ADDRESS_CHECKSUM_LEN);
    if double_sha256(versioned)[..ADDRESS_CHECKSUM_LEN] != *checksum {
        return Err(KeyError::InvalidAddress("checksum mismatch".to_string()));
    }
    if versioned[0] != ADDRESS_VERSION {
        return Err(KeyError::InvalidAddress(format!(
            "unknown version byte {:#04x}",
            versioned[0]
        )));
    }

    Ok(versioned[1..].to_vec())
}

/// Check an address without decoding it for the caller
pub fn validate_address(address: &str) -> bool {
    address_to_pub_key_hash(address).is_ok()
}

/// Parse a public key from its serialized bytes
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey, KeyError> {
    PublicKey::from_slice(bytes).map_err(|_| KeyError::InvalidPublicKey)
}

/// Sign a message hash with a secret key
pub fn sign_message(secret_key: &SecretKey, message_hash: &[u8]) -> Result<Vec<u8>, KeyError> {
    let secp = Secp256k1::new();
    let message = to_message(message_hash)?;
    let signature = secp.sign_ecdsa(&message, secret_key);
    Ok(signature.serialize_compact().to_vec())
}

/// Verify a compact signature against a public key
pub fn verify_signature(
    public_key: &PublicKey,
    message_hash: &[u8],
    signature: &[u8],
) -> Result<bool, KeyError> {
    let secp = Secp256k1::new();
    let message = to_message(message_hash)?;
    let sig = secp256k1::ecdsa::Signature::from_compact(signature)
        .map_err(|_| KeyError::InvalidSignature)?;

    Ok(secp.verify_ecdsa(&message, &sig, public_key).is_ok())
}

fn to_message(message_hash: &[u8]) -> Result<Message, KeyError> {
    // Secp256k1 signs 32-byte digests only
    let digest = if message_hash.len() == 32 {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(message_hash);
        digest
    } else {
        sha256(message_hash)
    };
    Ok(Message::from_digest_slice(&digest)?)
}

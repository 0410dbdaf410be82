//! Merkle root over a block's transaction list

use super::hash::{sha256, Hash};

/// Calculate the merkle root from a list of leaf hashes.
///
/// An odd node at any level is paired with itself. An empty list hashes
/// the empty string.
pub fn calculate_merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return sha256(b"");
    }

    let mut current_level: Vec<Hash> = leaves.to_vec();

    while current_level.len() > 1 {
        current_level = current_level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                let mut data = Vec::with_capacity(64);
                data.extend_from_slice(&pair[0]);
                data.extend_from_slice(right);
                sha256(&data)
            })
            .collect();
    }

    current_level[0]
}

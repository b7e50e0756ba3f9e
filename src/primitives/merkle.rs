//! Merkle tree construction and branch proofs
//!
//! Parent-chain convention: paired double SHA-256, odd levels duplicate the
//! last node. Branches ("merkle links") let a share commit to the coinbase
//! position without carrying the transaction set.

use sha2::{Digest, Sha256};

use super::hash::Hash256;

fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut first = Sha256::new();
    first.update(left.0);
    first.update(right.0);
    let second = Sha256::digest(first.finalize());
    Hash256(second.into())
}

/// Merkle root of a list of transaction hashes
///
/// An empty list yields the zero hash (no-transaction placeholder).
pub fn merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return Hash256::ZERO;
    }
    let mut level: Vec<Hash256> = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let right = if pair.len() == 2 { &pair[1] } else { &pair[0] };
            next.push(hash_pair(&pair[0], right));
        }
        level = next;
    }
    level[0]
}

/// Sibling hashes needed to recompute the root from the leaf at `index`
pub fn merkle_branch(hashes: &[Hash256], mut index: usize) -> Vec<Hash256> {
    let mut branch = Vec::new();
    if hashes.is_empty() || index >= hashes.len() {
        return branch;
    }
    let mut level: Vec<Hash256> = hashes.to_vec();
    while level.len() > 1 {
        let sibling = if index % 2 == 0 {
            *level.get(index + 1).unwrap_or(&level[index])
        } else {
            level[index - 1]
        };
        branch.push(sibling);
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let right = if pair.len() == 2 { &pair[1] } else { &pair[0] };
            next.push(hash_pair(&pair[0], right));
        }
        level = next;
        index /= 2;
    }
    branch
}

/// Recompute the root from a leaf, its branch, and its position
pub fn apply_merkle_branch(leaf: Hash256, branch: &[Hash256], mut index: usize) -> Hash256 {
    let mut acc = leaf;
    for sibling in branch {
        acc = if index % 2 == 0 {
            hash_pair(&acc, sibling)
        } else {
            hash_pair(sibling, &acc)
        };
        index /= 2;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::hash::hash256;

    fn leaves(n: usize) -> Vec<Hash256> {
        (0..n).map(|i| hash256(&[i as u8])).collect()
    }

    #[test]
    fn single_leaf_is_root() {
        let l = leaves(1);
        assert_eq!(merkle_root(&l), l[0]);
    }

    #[test]
    fn branch_recomputes_root_all_positions() {
        for n in 1..=9 {
            let l = leaves(n);
            let root = merkle_root(&l);
            for (i, leaf) in l.iter().enumerate() {
                let branch = merkle_branch(&l, i);
                assert_eq!(apply_merkle_branch(*leaf, &branch, i), root, "n={} i={}", n, i);
            }
        }
    }

    #[test]
    fn odd_level_duplicates_last() {
        let l3 = leaves(3);
        let mut l4 = l3.clone();
        l4.push(l3[2]);
        assert_eq!(merkle_root(&l3), merkle_root(&l4));
    }

    #[test]
    fn tamper_breaks_proof() {
        let l = leaves(5);
        let root = merkle_root(&l);
        let branch = merkle_branch(&l, 2);
        let other = hash256(b"tampered");
        assert_ne!(apply_merkle_branch(other, &branch, 2), root);
    }
}

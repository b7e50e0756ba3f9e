//! Parent-chain primitives
//!
//! Byte-exact building blocks the rest of the node is assembled from:
//! hashes, the consensus wire codec, transactions and headers, merkle
//! trees, target arithmetic, and address/script translation.

pub mod address;
pub mod block;
pub mod encode;
pub mod hash;
pub mod merkle;
pub mod target;
pub mod tx;

pub use block::{Block, BlockHeader};
pub use encode::{CodecError, Reader, Writer};
pub use hash::{hash160, hash256, sha256d_digest, Hash256};
pub use merkle::{apply_merkle_branch, merkle_branch, merkle_root};
pub use target::{
    compact_to_target, difficulty_to_target, target_to_average_attempts, target_to_compact,
    target_to_difficulty, U256,
};
pub use tx::{OutPoint, RawTransaction, Transaction, TxIn, TxOut};

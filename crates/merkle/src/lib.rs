//! ShareCraft Merkle
//!
//! Leaf/node codec and binary Merkle tree for epoch holder snapshots.
//!
//! The byte layout of a leaf and the pairing rule of an internal node are
//! shared with the on-ledger verifier, so both are frozen:
//!
//! ```text
//! leaf = SHA256(0x00 || pool_index_u32_be || holder_xdr || lp_balance_i128_be || epoch_id_u64_be)
//! node = SHA256(0x01 || min(a, b) || max(a, b))
//! ```
//!
//! Because a node hashes its children in canonical (sorted) order, a proof
//! is just the list of sibling digests; verification never needs to know
//! whether the running hash was the left or the right child.

mod codec;
mod tree;

pub use codec::{encode_leaf, hash_pair, leaf_for, LEAF_PREFIX, NODE_PREFIX};
pub use tree::{verify, MerkleError, MerkleProof, MerkleTree};

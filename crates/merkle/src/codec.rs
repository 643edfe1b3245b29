//! Canonical leaf and node encoding.

use sha2::{Digest as _, Sha256};

use sharecraft_core::{Amount, Digest, EpochId, HolderAddress, PoolIndex};

/// Domain separator for leaves
pub const LEAF_PREFIX: u8 = 0x00;

/// Domain separator for internal nodes
pub const NODE_PREFIX: u8 = 0x01;

/// Hash one holder's claim for one epoch.
///
/// `holder_xdr` is the canonical account-identifier encoding of the holder
/// (see `HolderAddress::to_xdr`).
pub fn encode_leaf(
    pool_index: PoolIndex,
    holder_xdr: &[u8],
    lp_balance: Amount,
    epoch_id: EpochId,
) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(pool_index.to_be_bytes());
    hasher.update(holder_xdr);
    hasher.update(lp_balance.to_be_bytes());
    hasher.update(epoch_id.to_be_bytes());
    let result = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    Digest(out)
}

/// `encode_leaf` for a typed holder address
pub fn leaf_for(
    pool_index: PoolIndex,
    holder: &HolderAddress,
    lp_balance: Amount,
    epoch_id: EpochId,
) -> Digest {
    encode_leaf(pool_index, &holder.to_xdr(), lp_balance, epoch_id)
}

/// Hash two nodes together with canonical ordering (smaller digest first).
///
/// `hash_pair(a, b) == hash_pair(b, a)` for every pair.
pub fn hash_pair(a: &Digest, b: &Digest) -> Digest {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    let result = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    Digest(out)
}

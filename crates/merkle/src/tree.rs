//! Binary Merkle tree builder.
//!
//! Layers are reduced left to right. Adjacent nodes are combined with
//! `hash_pair`; the unpaired last node of an odd layer is promoted to the
//! next layer unchanged (never hashed with itself, never dropped).

use sharecraft_core::Digest;

use crate::codec::hash_pair;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MerkleError {
    #[error("Cannot build a Merkle tree from zero leaves")]
    EmptyTree,
}

/// Sibling path from one leaf up to the root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Position of the leaf in the input order
    pub leaf_index: usize,
    /// Sibling digests, leaf level first
    pub siblings: Vec<Digest>,
}

impl MerkleProof {
    pub fn verify(&self, leaf: &Digest, root: &Digest) -> bool {
        verify(leaf, &self.siblings, root)
    }
}

/// Construction-time node: its digest plus the original leaf indices it covers.
struct Node {
    hash: Digest,
    leaves: Vec<usize>,
}

/// A built tree: root plus one proof per input leaf
#[derive(Debug, Clone)]
pub struct MerkleTree {
    root: Digest,
    leaves: Vec<Digest>,
    proofs: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Build a tree over `leaves` in the given order.
    ///
    /// The root depends on the input order (it fixes the tree shape), so
    /// callers that need reproducible roots must sort their leaves first.
    pub fn build(leaves: &[Digest]) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::EmptyTree);
        }

        let mut proofs: Vec<Vec<Digest>> = vec![Vec::new(); leaves.len()];
        let mut layer: Vec<Node> = leaves
            .iter()
            .enumerate()
            .map(|(i, hash)| Node { hash: *hash, leaves: vec![i] })
            .collect();

        while layer.len() > 1 {
            let mut next = Vec::with_capacity(layer.len().div_ceil(2));
            let mut nodes = layer.into_iter();
            while let Some(left) = nodes.next() {
                let Some(right) = nodes.next() else {
                    // Odd layer: promote unchanged
                    next.push(left);
                    break;
                };
                for &i in &left.leaves {
                    proofs[i].push(right.hash);
                }
                for &i in &right.leaves {
                    proofs[i].push(left.hash);
                }
                let mut covered = left.leaves;
                covered.extend(right.leaves);
                next.push(Node {
                    hash: hash_pair(&left.hash, &right.hash),
                    leaves: covered,
                });
            }
            layer = next;
        }

        let root = layer[0].hash;
        Ok(Self {
            root,
            leaves: leaves.to_vec(),
            proofs,
        })
    }

    pub fn root(&self) -> Digest {
        self.root
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn leaf(&self, index: usize) -> Option<Digest> {
        self.leaves.get(index).copied()
    }

    /// Proof for the leaf at `index`, or `None` if out of range
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        self.proofs.get(index).map(|siblings| MerkleProof {
            leaf_index: index,
            siblings: siblings.clone(),
        })
    }

    /// Sibling paths for every leaf, in input order
    pub fn proofs(&self) -> &[Vec<Digest>] {
        &self.proofs
    }
}

/// Fold `hash_pair` over `proof` starting from `leaf`; true iff the result is `root`.
pub fn verify(leaf: &Digest, proof: &[Digest], root: &Digest) -> bool {
    let computed = proof
        .iter()
        .fold(*leaf, |current, sibling| hash_pair(&current, sibling));
    computed == *root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::leaf_for;
    use sharecraft_core::HolderAddress;

    fn d(s: &str) -> Digest {
        Digest::from_hex(s).unwrap()
    }

    /// Leaves for holders [1;32]..[4;32] with balances 100, 50, 30, 10 in pool 0, epoch 1
    fn reference_leaves() -> Vec<Digest> {
        [100i128, 50, 30, 10]
            .iter()
            .enumerate()
            .map(|(i, bal)| leaf_for(0, &HolderAddress::Account([i as u8 + 1; 32]), *bal, 1))
            .collect()
    }

    const L0: &str = "8a7674c04c0dac8565766c66247a6550b14e5c4fa28074bfa1232fbb1bf3bb00";
    const L1: &str = "c6a11989c7d322f3a3e6417b99c08e7790b53c1ce925875980b250a022dcd6eb";
    const L2: &str = "5f9f2852cb3a2310ab0b2fa1f276d1924c27fc62a2efb27999651905fbd80916";
    const L3: &str = "08fd8b97e3270c2c02144c2fe4d3bd63df6b3e394e6c0adb8066fb3f6476e9c9";
    const N01: &str = "da41b24310a2307299ef9b741ea15789d532eb9f9b27634b2b0c5d3096b23694";
    const N23: &str = "fa8600b93641a702c8ecd4da16c9ffe674729ba96f32b3cdab56dba5b5c7f813";

    #[test]
    fn test_reference_leaves() {
        let leaves = reference_leaves();
        assert_eq!(leaves, vec![d(L0), d(L1), d(L2), d(L3)]);
    }

    #[test]
    fn test_empty_tree_rejected() {
        assert_eq!(MerkleTree::build(&[]).unwrap_err(), MerkleError::EmptyTree);
    }

    #[test]
    fn test_single_leaf_tree() {
        let leaf = d(L0);
        let tree = MerkleTree::build(&[leaf]).unwrap();
        assert_eq!(tree.root(), leaf);
        assert!(tree.proof(0).unwrap().siblings.is_empty());
        assert!(verify(&leaf, &[], &tree.root()));
    }

    #[test]
    fn test_two_leaf_vectors() {
        let tree = MerkleTree::build(&reference_leaves()[..2]).unwrap();
        assert_eq!(tree.root(), d(N01));
        assert_eq!(tree.proof(0).unwrap().siblings, vec![d(L1)]);
        assert_eq!(tree.proof(1).unwrap().siblings, vec![d(L0)]);
    }

    #[test]
    fn test_three_leaf_vectors() {
        // Third leaf is promoted unchanged, then paired with n01
        let tree = MerkleTree::build(&reference_leaves()[..3]).unwrap();
        assert_eq!(
            tree.root(),
            d("3f193570bfc6bc666f24b46bdb86c23a3b0e24e1f8d3cb54e75facbd1632c349")
        );
        assert_eq!(tree.proof(0).unwrap().siblings, vec![d(L1), d(L2)]);
        assert_eq!(tree.proof(1).unwrap().siblings, vec![d(L0), d(L2)]);
        assert_eq!(tree.proof(2).unwrap().siblings, vec![d(N01)]);
    }

    #[test]
    fn test_four_leaf_vectors() {
        let tree = MerkleTree::build(&reference_leaves()).unwrap();
        assert_eq!(
            tree.root(),
            d("24fca87068c2d90e0f2fee3c46f3267224758b148c1ff885aaea2e903b941558")
        );
        assert_eq!(tree.proof(0).unwrap().siblings, vec![d(L1), d(N23)]);
        assert_eq!(tree.proof(1).unwrap().siblings, vec![d(L0), d(N23)]);
        assert_eq!(tree.proof(2).unwrap().siblings, vec![d(L3), d(N01)]);
        assert_eq!(tree.proof(3).unwrap().siblings, vec![d(L2), d(N01)]);
    }

    #[test]
    fn test_five_leaf_promotion_across_layers() {
        let mut leaves = reference_leaves();
        leaves.push(leaf_for(0, &HolderAddress::Account([5u8; 32]), 1, 1));
        let tree = MerkleTree::build(&leaves).unwrap();
        assert_eq!(
            tree.root(),
            d("0e0548e318886720d0550e75d663062aa7a37d1b1ea60eb9c82f5db045d8c376")
        );
        // Promoted twice, then paired once with the 4-leaf subtree root
        assert_eq!(
            tree.proof(4).unwrap().siblings,
            vec![d("24fca87068c2d90e0f2fee3c46f3267224758b148c1ff885aaea2e903b941558")]
        );
        assert_eq!(tree.proof(0).unwrap().siblings.len(), 3);
    }

    #[test]
    fn test_every_leaf_verifies() {
        for n in 1..=33u8 {
            let leaves: Vec<Digest> = (0..n)
                .map(|i| leaf_for(3, &HolderAddress::Account([i; 32]), i as i128 * 7 + 1, 5))
                .collect();
            let tree = MerkleTree::build(&leaves).unwrap();
            for (i, leaf) in leaves.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                assert!(proof.verify(leaf, &tree.root()), "leaf {} of {} failed", i, n);
            }
        }
    }

    #[test]
    fn test_wrong_leaf_or_root_fails() {
        let leaves = reference_leaves();
        let tree = MerkleTree::build(&leaves).unwrap();
        let proof = tree.proof(1).unwrap();

        // Wrong balance for the same holder
        let forged = leaf_for(0, &HolderAddress::Account([2u8; 32]), 51, 1);
        assert!(!proof.verify(&forged, &tree.root()));

        // Same leaf under a different epoch's root
        assert!(!proof.verify(&leaves[1], &Digest([0xAA; 32])));

        // Truncated proof
        assert!(!verify(&leaves[1], &proof.siblings[..1], &tree.root()));
    }

    #[test]
    fn test_input_order_changes_root() {
        let leaves = reference_leaves();
        let mut reordered = leaves.clone();
        reordered.swap(0, 2);
        let a = MerkleTree::build(&leaves).unwrap();
        let b = MerkleTree::build(&reordered).unwrap();
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn test_proof_out_of_range() {
        let tree = MerkleTree::build(&reference_leaves()).unwrap();
        assert!(tree.proof(4).is_none());
        assert_eq!(tree.leaf_count(), 4);
        assert_eq!(tree.leaf(2), Some(d(L2)));
    }
}

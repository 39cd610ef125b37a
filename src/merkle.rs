//! Fixed-depth binary Merkle tree over a block's records (spec.md §4.1).
//!
//! Always built to `MAX_LEVELS` depth (256 leaves), padding unused leaves
//! with the all-zero digest. Grounded on `original_source/block.py`'s
//! `create_merkle_tree`/`get_merkle_proof`/`verify_merkle_proof`.

use {
  crate::crypto::{Digest32, ZERO_DIGEST},
  serde::{Deserialize, Serialize},
};

/// Tree depth: `2^MAX_LEVELS` leaves per block (spec.md §4.1).
pub const MAX_LEVELS: u32 = 8;

/// A single step of an inclusion proof: the sibling digest and whether that
/// sibling sits to the left of the hash being folded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
  pub sibling: Digest32,
  pub is_left: bool,
}

/// A full Merkle tree, retained level-by-level so both the root and any
/// leaf's proof can be read off without recomputing.
pub struct MerkleTree {
  levels: Vec<Vec<Digest32>>,
}

impl MerkleTree {
  /// Builds the tree from leaf digests, padding to `2^MAX_LEVELS` with
  /// [`ZERO_DIGEST`]. `leaves.len()` must not exceed `2^MAX_LEVELS`.
  pub fn build(mut leaves: Vec<Digest32>) -> Self {
    let capacity = 1usize << MAX_LEVELS;
    assert!(
      leaves.len() <= capacity,
      "block carries more records than the tree can hold"
    );
    leaves.resize(capacity, ZERO_DIGEST);

    let mut levels = vec![leaves];
    while levels.last().unwrap().len() > 1 {
      let prev = levels.last().unwrap();
      let mut next = Vec::with_capacity(prev.len() / 2);
      for pair in prev.chunks_exact(2) {
        next.push(Digest32::sha256_concat(&[
          pair[0].as_bytes(),
          pair[1].as_bytes(),
        ]));
      }
      levels.push(next);
    }
    Self { levels }
  }

  pub fn root(&self) -> Digest32 {
    self.levels.last().unwrap()[0]
  }

  /// Inclusion proof for the leaf at `index`, bottom level to top.
  pub fn proof(&self, index: usize) -> Vec<ProofStep> {
    let mut current = index;
    let mut proof = Vec::with_capacity(self.levels.len() - 1);
    for level in &self.levels[..self.levels.len() - 1] {
      if current % 2 == 1 {
        proof.push(ProofStep { sibling: level[current - 1], is_left: true });
      } else {
        proof.push(ProofStep { sibling: level[current + 1], is_left: false });
      }
      current /= 2;
    }
    proof
  }
}

/// Verifies that `leaf` folds up through `proof` to `root`, independent of
/// any constructed [`MerkleTree`] — the form a peer uses to check a proof
/// received over the wire.
pub fn verify(leaf: Digest32, proof: &[ProofStep], root: Digest32) -> bool {
  let mut current = leaf;
  for step in proof {
    current = if step.is_left {
      Digest32::sha256_concat(&[step.sibling.as_bytes(), current.as_bytes()])
    } else {
      Digest32::sha256_concat(&[current.as_bytes(), step.sibling.as_bytes()])
    };
  }
  current == root
}

#[cfg(test)]
mod tests {
  use super::*;

  fn leaf(n: u8) -> Digest32 {
    Digest32::sha256([n])
  }

  #[test]
  fn single_leaf_proof_verifies() {
    let leaves: Vec<_> = (0..5u8).map(leaf).collect();
    let tree = MerkleTree::build(leaves.clone());
    let root = tree.root();
    for (i, &l) in leaves.iter().enumerate() {
      let proof = tree.proof(i);
      assert!(verify(l, &proof, root), "leaf {i} failed to verify");
    }
  }

  #[test]
  fn tampered_leaf_fails() {
    let leaves: Vec<_> = (0..3u8).map(leaf).collect();
    let tree = MerkleTree::build(leaves);
    let proof = tree.proof(0);
    assert!(!verify(leaf(99), &proof, tree.root()));
  }

  #[test]
  fn empty_block_root_is_deterministic() {
    let a = MerkleTree::build(vec![]);
    let b = MerkleTree::build(vec![]);
    assert_eq!(a.root(), b.root());
  }

  #[test]
  fn full_tree_has_256_leaf_capacity() {
    let leaves: Vec<_> = (0..256u16).map(|i| Digest32::sha256(i.to_be_bytes())).collect();
    let tree = MerkleTree::build(leaves);
    assert_eq!(tree.levels[0].len(), 1 << MAX_LEVELS);
  }
}

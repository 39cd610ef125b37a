//! Test fixtures shared across unit and integration tests: deterministic
//! keypairs and a synchronous nonce-search helper so tests can build a
//! short, fully-valid chain without the async miner loop.

use crate::{
  block::Block,
  crypto::{Digest32, Keypair, PublicKey},
  record::Record,
};

/// A fresh 2048-bit RSA keypair. Real key generation, not a stub — spec.md
/// names key generation for test fixtures as an explicit external concern,
/// but the fixture itself still needs a working keypair.
pub fn gen_keypair() -> Keypair {
  let mut rng = rand::thread_rng();
  Keypair::generate(&mut rng, 2048).expect("RSA key generation should not fail")
}

pub fn pubkey_from(kp: &Keypair) -> PublicKey {
  kp.public().clone()
}

/// A genesis block with `DEFAULT_DIFFICULTY`, no retarget (spec.md §9).
/// Genesis bypasses PoW/validity checks entirely ([`ChainStore::new`]
/// installs it directly), so its nonce is left at 0.
pub fn low_difficulty_genesis() -> Block {
  Block::new(
    0,
    Digest32::from_bytes([0u8; 32]),
    1_700_000_000,
    crate::chain::rules::DEFAULT_DIFFICULTY,
    0,
    vec![],
  )
  .expect("empty genesis body is always valid")
}

/// Mines a valid child of `parent`: searches nonces until the header
/// satisfies PoW at `difficulty`. At `DEFAULT_DIFFICULTY` this takes on the
/// order of a few million SHA-256 evaluations, well within a test's budget.
pub fn mine_block(
  parent: &Block,
  difficulty: u32,
  timestamp: u64,
  records: Vec<Record>,
) -> Block {
  let mut block = Block::new(
    parent.header.index + 1,
    parent.hash(),
    timestamp,
    difficulty,
    0,
    records,
  )
  .expect("test blocks stay within the record/size limits");

  for nonce in 0..=u32::MAX {
    block.header.nonce = nonce;
    if block.header.satisfies_pow() {
      return block;
    }
  }
  panic!("exhausted nonce space without finding a valid proof of work");
}

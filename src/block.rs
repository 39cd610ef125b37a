//! Block header encoding and the block type (spec.md §4).
//!
//! Grounded on `original_source/block.py`'s `get_header`/`get_sendable` byte
//! layout and the teacher's `consensus/block.rs` parent-by-hash/cumulative
//! work shape.

use {
  crate::{
    crypto::Digest32,
    error::BlockError,
    merkle::{MerkleTree, ProofStep, MAX_LEVELS},
    record::Record,
  },
  std::collections::BTreeMap,
};

/// Header is exactly 84 bytes, big-endian (spec.md §4).
pub const HEADER_LEN: usize = 84;

/// `2^MAX_LEVELS` records, `MAX_BLOCK_SIZE` bytes (spec.md §4.3 & Constants).
pub const MAX_RECORDS_PER_BLOCK: usize = 1 << MAX_LEVELS;
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// The 84-byte fixed-layout block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
  pub index: u32,
  pub previous_hash: Digest32,
  pub merkle_root: Digest32,
  pub timestamp: u64,
  pub difficulty: u32,
  pub nonce: u32,
}

impl Header {
  pub fn encode(&self) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..4].copy_from_slice(&self.index.to_be_bytes());
    out[4..36].copy_from_slice(self.previous_hash.as_bytes());
    out[36..68].copy_from_slice(self.merkle_root.as_bytes());
    out[68..76].copy_from_slice(&self.timestamp.to_be_bytes());
    out[76..80].copy_from_slice(&self.difficulty.to_be_bytes());
    out[80..84].copy_from_slice(&self.nonce.to_be_bytes());
    out
  }

  pub fn decode(bytes: &[u8]) -> Result<Self, BlockError> {
    if bytes.len() != HEADER_LEN {
      return Err(BlockError::WrongHeaderLength(bytes.len()));
    }
    let index = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    let previous_hash = Digest32::try_from(&bytes[4..36])
      .expect("slice is exactly 32 bytes");
    let merkle_root = Digest32::try_from(&bytes[36..68])
      .expect("slice is exactly 32 bytes");
    let timestamp = u64::from_be_bytes(bytes[68..76].try_into().unwrap());
    let difficulty = u32::from_be_bytes(bytes[76..80].try_into().unwrap());
    let nonce = u32::from_be_bytes(bytes[80..84].try_into().unwrap());
    Ok(Self { index, previous_hash, merkle_root, timestamp, difficulty, nonce })
  }

  /// The header hash: SHA-256 of the 84-byte encoding.
  pub fn hash(&self) -> Digest32 {
    Digest32::sha256(self.encode())
  }

  /// Whether `self.hash()` satisfies the PoW predicate for `self.difficulty`
  /// (spec.md §4.2): top `LEADING_ZERO_BYTES` bytes zero, and the next four
  /// bytes interpreted as a big-endian integer strictly below `TARGET / d`.
  pub fn satisfies_pow(&self) -> bool {
    pow_check(&self.hash(), self.difficulty)
  }
}

pub const LEADING_ZERO_BYTES: usize = 2;
pub const TARGET: u64 = 1u64 << 32;

pub fn pow_check(hash: &Digest32, difficulty: u32) -> bool {
  if difficulty == 0 {
    return false;
  }
  let bytes = hash.as_bytes();
  if bytes[..LEADING_ZERO_BYTES].iter().any(|&b| b != 0) {
    return false;
  }
  let window = u32::from_be_bytes(
    bytes[LEADING_ZERO_BYTES..LEADING_ZERO_BYTES + 4].try_into().unwrap(),
  ) as u64;
  let threshold = TARGET / difficulty as u64;
  window < threshold
}

/// A full block: header plus its ordered body of records. Parents are
/// referenced by hash rather than by strong pointer (spec.md §9 "Parent
/// pointers & total_work") so the chain store can own an arena of blocks
/// without cyclic ownership.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
  pub header: Header,
  pub records: Vec<Record>,
}

impl Block {
  /// Builds a block from an ordered record list, computing the Merkle root
  /// from scratch. `nonce` is left at the caller's choice (0 to start
  /// mining, or a solved value when reconstructing a mined block).
  pub fn new(
    index: u32,
    previous_hash: Digest32,
    timestamp: u64,
    difficulty: u32,
    nonce: u32,
    records: Vec<Record>,
  ) -> Result<Self, BlockError> {
    if records.len() > MAX_RECORDS_PER_BLOCK {
      return Err(BlockError::TooManyRecords(records.len()));
    }
    let leaves = records.iter().map(Record::hash).collect();
    let merkle_root = MerkleTree::build(leaves).root();
    Ok(Self {
      header: Header { index, previous_hash, merkle_root, timestamp, difficulty, nonce },
      records,
    })
  }

  pub fn hash(&self) -> Digest32 {
    self.header.hash()
  }

  /// Recomputes the Merkle tree over this block's records, for proof
  /// generation or root cross-checking.
  pub fn merkle_tree(&self) -> MerkleTree {
    MerkleTree::build(self.records.iter().map(Record::hash).collect())
  }

  pub fn merkle_proof(&self, leaf_index: usize) -> Vec<ProofStep> {
    self.merkle_tree().proof(leaf_index)
  }

  /// `header ∥ body`, the wire encoding of a `BLOCK` message payload
  /// (spec.md §4.5). Body is `{"0": rec0, "1": rec1, ...}`.
  pub fn encode(&self) -> Vec<u8> {
    let mut out = self.header.encode().to_vec();
    let body: BTreeMap<String, &Record> = self
      .records
      .iter()
      .enumerate()
      .map(|(i, r)| (i.to_string(), r))
      .collect();
    let body_json = serde_json::to_vec(&body).expect("record body is serializable");
    out.extend_from_slice(&body_json);
    out
  }

  pub fn decode(bytes: &[u8]) -> Result<Self, BlockError> {
    if bytes.len() < HEADER_LEN {
      return Err(BlockError::WrongHeaderLength(bytes.len()));
    }
    let header = Header::decode(&bytes[..HEADER_LEN])?;
    let body: BTreeMap<String, serde_json::Value> =
      serde_json::from_slice(&bytes[HEADER_LEN..])?;
    let mut indexed: Vec<(u64, serde_json::Value)> = body
      .into_iter()
      .map(|(k, v)| (k.parse::<u64>().unwrap_or(u64::MAX), v))
      .collect();
    indexed.sort_by_key(|(i, _)| *i);
    let records = indexed
      .into_iter()
      .map(|(_, v)| Record::from_json_value(v).map_err(BlockError::from))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(Self { header, records })
  }

  /// `difficulty + parent_cumulative_work`, or `difficulty` for genesis
  /// (spec.md §4).
  pub fn cumulative_work(&self, parent_cumulative_work: Option<u64>) -> u64 {
    self.header.difficulty as u64 + parent_cumulative_work.unwrap_or(0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn header_roundtrips_through_bytes() {
    let h = Header {
      index: 7,
      previous_hash: Digest32::sha256(b"parent"),
      merkle_root: Digest32::sha256(b"root"),
      timestamp: 1_700_000_000,
      difficulty: 128,
      nonce: 42,
    };
    let bytes = h.encode();
    assert_eq!(bytes.len(), HEADER_LEN);
    assert_eq!(Header::decode(&bytes).unwrap(), h);
  }

  #[test]
  fn pow_check_rejects_nonzero_prefix() {
    let hash = Digest32::try_from(&[1u8; 32][..]).unwrap();
    assert!(!pow_check(&hash, 128));
  }

  #[test]
  fn pow_check_accepts_low_enough_window() {
    let mut bytes = [0u8; 32];
    bytes[2..6].copy_from_slice(&1u32.to_be_bytes());
    let hash = Digest32::try_from(&bytes[..]).unwrap();
    assert!(pow_check(&hash, 1));
  }

  #[test]
  fn empty_block_encode_decode_roundtrips() {
    let block = Block::new(0, Digest32::sha256(b"genesis-parent"), 0, 128, 0, vec![]).unwrap();
    let bytes = block.encode();
    let back = Block::decode(&bytes).unwrap();
    assert_eq!(back.header.merkle_root, block.header.merkle_root);
    assert!(back.records.is_empty());
  }

  #[test]
  fn cumulative_work_adds_to_parent() {
    let block = Block::new(1, Digest32::sha256(b"p"), 0, 200, 0, vec![]).unwrap();
    assert_eq!(block.cumulative_work(Some(100)), 300);
    assert_eq!(block.cumulative_work(None), 200);
  }
}

//! Orphan pool: blocks whose parent hasn't been seen yet (spec.md §4.3).
//!
//! Grounded on the teacher's `consensus/orphans.rs` parent-keyed map and its
//! oldest-first pruning, generalized from an orphan *tree* keyed by block
//! hash back down to the flat `missing_parent_hash → raw_block_bytes` shape
//! spec.md §4.3 names, and bounded per spec.md §7's explicit flag that an
//! unbounded orphan pool is a memory-exhaustion vector.
use {
  std::{
    collections::{HashMap, VecDeque},
    time::Instant,
  },
  tracing::warn,
};

use crate::crypto::Digest32;

/// Total raw blocks retained across all missing parents, and per-parent
/// entries, before oldest entries are evicted to make room.
const MAX_ORPHANS: usize = 1024;
const MAX_ORPHANS_PER_PARENT: usize = 32;

struct Entry {
  bytes: Vec<u8>,
  received_at: Instant,
}

/// `missing_parent_hash → [raw_block_bytes]`, with bounded total size.
pub struct OrphanPool {
  by_parent: HashMap<Digest32, Vec<Entry>>,
  arrival_order: VecDeque<Digest32>,
  len: usize,
}

impl Default for OrphanPool {
  fn default() -> Self {
    Self::new()
  }
}

impl OrphanPool {
  pub fn new() -> Self {
    Self { by_parent: HashMap::new(), arrival_order: VecDeque::new(), len: 0 }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Files `bytes` under `missing_parent`, requesting the sender follow up
  /// with `GET_BLOCK(missing_parent)` (spec.md §4.3).
  pub fn insert(&mut self, missing_parent: Digest32, bytes: Vec<u8>) {
    while self.len >= MAX_ORPHANS {
      self.evict_oldest();
    }
    let bucket = self.by_parent.entry(missing_parent).or_default();
    if bucket.len() >= MAX_ORPHANS_PER_PARENT {
      warn!(
        parent = %missing_parent,
        "orphan bucket full, dropping oldest entry for this parent"
      );
      bucket.remove(0);
      self.len -= 1;
    }
    bucket.push(Entry { bytes, received_at: Instant::now() });
    self.arrival_order.push_back(missing_parent);
    self.len += 1;
  }

  /// Pulls every orphan that was waiting on `parent_hash`, for recursive
  /// re-verification once `parent_hash` itself is accepted.
  pub fn take(&mut self, parent_hash: &Digest32) -> Vec<Vec<u8>> {
    match self.by_parent.remove(parent_hash) {
      Some(entries) => {
        self.len -= entries.len();
        entries.into_iter().map(|e| e.bytes).collect()
      }
      None => Vec::new(),
    }
  }

  fn evict_oldest(&mut self) {
    while let Some(parent) = self.arrival_order.pop_front() {
      if let Some(bucket) = self.by_parent.get_mut(&parent) {
        if !bucket.is_empty() {
          bucket.remove(0);
          self.len -= 1;
          if bucket.is_empty() {
            self.by_parent.remove(&parent);
          }
          return;
        }
      }
    }
  }

}

#[cfg(test)]
mod tests {
  use super::*;

  fn parent(n: u8) -> Digest32 {
    Digest32::sha256([n])
  }

  #[test]
  fn insert_and_take_roundtrip() {
    let mut pool = OrphanPool::new();
    pool.insert(parent(1), vec![1, 2, 3]);
    pool.insert(parent(1), vec![4, 5, 6]);
    let taken = pool.take(&parent(1));
    assert_eq!(taken.len(), 2);
    assert!(pool.is_empty());
  }

  #[test]
  fn total_orphans_bounded() {
    let mut pool = OrphanPool::new();
    for i in 0..(MAX_ORPHANS + 100) {
      pool.insert(parent((i % 255) as u8), vec![i as u8]);
    }
    assert!(pool.len() <= MAX_ORPHANS);
  }

  #[test]
  fn per_parent_orphans_bounded() {
    let mut pool = OrphanPool::new();
    for i in 0..(MAX_ORPHANS_PER_PARENT + 10) {
      pool.insert(parent(7), vec![i as u8]);
    }
    assert!(pool.len() <= MAX_ORPHANS_PER_PARENT);
  }
}

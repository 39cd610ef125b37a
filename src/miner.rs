//! The mining loop (spec.md §4.4): assembles a candidate block from the
//! mempool, searches the nonce space, abandons the search on head change.
//!
//! Grounded on the teacher's `consensus/producer.rs` background-task shape,
//! replacing slot-scheduled BFT block production with PoW nonce search.

use {
  crate::{
    block::{Block, MAX_BLOCK_SIZE},
    chain::ChainStore,
    crypto::Digest32,
    record::{EndOfElection, Record},
  },
  rand::seq::SliceRandom,
  std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  tracing::{debug, info},
};

/// How often the nonce search peeks at the best tip (spec.md §4.4).
const NONCE_CHECK_INTERVAL: u32 = 10_000_000;

pub struct Miner {
  store: Arc<ChainStore>,
  should_mine: Arc<AtomicBool>,
}

impl Miner {
  pub fn new(store: Arc<ChainStore>) -> Self {
    Self { store, should_mine: Arc::new(AtomicBool::new(true)) }
  }

  /// A clonable flag the run loop can be told to stop through; cleared by
  /// the caller to cancel mining (spec.md §5 "Cancellation").
  pub fn handle(&self) -> Arc<AtomicBool> {
    self.should_mine.clone()
  }

  /// Runs until `should_mine` is cleared. Every mined block is submitted
  /// through [`ChainStore::accept_block`] — the same path inbound network
  /// blocks take, so every validity rule runs exactly once (spec.md §4.4)
  /// — and, on success, handed to `on_mined` for broadcast.
  pub async fn run(&self, mut on_mined: impl FnMut(Block)) {
    while self.should_mine.load(Ordering::Relaxed) {
      let store = self.store.clone();
      let should_mine = self.should_mine.clone();
      let result = tokio::task::spawn_blocking(move || mine_one(&store, &should_mine))
        .await
        .expect("mining task panicked");

      if let Some(block) = result {
        let now = now_unix();
        let outcome = self.store.accept_block(&block.encode(), now);
        debug!(?outcome, "submitted locally mined block");
        on_mined(block);
      }
    }
    info!("miner stopped");
  }
}

/// One full iteration: snapshot tip, sweep expired elections, assemble a
/// candidate, search for a valid nonce. Returns `None` if the head changed
/// mid-search or mining was cancelled, so the caller should just loop again.
fn mine_one(store: &ChainStore, should_mine: &AtomicBool) -> Option<Block> {
  let tip_hash = store.best_tip();
  let tip = store.get_block(&tip_hash)?;
  let tip_work = store.best_cumulative_work();

  sweep_expired_elections(store, &tip);

  let records = assemble_candidate(store, &tip);
  let difficulty = store.expected_difficulty(&tip_hash)?;
  let mut timestamp = now_unix();

  let mut block = Block::new(
    tip.header.index + 1,
    tip_hash,
    timestamp,
    difficulty,
    0,
    records,
  )
  .ok()?;

  let mut nonce: u32 = 0;
  loop {
    if !should_mine.load(Ordering::Relaxed) {
      return None;
    }
    block.header.nonce = nonce;
    if block.header.satisfies_pow() {
      return Some(block);
    }

    if nonce == u32::MAX {
      // Nonce space exhausted: refresh the timestamp and keep going
      // (spec.md §4.4).
      timestamp = now_unix();
      block.header.timestamp = timestamp;
      nonce = 0;
      continue;
    }
    nonce += 1;

    if nonce % NONCE_CHECK_INTERVAL == 0 {
      if store.best_cumulative_work() != tip_work {
        return None;
      }
    }
  }
}

fn sweep_expired_elections(store: &ChainStore, tip: &Block) {
  let now = tip.header.timestamp.max(now_unix());
  for election in store.open_elections() {
    if election.end_time < now {
      let hash = election.hash();
      let results = store.tally_for(&hash);
      store.inject_end_of_election(EndOfElection { election_hash: hash, results });
    }
  }
}

/// Pending ends first, then opens, then votes; shuffled within each
/// category; truncated to `MAX_BLOCK_SIZE` and `MAX_RECORDS_PER_BLOCK`
/// (spec.md §4.4).
fn assemble_candidate(store: &ChainStore, tip: &Block) -> Vec<Record> {
  let (ends, opens, votes) = store.mempool_snapshot();
  let open_elections: std::collections::HashSet<Digest32> =
    store.open_elections().iter().map(|e| e.hash()).collect();
  let now = tip.header.timestamp.max(now_unix());

  let mut ends: Vec<Record> = ends.into_iter().map(Record::EndOfElection).collect();
  let mut opens: Vec<Record> = opens
    .into_iter()
    .filter(|e| e.end_time >= now)
    .map(Record::Election)
    .collect();
  let mut votes: Vec<Record> = votes
    .into_iter()
    .filter(|v| open_elections.contains(&v.election_hash))
    .map(Record::Vote)
    .collect();

  let mut rng = rand::thread_rng();
  ends.shuffle(&mut rng);
  opens.shuffle(&mut rng);
  votes.shuffle(&mut rng);

  let mut candidate = Vec::new();
  candidate.append(&mut ends);
  candidate.append(&mut opens);
  candidate.append(&mut votes);

  let mut size = 0usize;
  let mut truncated = Vec::with_capacity(candidate.len());
  for record in candidate {
    if truncated.len() >= crate::block::MAX_RECORDS_PER_BLOCK {
      break;
    }
    let encoded_len = record.canonical_json().len();
    if size + encoded_len > MAX_BLOCK_SIZE {
      break;
    }
    size += encoded_len;
    truncated.push(record);
  }
  truncated
}

fn now_unix() -> u64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}

//! The light node: a header-only chain store plus a multi-peer Merkle-proof
//! query protocol (spec.md §4.6).
//!
//! Grounded on `chain::store::ChainStore`'s arena/heaviest-tip shape, stripped
//! of bodies and record validation; only link, PoW, difficulty and timestamp
//! are checked per header. Election result aggregation is new: spec.md §4.6
//! has no full-node analogue, so its fan-out/verify/aggregate shape is built
//! directly from the spec text, reusing `merkle::verify` and `rules::tally`.

use {
  crate::{
    block::Header,
    chain::rules::{self, DIFFICULTY_WINDOW_DIFFICULTIES, DIFFICULTY_WINDOW_TIMESTAMPS, TIMESTAMP_MEDIAN_WINDOW},
    crypto::Digest32,
    merkle,
    network::{
      peer::PeerId,
      wire::{ElectionResPayload, Message, RecordProof},
      Network, NetworkEvent,
    },
  },
  std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Mutex,
    time::Duration,
  },
  tracing::debug,
};

struct StoredHeader {
  header: Header,
  parent: Option<Digest32>,
  cumulative_work: u64,
}

struct Inner {
  headers: HashMap<Digest32, StoredHeader>,
  best: Digest32,
}

/// A `HeaderOutcome` mirrors [`crate::chain::AcceptOutcome`] but never carries
/// record-level rejection reasons, since a light node never sees bodies.
#[derive(Debug, PartialEq, Eq)]
pub enum HeaderOutcome {
  Accepted { reorg: bool },
  SideFork,
  Duplicate,
  UnknownParent,
  InvalidLink,
  InvalidDifficulty,
  InvalidProofOfWork,
  InvalidTimestamp,
}

/// A header-only chain store (spec.md §4.6: "maintains only headers").
pub struct LightHeaderStore {
  inner: Mutex<Inner>,
}

impl LightHeaderStore {
  pub fn new(genesis: Header) -> Self {
    let hash = genesis.hash();
    let mut headers = HashMap::new();
    let cumulative_work = genesis.difficulty as u64;
    headers.insert(hash, StoredHeader { header: genesis, parent: None, cumulative_work });
    Self { inner: Mutex::new(Inner { headers, best: hash }) }
  }

  pub fn best_tip(&self) -> Digest32 {
    self.inner.lock().unwrap().best
  }

  pub fn contains(&self, hash: &Digest32) -> bool {
    self.inner.lock().unwrap().headers.contains_key(hash)
  }

  pub fn get_header(&self, hash: &Digest32) -> Option<Header> {
    self.inner.lock().unwrap().headers.get(hash).map(|h| h.header)
  }

  /// Validates and stores `header`: link, PoW, difficulty retarget and
  /// timestamp (spec.md §4.6), in that order. No orphan pool — a light node
  /// is expected to backfill a missing parent via `GET_BLOCK`-less header
  /// sync before retrying, which is topology glue outside this store.
  pub fn accept_header(&self, header: Header, now: u64) -> HeaderOutcome {
    let hash = header.hash();
    let mut g = self.inner.lock().unwrap();
    if g.headers.contains_key(&hash) {
      return HeaderOutcome::Duplicate;
    }
    let Some(parent) = g.headers.get(&header.previous_hash) else {
      return HeaderOutcome::UnknownParent;
    };
    if header.index != parent.header.index + 1 {
      return HeaderOutcome::InvalidLink;
    }
    let parent_hash = header.previous_hash;
    let parent_difficulty = parent.header.difficulty;
    let parent_cumulative_work = parent.cumulative_work;

    let (timestamps, difficulties) = ancestor_window(&g, &parent_hash);
    let expected = rules::retarget_difficulty(parent_difficulty, &timestamps, &difficulties);
    if header.difficulty != expected {
      return HeaderOutcome::InvalidDifficulty;
    }
    if !header.satisfies_pow() {
      return HeaderOutcome::InvalidProofOfWork;
    }
    let median_window = recent_timestamps(&g, &parent_hash, TIMESTAMP_MEDIAN_WINDOW);
    if !rules::timestamp_ok(&median_window, header.timestamp, now) {
      return HeaderOutcome::InvalidTimestamp;
    }

    let cumulative_work = header.difficulty as u64 + parent_cumulative_work;
    g.headers.insert(hash, StoredHeader { header, parent: Some(parent_hash), cumulative_work });

    let best_work = g.headers[&g.best].cumulative_work;
    if cumulative_work > best_work {
      let reorg = parent_hash != g.best;
      g.best = hash;
      HeaderOutcome::Accepted { reorg }
    } else {
      HeaderOutcome::SideFork
    }
  }
}

fn ancestor_window(g: &Inner, from: &Digest32) -> (Vec<u64>, Vec<u32>) {
  let mut timestamps = Vec::with_capacity(DIFFICULTY_WINDOW_TIMESTAMPS);
  let mut difficulties = Vec::with_capacity(DIFFICULTY_WINDOW_DIFFICULTIES);
  let mut cursor = Some(*from);
  while let Some(hash) = cursor {
    let Some(stored) = g.headers.get(&hash) else { break };
    if timestamps.len() < DIFFICULTY_WINDOW_TIMESTAMPS {
      timestamps.push(stored.header.timestamp);
    }
    if difficulties.len() < DIFFICULTY_WINDOW_DIFFICULTIES {
      difficulties.push(stored.header.difficulty);
    }
    if timestamps.len() >= DIFFICULTY_WINDOW_TIMESTAMPS
      && difficulties.len() >= DIFFICULTY_WINDOW_DIFFICULTIES
    {
      break;
    }
    cursor = stored.parent;
  }
  (timestamps, difficulties)
}

fn recent_timestamps(g: &Inner, from: &Digest32, count: usize) -> Vec<u64> {
  let mut out = Vec::with_capacity(count);
  let mut cursor = Some(*from);
  while let (Some(hash), true) = (cursor, out.len() < count) {
    let Some(stored) = g.headers.get(&hash) else { break };
    out.push(stored.header.timestamp);
    cursor = stored.parent;
  }
  out
}

/// The outcome of resolving one election query (spec.md §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionResult {
  /// An EndOfElection was found and its proof verified: the tally is final.
  Final(BTreeMap<String, u64>),
  /// No reply carried a verifiable EndOfElection; best-effort tally from
  /// whatever verified votes were collected.
  Provisional(BTreeMap<String, u64>),
  /// No peer returned anything this store could verify at all.
  Unknown,
}

fn verify_record_proof<T>(
  headers: &LightHeaderStore,
  proof: &RecordProof<T>,
  leaf_hash: Digest32,
) -> bool {
  let Some(header) = headers.get_header(&proof.block_header_hash) else {
    return false;
  };
  merkle::verify(leaf_hash, &proof.proof, header.merkle_root)
}

/// Sends `GET_ELECTION_RES` to up to 5 random peers and aggregates the
/// replies that arrive within `timeout` (spec.md §4.6).
pub async fn query_election(
  network: &mut Network,
  headers: &LightHeaderStore,
  election_hash: Digest32,
  timeout: Duration,
) -> ElectionResult {
  let peers = network.random_peers(5).await;
  for peer in &peers {
    network.send_to(*peer, Message::GetElectionRes { election_hash });
  }
  if peers.is_empty() {
    return ElectionResult::Unknown;
  }

  let mut best_tally: Option<BTreeMap<String, u64>> = None;
  let mut final_tally: Option<BTreeMap<String, u64>> = None;
  let mut answered: HashSet<PeerId> = HashSet::new();
  let deadline = tokio::time::Instant::now() + timeout;

  while final_tally.is_none() && answered.len() < peers.len() {
    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    if remaining.is_zero() {
      break;
    }
    let event = tokio::time::timeout(remaining, wait_for_election_res(network)).await;
    let Ok(Some((hash, from, payload))) = event else { break };
    if hash != election_hash {
      continue;
    }
    if !peers.contains(&from) {
      continue;
    }
    answered.insert(from);

    if let Some(tally) = verify_reply(headers, election_hash, &payload) {
      match tally {
        VerifiedReply::Final(results) => final_tally = Some(results),
        VerifiedReply::Provisional(results) => {
          let better = best_tally
            .as_ref()
            .map(|cur| results.values().sum::<u64>() > cur.values().sum::<u64>())
            .unwrap_or(true);
          if better {
            best_tally = Some(results);
          }
        }
      }
    }
  }

  if let Some(results) = final_tally {
    ElectionResult::Final(results)
  } else if let Some(results) = best_tally {
    ElectionResult::Provisional(results)
  } else {
    ElectionResult::Unknown
  }
}

enum VerifiedReply {
  Final(BTreeMap<String, u64>),
  Provisional(BTreeMap<String, u64>),
}

/// Steps 1-3 of spec.md §4.6 applied to a single `ELECTION_RES` reply.
fn verify_reply(
  headers: &LightHeaderStore,
  election_hash: Digest32,
  payload: &ElectionResPayload,
) -> Option<VerifiedReply> {
  if let Some(start) = &payload.start {
    if start.record.hash() != election_hash {
      return None;
    }
    if !verify_record_proof(headers, start, start.record.hash()) {
      return None;
    }
  }

  let mut choices = Vec::new();
  for vote_proof in &payload.votes {
    let vote = &vote_proof.record;
    if vote.election_hash != election_hash || !vote.check_sig() {
      continue;
    }
    if let Some(start) = &payload.start {
      if !start.record.public_keys.contains(&vote.public_key) {
        continue;
      }
      if !start.record.choices.contains(&vote.choice) {
        continue;
      }
    }
    if !verify_record_proof(headers, vote_proof, vote.hash()) {
      continue;
    }
    choices.push(vote.choice.clone());
  }
  let provisional = rules::tally(choices.iter().map(String::as_str));

  if let Some(end) = &payload.end {
    if end.record.election_hash == election_hash
      && verify_record_proof(headers, end, end.record.hash())
    {
      return Some(VerifiedReply::Final(end.record.results.clone()));
    }
  }

  if payload.votes.is_empty() && payload.start.is_none() {
    return None;
  }
  Some(VerifiedReply::Provisional(provisional))
}

async fn wait_for_election_res(
  network: &mut Network,
) -> Option<(Digest32, PeerId, ElectionResPayload)> {
  // A light client owns its `Network` exclusively while a query is
  // outstanding, so draining `poll` here cannot race another consumer of
  // the same event stream.
  loop {
    match network.poll().await? {
      NetworkEvent::ElectionRes(hash, payload, from) => return Some((hash, from, payload)),
      other => {
        debug!(?other, "light client ignoring unrelated network event while querying");
        continue;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testutil::{gen_keypair, low_difficulty_genesis, mine_block};

  fn genesis_header() -> Header {
    low_difficulty_genesis().header
  }

  #[test]
  fn genesis_is_its_own_best() {
    let store = LightHeaderStore::new(genesis_header());
    assert_eq!(store.best_tip(), genesis_header().hash());
  }

  #[test]
  fn simple_extension_becomes_best() {
    let genesis = low_difficulty_genesis();
    let store = LightHeaderStore::new(genesis.header);
    let next = mine_block(&genesis, genesis.header.difficulty, 1000, vec![]);
    let outcome = store.accept_header(next.header, 10_000);
    assert_eq!(outcome, HeaderOutcome::Accepted { reorg: false });
    assert_eq!(store.best_tip(), next.hash());
  }

  #[test]
  fn unknown_parent_is_rejected() {
    let store = LightHeaderStore::new(genesis_header());
    let dangling = crate::block::Header {
      index: 5,
      previous_hash: Digest32::sha256(b"nowhere"),
      merkle_root: crate::crypto::ZERO_DIGEST,
      timestamp: 1,
      difficulty: 128,
      nonce: 0,
    };
    assert_eq!(store.accept_header(dangling, 10_000), HeaderOutcome::UnknownParent);
  }

  #[test]
  fn verify_reply_accepts_final_tally() {
    let kp = gen_keypair();
    let election = crate::record::Election {
      name: "E".into(),
      choices: vec!["A".into()],
      public_keys: vec![kp.public().clone()],
      end_time: 0,
    };
    let eh = election.hash();
    let genesis = low_difficulty_genesis();
    let block = mine_block(
      &genesis,
      genesis.header.difficulty,
      1000,
      vec![crate::record::Record::EndOfElection(crate::record::EndOfElection {
        election_hash: eh,
        results: BTreeMap::from([("A".to_string(), 1u64)]),
      })],
    );
    let headers = LightHeaderStore::new(genesis.header);
    headers.accept_header(block.header, 10_000);

    let end = block.records[0].as_end_of_election().unwrap().clone();
    let proof = RecordProof {
      record: end,
      block_header_hash: block.hash(),
      leaf_index: 0,
      proof: block.merkle_proof(0),
    };
    let payload = ElectionResPayload { start: None, votes: vec![], end: Some(proof) };
    match verify_reply(&headers, eh, &payload) {
      Some(VerifiedReply::Final(results)) => {
        assert_eq!(results.get("A"), Some(&1));
      }
      _ => panic!("expected a final tally"),
    }
  }
}

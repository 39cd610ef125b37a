//! Integration tests over the public `ChainStore` API: fork competition,
//! reorg mempool bookkeeping, and a full election lifecycle (open → vote →
//! close) across multiple blocks. Exercises the same surface a node's
//! network-event handler drives, without any sockets.

use civitas::{
  block::Block,
  chain::{AcceptOutcome, ChainStore},
  crypto::{Digest32, Keypair},
  record::{Election, EndOfElection, Record, Vote},
};

fn gen_keypair() -> Keypair {
  let mut rng = rand::thread_rng();
  Keypair::generate(&mut rng, 2048).expect("RSA key generation should not fail")
}

fn genesis() -> Block {
  Block::new(0, Digest32::from_bytes([0u8; 32]), 1_700_000_000, civitas::chain::rules::DEFAULT_DIFFICULTY, 0, vec![])
    .expect("empty genesis body is always valid")
}

fn mine(parent: &Block, difficulty: u32, timestamp: u64, records: Vec<Record>) -> Block {
  let mut block = Block::new(parent.header.index + 1, parent.hash(), timestamp, difficulty, 0, records)
    .expect("test blocks stay within the record/size limits");
  for nonce in 0..=u32::MAX {
    block.header.nonce = nonce;
    if block.header.satisfies_pow() {
      return block;
    }
  }
  panic!("exhausted nonce space without finding a valid proof of work");
}

#[test]
fn competing_forks_reorg_to_the_heavier_chain() {
  let gen = genesis();
  let store = ChainStore::new(gen.clone());

  let d1 = store.expected_difficulty(&gen.hash()).unwrap();
  let a1 = mine(&gen, d1, 1_000, vec![]);
  assert!(matches!(
    store.accept_block(&a1.encode(), 10_000),
    AcceptOutcome::Accepted { reorg: false, .. }
  ));

  // A side block at the same height never overtakes the current best.
  let b1 = mine(&gen, d1, 1_001, vec![]);
  assert!(matches!(
    store.accept_block(&b1.encode(), 10_000),
    AcceptOutcome::SideFork { .. }
  ));
  assert_eq!(store.best_tip(), a1.hash());

  // Extending the side fork past the current best triggers a reorg.
  let d2 = store.expected_difficulty(&b1.hash()).unwrap();
  let b2 = mine(&b1, d2, 1_002, vec![]);
  let outcome = store.accept_block(&b2.encode(), 10_000);
  assert!(matches!(outcome, AcceptOutcome::Accepted { reorg: true, .. }));
  assert_eq!(store.best_tip(), b2.hash());
  assert_eq!(store.height_of(&b2.hash()), Some(2));
}

#[test]
fn orphan_resolves_once_its_parent_arrives() {
  let gen = genesis();
  let store = ChainStore::new(gen.clone());

  let d1 = store.expected_difficulty(&gen.hash()).unwrap();
  let a1 = mine(&gen, d1, 1_000, vec![]);
  let d2_expected = {
    // Compute the child's difficulty against a throwaway store that already
    // has a1, since the real store doesn't have it yet.
    let probe = ChainStore::new(gen.clone());
    probe.accept_block(&a1.encode(), 10_000);
    probe.expected_difficulty(&a1.hash()).unwrap()
  };
  let a2 = mine(&a1, d2_expected, 1_001, vec![]);

  // Submit the child before the parent: it should be filed as an orphan.
  let outcome = store.accept_block(&a2.encode(), 10_000);
  assert!(matches!(outcome, AcceptOutcome::Orphan { missing_parent } if missing_parent == a1.hash()));
  assert_eq!(store.orphan_count(), 1);
  assert!(!store.contains_block(&a2.hash()));

  // Once the parent lands, the orphan should be pulled in automatically.
  let outcome = store.accept_block(&a1.encode(), 10_000);
  assert!(matches!(outcome, AcceptOutcome::Accepted { .. }));
  assert_eq!(store.best_tip(), a2.hash());
  assert_eq!(store.orphan_count(), 0);
}

#[test]
fn election_lifecycle_open_vote_close() {
  let gen = genesis();
  let store = ChainStore::new(gen.clone());
  let alice = gen_keypair();
  let bob = gen_keypair();

  let election = Election {
    name: "town council".into(),
    choices: vec!["yes".into(), "no".into()],
    public_keys: vec![alice.public().clone(), bob.public().clone()],
    end_time: 1_500,
  };
  let election_hash = election.hash();

  let d1 = store.expected_difficulty(&gen.hash()).unwrap();
  let with_election = mine(&gen, d1, 1_000, vec![Record::Election(election)]);
  store.accept_block(&with_election.encode(), 10_000);
  assert_eq!(store.open_elections().len(), 1);

  let vote_a = Vote::sign(&alice, election_hash, "yes".into());
  let vote_b = Vote::sign(&bob, election_hash, "yes".into());
  let d2 = store.expected_difficulty(&with_election.hash()).unwrap();
  let with_votes = mine(
    &with_election,
    d2,
    1_100,
    vec![Record::Vote(vote_a), Record::Vote(vote_b)],
  );
  assert!(matches!(
    store.accept_block(&with_votes.encode(), 10_000),
    AcceptOutcome::Accepted { .. }
  ));

  let tally = store.tally_for(&election_hash);
  assert_eq!(tally.get("yes"), Some(&2));
  assert_eq!(tally.get("no"), None);

  let end = EndOfElection { election_hash, results: tally.clone() };
  let d3 = store.expected_difficulty(&with_votes.hash()).unwrap();
  let closing = mine(&with_votes, d3, 1_600, vec![Record::EndOfElection(end)]);
  assert!(matches!(
    store.accept_block(&closing.encode(), 10_000),
    AcceptOutcome::Accepted { .. }
  ));
  assert!(store.open_elections().is_empty());
}

#[test]
fn duplicate_vote_from_the_same_key_is_rejected() {
  let gen = genesis();
  let store = ChainStore::new(gen.clone());
  let alice = gen_keypair();

  let election = Election {
    name: "referendum".into(),
    choices: vec!["a".into(), "b".into()],
    public_keys: vec![alice.public().clone()],
    end_time: 5_000,
  };
  let election_hash = election.hash();
  let d1 = store.expected_difficulty(&gen.hash()).unwrap();
  let with_election = mine(&gen, d1, 1_000, vec![Record::Election(election)]);
  store.accept_block(&with_election.encode(), 10_000);

  let first_vote = Vote::sign(&alice, election_hash, "a".into());
  let d2 = store.expected_difficulty(&with_election.hash()).unwrap();
  let with_vote = mine(&with_election, d2, 1_100, vec![Record::Vote(first_vote)]);
  store.accept_block(&with_vote.encode(), 10_000);

  let second_vote = Vote::sign(&alice, election_hash, "b".into());
  let d3 = store.expected_difficulty(&with_vote.hash()).unwrap();
  let double_vote = mine(&with_vote, d3, 1_200, vec![Record::Vote(second_vote)]);
  let outcome = store.accept_block(&double_vote.encode(), 10_000);
  assert!(matches!(
    outcome,
    AcceptOutcome::Rejected(civitas::chain::RejectReason::InvalidSignatures)
  ));
}

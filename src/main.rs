use {
  civitas::{
    block::{Block, Header},
    chain::{AcceptOutcome, ChainStore},
    cli::{CliOpts, Command},
    config::NodeConfig,
    crypto::{Digest32, Keypair, ZERO_DIGEST},
    light,
    miner::Miner,
    network::{wire::Message, Network, NetworkEvent},
    record::Record,
  },
  clap::Parser,
  std::sync::Arc,
  tracing::{debug, info, warn},
};

/// Fixed so that independently-started nodes agree on genesis without
/// exchanging a genesis file (spec.md Non-goals: "persistence across
/// restarts is acceptable", which extends to needing no on-disk genesis).
const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

fn genesis_block() -> Block {
  Block::new(0, ZERO_DIGEST, GENESIS_TIMESTAMP, civitas::chain::rules::DEFAULT_DIFFICULTY, 0, vec![])
    .expect("genesis block with no records always builds")
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
  let opts = CliOpts::parse();
  tracing_subscriber::fmt()
    .with_max_level(opts.log_level())
    .init();

  match opts.command {
    Command::Keygen { out, bits } => run_keygen(out, bits),
    Command::Run { listen, peer, config, key, mine, max_peers } => {
      let mut cfg = match config {
        Some(path) => NodeConfig::from_file(&path)?,
        None => NodeConfig {
          listen_addr: listen,
          bootstrap_peers: vec![],
          key_path: key.clone(),
          mine,
          max_peers,
          ping_interval_secs: civitas::config::DEFAULT_PING_INTERVAL_SECS,
        },
      };
      cfg.listen_addr = listen;
      cfg.bootstrap_peers.extend(peer);
      if key.is_some() {
        cfg.key_path = key;
      }
      cfg.mine = cfg.mine || mine;
      run_node(cfg).await
    }
    Command::Query { peer, election, timeout_secs } => {
      let election_hash = Digest32::try_from(civitas::b64::decode(&election)?.as_slice())?;
      run_light_query(peer, election_hash, timeout_secs).await
    }
  }
}

fn run_keygen(out: std::path::PathBuf, bits: usize) -> anyhow::Result<()> {
  let mut rng = rand::thread_rng();
  let keypair = Keypair::generate(&mut rng, bits)?;
  std::fs::write(&out, keypair.to_pkcs8_der()?)?;
  println!("{}", civitas::b64::encode(keypair.public().der_bytes()));
  info!("wrote private key to {}", out.display());
  Ok(())
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
  info!("starting civitas node on {}", cfg.listen_addr);
  let keypair = cfg.load_or_generate_keypair()?;
  info!(public_key = %civitas::b64::encode(keypair.public().der_bytes()), "voting identity");

  let genesis = genesis_block();
  info!(hash = %genesis.hash(), "genesis block");
  let store = Arc::new(ChainStore::new(genesis));

  let mut network = Network::bind(cfg.listen_addr, cfg.listen_addr.port()).await?;
  for addr in &cfg.bootstrap_peers {
    network.connect(*addr);
  }

  let miner_task = if cfg.mine {
    let miner = Miner::new(store.clone());
    let handle = miner.handle();
    let net_handle = network.handle();
    let task = tokio::spawn(async move {
      miner
        .run(|block| {
          info!(hash = %block.hash(), index = block.header.index, "mined a new block");
          net_handle.broadcast(Message::Block(block));
        })
        .await;
    });
    Some((task, handle))
  } else {
    None
  };

  loop {
    let Some(event) = network.poll().await else {
      warn!("network event stream closed, shutting down");
      break;
    };
    handle_event(&store, &network, event);
  }

  if let Some((task, should_mine)) = miner_task {
    should_mine.store(false, std::sync::atomic::Ordering::Relaxed);
    let _ = task.await;
  }
  Ok(())
}

fn handle_event(store: &Arc<ChainStore>, network: &Network, event: NetworkEvent) {
  match event {
    NetworkEvent::Vote(vote, from) => {
      if store.submit_record(Record::Vote(vote.clone()), now_unix()) {
        network.broadcast_except(Message::Vote(vote), from);
      } else {
        debug!(peer = from, "dropped vote, not forwarding");
      }
    }
    NetworkEvent::Election(election, from) => {
      if store.submit_record(Record::Election(election.clone()), now_unix()) {
        network.broadcast_except(Message::Election(election), from);
      } else {
        debug!(peer = from, "dropped election, not forwarding");
      }
    }
    NetworkEvent::Block(raw, from) => {
      let now = now_unix();
      match store.accept_block(&raw, now) {
        AcceptOutcome::Accepted { hash, .. } | AcceptOutcome::SideFork { hash } => {
          debug!(%hash, "accepted block from peer, relaying");
          if let Ok(block) = civitas::block::Block::decode(&raw) {
            network.broadcast_except(Message::Block(block), from);
          }
        }
        AcceptOutcome::Orphan { missing_parent } => {
          debug!(%missing_parent, "orphan block, requesting missing parent");
          network.send_to(from, Message::GetBlock { header_hash: missing_parent });
        }
        AcceptOutcome::Duplicate => {}
        AcceptOutcome::Rejected(reason) => {
          warn!(%reason, peer = from, "rejected block from peer");
        }
      }
    }
    NetworkEvent::GetBlock(header_hash, from) => match store.get_block(&header_hash) {
      Some(block) => network.send_to(from, Message::Block(block)),
      None => network.send_to(
        from,
        Message::ErrorResponse(format!("unknown block {header_hash}")),
      ),
    },
    NetworkEvent::GetLongestChain(start_index, from) => {
      let headers = collect_headers_from_tip(store, start_index);
      network.send_to(from, Message::LongestChain(headers));
    }
    NetworkEvent::LongestChain(headers, from) => {
      for header in headers {
        if !store.contains_block(&header.hash()) {
          network.send_to(from, Message::GetBlock { header_hash: header.hash() });
        }
      }
    }
    NetworkEvent::GetElectionRes(election_hash, from) => {
      let payload = build_election_res(store, election_hash);
      network.send_to(from, Message::ElectionRes { election_hash, payload });
    }
    NetworkEvent::ElectionRes(election_hash, payload, _from) => {
      debug!(%election_hash, votes = payload.votes.len(), "received unsolicited election result");
    }
    NetworkEvent::ErrorResponse(msg, from) => {
      debug!(peer = from, %msg, "peer reported an error");
    }
    NetworkEvent::PeerConnected(id, addr) => info!(peer = id, %addr, "peer connected"),
    NetworkEvent::PeerDisconnected(id) => info!(peer = id, "peer disconnected"),
  }
}

/// Walks back from the best tip collecting headers at or above
/// `start_index`, for a `GET_LONGEST_CHAIN` reply (spec.md §4.5).
fn collect_headers_from_tip(store: &ChainStore, start_index: u32) -> Vec<Header> {
  let mut headers = Vec::new();
  let mut cursor = Some(store.best_tip());
  while let Some(hash) = cursor {
    let Some(block) = store.get_block(&hash) else { break };
    if block.header.index < start_index {
      break;
    }
    headers.push(block.header);
    cursor = if block.header.index == 0 { None } else { Some(block.header.previous_hash) };
  }
  headers.reverse();
  headers
}

/// Scans back from the best tip for the blocks committing `election_hash`'s
/// opening, votes and closing, assembling Merkle proofs for each (spec.md
/// §4.6). A production node would keep a record-hash → block index instead
/// of this linear walk; correctness over the reference chain depth is what
/// matters here.
fn build_election_res(
  store: &ChainStore,
  election_hash: Digest32,
) -> civitas::network::wire::ElectionResPayload {
  use civitas::network::wire::RecordProof;

  let mut start = None;
  let mut end = None;
  let mut votes = Vec::new();

  let mut cursor = Some(store.best_tip());
  while let Some(hash) = cursor {
    let Some(block) = store.get_block(&hash) else { break };
    for (leaf_index, record) in block.records.iter().enumerate() {
      match record {
        Record::Election(e) if e.hash() == election_hash => {
          start = Some(RecordProof {
            record: e.clone(),
            block_header_hash: hash,
            leaf_index: leaf_index as u32,
            proof: block.merkle_proof(leaf_index),
          });
        }
        Record::Vote(v) if v.election_hash == election_hash => {
          votes.push(RecordProof {
            record: v.clone(),
            block_header_hash: hash,
            leaf_index: leaf_index as u32,
            proof: block.merkle_proof(leaf_index),
          });
        }
        Record::EndOfElection(e) if e.election_hash == election_hash => {
          end = Some(RecordProof {
            record: e.clone(),
            block_header_hash: hash,
            leaf_index: leaf_index as u32,
            proof: block.merkle_proof(leaf_index),
          });
        }
        _ => {}
      }
    }
    cursor = if block.header.index == 0 { None } else { Some(block.header.previous_hash) };
  }

  civitas::network::wire::ElectionResPayload { start, votes, end }
}

fn now_unix() -> u64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}

/// Runs a one-shot light-node election query (spec.md §4.6): connects to
/// the given peers, syncs headers off their unsolicited `GET_LONGEST_CHAIN`
/// reply, then fans `GET_ELECTION_RES` out and prints the aggregated tally.
async fn run_light_query(
  peers: Vec<std::net::SocketAddr>,
  election_hash: Digest32,
  timeout_secs: u64,
) -> anyhow::Result<()> {
  let mut network = Network::bind("0.0.0.0:0".parse().unwrap(), 0).await?;
  for addr in &peers {
    network.connect(*addr);
  }

  let header_store = light::LightHeaderStore::new(genesis_block().header);
  let sync_deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
  loop {
    let remaining = sync_deadline.saturating_duration_since(tokio::time::Instant::now());
    if remaining.is_zero() {
      break;
    }
    match tokio::time::timeout(remaining, network.poll()).await {
      Ok(Some(NetworkEvent::LongestChain(headers, _))) => {
        for header in headers {
          header_store.accept_header(header, now_unix());
        }
      }
      Ok(Some(_)) => continue,
      _ => break,
    }
  }

  let result = light::query_election(
    &mut network,
    &header_store,
    election_hash,
    std::time::Duration::from_secs(timeout_secs),
  )
  .await;

  match result {
    light::ElectionResult::Final(tally) => println!("final: {tally:?}"),
    light::ElectionResult::Provisional(tally) => println!("provisional (not yet closed): {tally:?}"),
    light::ElectionResult::Unknown => println!("no verifiable result from any peer"),
  }
  Ok(())
}

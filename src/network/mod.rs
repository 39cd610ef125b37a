//! TCP network layer: one listener, one reader task per peer, flood
//! broadcast, minute-interval liveness pings (spec.md §4.5).
//!
//! Grounded on the teacher's `Network` (netin/netout mpsc channel pair
//! driving a `tokio::select!` loop), generalized from libp2p/gossipsub to
//! the plain length-prefixed TCP protocol spec.md §4.5 specifies. Peer
//! address-list gossip during bootstrap is simplified to "connect, then
//! request the longest chain" — the original's recursive peer-list dial-out
//! is networking topology glue, not part of the replicated state machine.

pub mod peer;
pub mod wire;

use {
  crate::{block::Header, crypto::Digest32, error::WireError, record::{Election, Vote}},
  peer::{Peer, PeerId},
  std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
      atomic::{AtomicU64, Ordering},
      Arc,
    },
    time::Duration,
  },
  tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Mutex},
  },
  tracing::{debug, warn},
  wire::{ElectionResPayload, Message},
};

pub const PING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum NetworkEvent {
  Vote(Vote, PeerId),
  Election(Election, PeerId),
  /// Raw `header ∥ body` bytes; decoding and validation happen in the
  /// chain store so every acceptance path (network or miner) runs the same
  /// rules exactly once.
  Block(Vec<u8>, PeerId),
  GetBlock(Digest32, PeerId),
  GetLongestChain(u32, PeerId),
  LongestChain(Vec<Header>, PeerId),
  GetElectionRes(Digest32, PeerId),
  ElectionRes(Digest32, ElectionResPayload, PeerId),
  ErrorResponse(String, PeerId),
  PeerConnected(PeerId, SocketAddr),
  PeerDisconnected(PeerId),
}

pub enum NetworkCommand {
  Connect(SocketAddr),
  Broadcast { message: Message, except: Option<PeerId> },
  SendTo { peer: PeerId, message: Message },
}

type PeerTable = Arc<Mutex<HashMap<PeerId, Arc<Peer>>>>;

/// A cheaply-cloneable handle onto the command side of a [`Network`], for
/// background tasks (the miner) that only ever need to broadcast, never to
/// poll events.
#[derive(Clone)]
pub struct NetworkHandle {
  commands: mpsc::UnboundedSender<NetworkCommand>,
}

impl NetworkHandle {
  pub fn broadcast(&self, message: Message) {
    let _ = self.commands.send(NetworkCommand::Broadcast { message, except: None });
  }

  pub fn broadcast_except(&self, message: Message, except: PeerId) {
    let _ = self.commands.send(NetworkCommand::Broadcast {
      message,
      except: Some(except),
    });
  }

  pub fn send_to(&self, peer: PeerId, message: Message) {
    let _ = self.commands.send(NetworkCommand::SendTo { peer, message });
  }

  pub fn connect(&self, addr: SocketAddr) {
    let _ = self.commands.send(NetworkCommand::Connect(addr));
  }
}

pub struct Network {
  events: mpsc::UnboundedReceiver<NetworkEvent>,
  commands: mpsc::UnboundedSender<NetworkCommand>,
  peers: PeerTable,
}

impl Network {
  /// Binds `listen_addr` and starts the accept loop, the command
  /// processor, and the minute-interval ping task. `my_listen_port` is
  /// advertised in `INIT`.
  pub async fn bind(
    listen_addr: SocketAddr,
    my_listen_port: u16,
  ) -> std::io::Result<Self> {
    let listener = TcpListener::bind(listen_addr).await?;
    let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));
    let next_peer_id = Arc::new(AtomicU64::new(1));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();

    {
      let peers = peers.clone();
      let events_tx = events_tx.clone();
      let next_peer_id = next_peer_id.clone();
      tokio::spawn(async move {
        loop {
          match listener.accept().await {
            Ok((socket, addr)) => {
              let id = next_peer_id.fetch_add(1, Ordering::Relaxed);
              spawn_connection(
                socket,
                addr,
                peers.clone(),
                id,
                events_tx.clone(),
                my_listen_port,
                true,
              );
            }
            Err(e) => warn!("accept failed: {e}"),
          }
        }
      });
    }

    {
      let peers = peers.clone();
      let events_tx = events_tx.clone();
      let next_peer_id = next_peer_id.clone();
      tokio::spawn(async move {
        while let Some(cmd) = commands_rx.recv().await {
          match cmd {
            NetworkCommand::Connect(addr) => {
              match TcpStream::connect(addr).await {
                Ok(socket) => {
                  let id = next_peer_id.fetch_add(1, Ordering::Relaxed);
                  spawn_connection(
                    socket,
                    addr,
                    peers.clone(),
                    id,
                    events_tx.clone(),
                    my_listen_port,
                    false,
                  );
                }
                Err(e) => warn!("failed to connect to {addr}: {e}"),
              }
            }
            NetworkCommand::Broadcast { message, except } => {
              let table = peers.lock().await;
              for (id, peer) in table.iter() {
                if Some(*id) == except {
                  continue;
                }
                if let Err(e) = peer.send(&message).await {
                  debug!(peer = id, "broadcast send failed: {e}");
                }
              }
            }
            NetworkCommand::SendTo { peer, message } => {
              let target = peers.lock().await.get(&peer).cloned();
              if let Some(target) = target {
                if let Err(e) = target.send(&message).await {
                  debug!(peer, "send failed: {e}");
                }
              }
            }
          }
        }
      });
    }

    {
      let peers = peers.clone();
      let events_tx = events_tx.clone();
      tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        loop {
          interval.tick().await;
          let table = peers.lock().await.clone();
          for (id, peer) in table {
            if peer.send(&Message::Ping).await.is_err() {
              warn!(peer = id, "ping failed, dropping peer");
              peers.lock().await.remove(&id);
              let _ = events_tx.send(NetworkEvent::PeerDisconnected(id));
            } else {
              peer.mark_suspect();
            }
          }
        }
      });
    }

    Ok(Self { events: events_rx, commands: commands_tx, peers })
  }

  pub fn connect(&self, addr: SocketAddr) {
    let _ = self.commands.send(NetworkCommand::Connect(addr));
  }

  pub fn handle(&self) -> NetworkHandle {
    NetworkHandle { commands: self.commands.clone() }
  }

  pub fn broadcast_except(&self, message: Message, except: PeerId) {
    let _ = self.commands.send(NetworkCommand::Broadcast {
      message,
      except: Some(except),
    });
  }

  pub fn broadcast(&self, message: Message) {
    let _ = self.commands.send(NetworkCommand::Broadcast { message, except: None });
  }

  pub fn send_to(&self, peer: PeerId, message: Message) {
    let _ = self.commands.send(NetworkCommand::SendTo { peer, message });
  }

  pub async fn poll(&mut self) -> Option<NetworkEvent> {
    self.events.recv().await
  }

  /// Up to `n` randomly-chosen connected peers, for the light node's
  /// multi-peer `GET_ELECTION_RES` fan-out (spec.md §4.6).
  pub async fn random_peers(&self, n: usize) -> Vec<PeerId> {
    use rand::seq::IteratorRandom;
    let table = self.peers.lock().await;
    let mut rng = rand::thread_rng();
    table.keys().copied().choose_multiple(&mut rng, n)
  }

  pub async fn peer_count(&self) -> usize {
    self.peers.lock().await.len()
  }
}

#[allow(clippy::too_many_arguments)]
fn spawn_connection(
  socket: TcpStream,
  addr: SocketAddr,
  peers: PeerTable,
  id: PeerId,
  events_tx: mpsc::UnboundedSender<NetworkEvent>,
  my_listen_port: u16,
  inbound: bool,
) {
  tokio::spawn(async move {
    let _ = socket.set_nodelay(true);
    let (mut read_half, write_half) = socket.into_split();
    let now = now_unix();
    let peer = Arc::new(Peer::new(id, addr, write_half, now));
    peers.lock().await.insert(id, peer.clone());
    let _ = events_tx.send(NetworkEvent::PeerConnected(id, addr));

    if !inbound {
      if peer.send(&Message::Init { port: my_listen_port }).await.is_err() {
        peers.lock().await.remove(&id);
        return;
      }
      peer.send(&Message::GetLongestChain { start_index: 0 }).await.ok();
    }

    loop {
      match wire::read_frame(&mut read_half).await {
        Ok(message) => {
          peer.touch(now_unix());
          if let Err(e) = dispatch(&peer, message, &events_tx, my_listen_port).await {
            debug!(peer = id, "error handling message: {e}");
          }
        }
        Err(e) => {
          debug!(peer = id, "connection closed: {e}");
          break;
        }
      }
    }

    peers.lock().await.remove(&id);
    let _ = events_tx.send(NetworkEvent::PeerDisconnected(id));
  });
}

async fn dispatch(
  peer: &Arc<Peer>,
  message: Message,
  events_tx: &mpsc::UnboundedSender<NetworkEvent>,
  my_listen_port: u16,
) -> Result<(), WireError> {
  let id = peer.id;
  match message {
    Message::Init { port } => {
      peer.set_listen_port(port);
      peer.send(&Message::Init { port: my_listen_port }).await?;
    }
    Message::Vote(vote) => {
      events_tx.send(NetworkEvent::Vote(vote, id)).ok();
    }
    Message::Election(election) => {
      events_tx.send(NetworkEvent::Election(election, id)).ok();
    }
    Message::Block(block) => {
      events_tx.send(NetworkEvent::Block(block.encode(), id)).ok();
    }
    Message::GetBlock { header_hash } => {
      events_tx.send(NetworkEvent::GetBlock(header_hash, id)).ok();
    }
    Message::GetLongestChain { start_index } => {
      events_tx.send(NetworkEvent::GetLongestChain(start_index, id)).ok();
    }
    Message::LongestChain(headers) => {
      events_tx.send(NetworkEvent::LongestChain(headers, id)).ok();
    }
    Message::GetElectionRes { election_hash } => {
      events_tx.send(NetworkEvent::GetElectionRes(election_hash, id)).ok();
    }
    Message::ElectionRes { election_hash, payload } => {
      events_tx.send(NetworkEvent::ElectionRes(election_hash, payload, id)).ok();
    }
    Message::ErrorResponse(msg) => {
      events_tx.send(NetworkEvent::ErrorResponse(msg, id)).ok();
    }
    Message::Ping => peer.send(&Message::Pong).await?,
    Message::Pong => {}
  }
  Ok(())
}

fn now_unix() -> u64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}

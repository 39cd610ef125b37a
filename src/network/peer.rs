//! Per-peer connection state: the write-half behind a send mutex, and
//! liveness bookkeeping (spec.md §4.5 "Liveness").

use {
  super::wire::{self, Message},
  crate::error::WireError,
  std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
  },
  tokio::{net::tcp::OwnedWriteHalf, sync::Mutex},
};

pub type PeerId = u64;

/// One connected peer. The reader half lives in its own spawned task; this
/// handle is shared so the broadcast path and the reader task's "send a
/// reply" path never race on the socket (spec.md §4.5: "a single send
/// mutex per node serializes writes").
pub struct Peer {
  pub id: PeerId,
  pub addr: SocketAddr,
  /// The port the peer told us it listens on, if it ever sent INIT.
  pub listen_port: AtomicU64,
  writer: Mutex<OwnedWriteHalf>,
  last_seen: AtomicU64,
  suspect: AtomicBool,
}

impl Peer {
  pub fn new(id: PeerId, addr: SocketAddr, writer: OwnedWriteHalf, now: u64) -> Self {
    Self {
      id,
      addr,
      listen_port: AtomicU64::new(0),
      writer: Mutex::new(writer),
      last_seen: AtomicU64::new(now),
      suspect: AtomicBool::new(false),
    }
  }

  pub async fn send(&self, message: &Message) -> Result<(), WireError> {
    let mut w = self.writer.lock().await;
    wire::write_frame(&mut *w, message).await
  }

  pub fn touch(&self, now: u64) {
    self.last_seen.store(now, Ordering::Relaxed);
    self.suspect.store(false, Ordering::Relaxed);
  }

  pub fn last_seen(&self) -> u64 {
    self.last_seen.load(Ordering::Relaxed)
  }

  pub fn mark_suspect(&self) {
    self.suspect.store(true, Ordering::Relaxed);
  }

  pub fn is_suspect(&self) -> bool {
    self.suspect.load(Ordering::Relaxed)
  }

  pub fn set_listen_port(&self, port: u16) {
    self.listen_port.store(port as u64, Ordering::Relaxed);
  }
}

//! Command-line surface: `run` starts a node, `keygen` writes a fresh voting
//! keypair to disk (spec.md §1 Non-goals: "process supervision, command-line
//! flag parsing" are explicitly out of the core, but still need a CLI shell).
//!
//! Grounded on the teacher's `CliOpts` (`clap::Parser`, `-v`/`-vv` verbosity
//! counting), narrowed from validator/genesis/RPC flags to this system's
//! listen address, bootstrap peers and mining toggle.

use {
  clap::Parser,
  std::{net::SocketAddr, path::PathBuf},
};

#[derive(Debug, Parser)]
#[clap(name = "civitas", version, about = "A peer-to-peer election blockchain")]
pub struct CliOpts {
  #[clap(subcommand)]
  pub command: Command,

  #[clap(
    short,
    long,
    global = true,
    parse(from_occurrences),
    help = "use verbose output (-vv very verbose output)"
  )]
  pub verbose: u64,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
  /// Starts a node: binds the listener, dials bootstrap peers, and
  /// optionally mines.
  Run {
    #[clap(long, help = "address to listen on", default_value = "0.0.0.0:44668")]
    listen: SocketAddr,

    #[clap(long, help = "address of a known peer to bootstrap from")]
    peer: Vec<SocketAddr>,

    #[clap(long, help = "path to a JSON node config file; flags override it")]
    config: Option<PathBuf>,

    #[clap(long, help = "path to a PKCS#8 DER RSA private key for this node's voting identity")]
    key: Option<PathBuf>,

    #[clap(long, help = "mine blocks from the mempool")]
    mine: bool,

    #[clap(long, help = "maximum number of connected peers", default_value = "50")]
    max_peers: usize,
  },

  /// Generates a fresh RSA keypair and writes the private key (PKCS#8 DER)
  /// to `out`, printing the SubjectPublicKeyInfo (base64) to stdout.
  Keygen {
    #[clap(long, parse(from_os_str))]
    out: PathBuf,

    #[clap(long, default_value = "2048")]
    bits: usize,
  },

  /// Light-node election query: fans `GET_ELECTION_RES` out to the given
  /// peers and prints the aggregated, Merkle-verified tally.
  Query {
    #[clap(long, help = "peer to query; repeatable")]
    peer: Vec<SocketAddr>,

    #[clap(long, help = "election hash, base64")]
    election: String,

    #[clap(long, default_value = "10")]
    timeout_secs: u64,
  },
}

impl CliOpts {
  pub fn log_level(&self) -> tracing::Level {
    match self.verbose {
      0 => tracing::Level::INFO,
      1 => tracing::Level::DEBUG,
      _ => tracing::Level::TRACE,
    }
  }
}

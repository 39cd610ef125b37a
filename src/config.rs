//! Node configuration: listen address, bootstrap peers, the node's voting
//! keypair, and mining/networking tunables (spec.md §1 "out of scope... log
//! formatting" still leaves config loading itself as ambient plumbing).
//!
//! Grounded on the teacher's `cli.rs`/`CliOpts` flag surface, generalized
//! from Terra's validator/RPC/chain-id flags to this system's listen
//! address, bootstrap-peer list and mining toggle, plus an optional
//! on-disk PKCS#8 keypair the way the teacher loads its signing key.

use {
  crate::{crypto::Keypair, error::ConfigError},
  serde::{Deserialize, Serialize},
  std::{net::SocketAddr, path::PathBuf},
};

/// Default RSA modulus size for a freshly generated node keypair.
pub const DEFAULT_KEY_BITS: usize = 2048;
pub const DEFAULT_MAX_PEERS: usize = 50;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 60;

/// On-disk/CLI-sourced configuration, deserializable so operators can also
/// hand it a JSON file instead of flags.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
  pub listen_addr: SocketAddr,
  #[serde(default)]
  pub bootstrap_peers: Vec<SocketAddr>,
  /// Path to a PKCS#8 DER-encoded RSA private key; `None` generates a fresh
  /// in-memory keypair each run (spec.md Non-goals: "persistence across
  /// restarts is acceptable" — the same holds for the voting identity of a
  /// node that also acts as a client).
  #[serde(default)]
  pub key_path: Option<PathBuf>,
  #[serde(default)]
  pub mine: bool,
  #[serde(default = "default_max_peers")]
  pub max_peers: usize,
  #[serde(default = "default_ping_interval_secs")]
  pub ping_interval_secs: u64,
}

fn default_max_peers() -> usize {
  DEFAULT_MAX_PEERS
}

fn default_ping_interval_secs() -> u64 {
  DEFAULT_PING_INTERVAL_SECS
}

impl NodeConfig {
  pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path)
      .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
    Ok(serde_json::from_str(&text)?)
  }

  /// Loads the configured keypair from disk, or generates a fresh one.
  pub fn load_or_generate_keypair(&self) -> Result<Keypair, ConfigError> {
    match &self.key_path {
      Some(path) => {
        let der = std::fs::read(path)
          .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        Ok(Keypair::from_pkcs8_der(&der)?)
      }
      None => {
        let mut rng = rand::thread_rng();
        Ok(Keypair::generate(&mut rng, DEFAULT_KEY_BITS)?)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn deserializes_with_defaults() {
    let json = r#"{"listen_addr": "127.0.0.1:9000"}"#;
    let cfg: NodeConfig = serde_json::from_str(json).unwrap();
    assert_eq!(cfg.max_peers, DEFAULT_MAX_PEERS);
    assert_eq!(cfg.ping_interval_secs, DEFAULT_PING_INTERVAL_SECS);
    assert!(!cfg.mine);
    assert!(cfg.bootstrap_peers.is_empty());
  }
}

//! Per-module error taxonomies.
//!
//! Validation outcomes that are a normal part of consensus (a bad block, an
//! unvotable vote) are *not* represented here — those are booleans or
//! `RejectReason`s consumed locally, never exceptions. These types are for
//! genuine failures: malformed input that can't even be parsed, I/O errors,
//! and key-material problems.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
  #[error("malformed RSA public key: {0}")]
  MalformedPublicKey(rsa::pkcs8::spki::Error),

  #[error("malformed RSA private key: {0}")]
  MalformedPrivateKey(rsa::pkcs8::Error),

  #[error("malformed signature")]
  MalformedSignature,

  #[error("RSA key generation failed: {0}")]
  KeyGeneration(rsa::Error),
}

#[derive(Debug, Error)]
pub enum RecordError {
  #[error("malformed record JSON: {0}")]
  Json(#[from] serde_json::Error),

  #[error("unknown record type tag: {0}")]
  UnknownType(String),

  #[error("invalid base64 field: {0}")]
  Base64(#[from] base64::DecodeError),
}

#[derive(Debug, Error)]
pub enum BlockError {
  #[error("header is {0} bytes, expected 84")]
  WrongHeaderLength(usize),

  #[error("block body is not valid JSON: {0}")]
  Body(#[from] serde_json::Error),

  #[error(transparent)]
  Record(#[from] RecordError),

  #[error("block has {0} records, exceeding 2^MAX_LEVELS")]
  TooManyRecords(usize),
}

#[derive(Debug, Error)]
pub enum WireError {
  #[error("frame of {0} bytes exceeds the maximum frame size")]
  FrameTooLarge(usize),

  #[error("unknown message type tag {0}")]
  UnknownMessageType(u16),

  #[error("frame too short for its declared type")]
  Truncated,

  #[error("connection closed")]
  ConnectionClosed,

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Block(#[from] BlockError),

  #[error(transparent)]
  Record(#[from] RecordError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file {0}: {1}")]
  Read(String, std::io::Error),

  #[error("failed to parse config file: {0}")]
  Parse(#[from] serde_json::Error),

  #[error(transparent)]
  Crypto(#[from] CryptoError),
}

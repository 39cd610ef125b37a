//! Thin convenience wrapper over `base64`'s 0.21 `Engine` API so call sites
//! read like the simple `encode`/`decode` free functions every wire format
//! in spec.md §6 assumes ("Binary fields ... are base64 in JSON").

use base64::{engine::general_purpose::STANDARD, Engine as _};

pub fn encode(data: impl AsRef<[u8]>) -> String {
  STANDARD.encode(data)
}

pub fn decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
  STANDARD.decode(s)
}

/// `#[serde(with = "crate::b64::serde_vec")]` for a `Vec<u8>` field that
/// should round-trip as a base64 string on the wire (spec.md §6).
pub mod serde_vec {
  use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(
    bytes: &[u8],
    s: S,
  ) -> Result<S::Ok, S::Error> {
    s.serialize_str(&super::encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    d: D,
  ) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(d)?;
    super::decode(&s).map_err(D::Error::custom)
  }
}

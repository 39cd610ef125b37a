//! Wire framing and the 12 message types (spec.md §4.5).
//!
//! Grounded on the teacher's use of length-prefixed framing conventions
//! (`primitives/stream.rs`'s adapter style) generalized to the custom
//! two-byte-length/two-byte-type protocol spec.md mandates in place of
//! libp2p/yamux multiplexing.

use {
  crate::{
    block::Block,
    crypto::Digest32,
    error::WireError,
    merkle::ProofStep,
    record::{Election, EndOfElection, Vote},
  },
  serde::{Deserialize, Serialize},
  tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

/// Frames larger than this are rejected outright; well above one block's
/// `MAX_BLOCK_SIZE` body plus header.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
  Init = 1,
  Vote = 2,
  Block = 3,
  Election = 4,
  LongestChain = 5,
  GetLongestChain = 6,
  GetBlock = 7,
  GetElectionRes = 8,
  ElectionRes = 9,
  ErrorResponse = 10,
  Ping = 11,
  Pong = 12,
}

impl MessageType {
  fn from_u16(v: u16) -> Result<Self, WireError> {
    Ok(match v {
      1 => Self::Init,
      2 => Self::Vote,
      3 => Self::Block,
      4 => Self::Election,
      5 => Self::LongestChain,
      6 => Self::GetLongestChain,
      7 => Self::GetBlock,
      8 => Self::GetElectionRes,
      9 => Self::ElectionRes,
      10 => Self::ErrorResponse,
      11 => Self::Ping,
      12 => Self::Pong,
      other => return Err(WireError::UnknownMessageType(other)),
    })
  }
}

/// A Merkle-proven record, the unit `ELECTION_RES` carries (spec.md §4.6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordProof<T> {
  pub record: T,
  pub block_header_hash: Digest32,
  pub leaf_index: u32,
  pub proof: Vec<ProofStep>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElectionResPayload {
  pub start: Option<RecordProof<Election>>,
  pub votes: Vec<RecordProof<Vote>>,
  pub end: Option<RecordProof<EndOfElection>>,
}

/// A fully decoded message, paired with its type tag.
#[derive(Clone, Debug)]
pub enum Message {
  Init { port: u16 },
  Vote(Vote),
  Block(Block),
  Election(Election),
  LongestChain(Vec<crate::block::Header>),
  GetLongestChain { start_index: u32 },
  GetBlock { header_hash: Digest32 },
  GetElectionRes { election_hash: Digest32 },
  ElectionRes { election_hash: Digest32, payload: ElectionResPayload },
  ErrorResponse(String),
  Ping,
  Pong,
}

impl Message {
  fn message_type(&self) -> MessageType {
    match self {
      Message::Init { .. } => MessageType::Init,
      Message::Vote(_) => MessageType::Vote,
      Message::Block(_) => MessageType::Block,
      Message::Election(_) => MessageType::Election,
      Message::LongestChain(_) => MessageType::LongestChain,
      Message::GetLongestChain { .. } => MessageType::GetLongestChain,
      Message::GetBlock { .. } => MessageType::GetBlock,
      Message::GetElectionRes { .. } => MessageType::GetElectionRes,
      Message::ElectionRes { .. } => MessageType::ElectionRes,
      Message::ErrorResponse(_) => MessageType::ErrorResponse,
      Message::Ping => MessageType::Ping,
      Message::Pong => MessageType::Pong,
    }
  }

  /// Encodes this message's payload (type tag ∥ body), without the
  /// outer frame length prefix.
  pub fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
    let mut out = (self.message_type() as u16).to_be_bytes().to_vec();
    match self {
      Message::Init { port } => out.extend_from_slice(&port.to_be_bytes()),
      Message::Vote(vote) => out.extend_from_slice(vote.canonical_json().as_bytes()),
      Message::Block(block) => out.extend_from_slice(&block.encode()),
      Message::Election(election) => {
        out.extend_from_slice(election.canonical_json().as_bytes())
      }
      Message::LongestChain(headers) => {
        for h in headers {
          out.extend_from_slice(&h.encode());
        }
      }
      Message::GetLongestChain { start_index } => {
        out.extend_from_slice(&start_index.to_be_bytes())
      }
      Message::GetBlock { header_hash } => out.extend_from_slice(header_hash.as_bytes()),
      Message::GetElectionRes { election_hash } => {
        out.extend_from_slice(election_hash.as_bytes())
      }
      Message::ElectionRes { election_hash, payload } => {
        out.extend_from_slice(election_hash.as_bytes());
        out.extend_from_slice(
          &serde_json::to_vec(payload).map_err(crate::error::RecordError::from)?,
        );
      }
      Message::ErrorResponse(msg) => out.extend_from_slice(msg.as_bytes()),
      Message::Ping | Message::Pong => {}
    }
    Ok(out)
  }

  /// Decodes a payload (type tag ∥ body) into a message.
  pub fn decode_payload(bytes: &[u8]) -> Result<Self, WireError> {
    if bytes.len() < 2 {
      return Err(WireError::Truncated);
    }
    let ty = MessageType::from_u16(u16::from_be_bytes([bytes[0], bytes[1]]))?;
    let body = &bytes[2..];
    Ok(match ty {
      MessageType::Init => {
        if body.len() < 2 {
          return Err(WireError::Truncated);
        }
        Message::Init { port: u16::from_be_bytes([body[0], body[1]]) }
      }
      MessageType::Vote => {
        let record = crate::record::Record::from_canonical_json(
          std::str::from_utf8(body).map_err(|_| WireError::Truncated)?,
        )?;
        match record {
          crate::record::Record::Vote(v) => Message::Vote(v),
          _ => return Err(WireError::Truncated),
        }
      }
      MessageType::Block => Message::Block(Block::decode(body)?),
      MessageType::Election => {
        let record = crate::record::Record::from_canonical_json(
          std::str::from_utf8(body).map_err(|_| WireError::Truncated)?,
        )?;
        match record {
          crate::record::Record::Election(e) => Message::Election(e),
          _ => return Err(WireError::Truncated),
        }
      }
      MessageType::LongestChain => {
        if body.len() % crate::block::HEADER_LEN != 0 {
          return Err(WireError::Truncated);
        }
        let headers = body
          .chunks_exact(crate::block::HEADER_LEN)
          .map(crate::block::Header::decode)
          .collect::<Result<Vec<_>, _>>()?;
        Message::LongestChain(headers)
      }
      MessageType::GetLongestChain => {
        if body.len() < 4 {
          return Err(WireError::Truncated);
        }
        Message::GetLongestChain {
          start_index: u32::from_be_bytes(body[0..4].try_into().unwrap()),
        }
      }
      MessageType::GetBlock => {
        if body.len() < 32 {
          return Err(WireError::Truncated);
        }
        Message::GetBlock {
          header_hash: Digest32::try_from(&body[0..32]).map_err(|_| WireError::Truncated)?,
        }
      }
      MessageType::GetElectionRes => {
        if body.len() < 32 {
          return Err(WireError::Truncated);
        }
        Message::GetElectionRes {
          election_hash: Digest32::try_from(&body[0..32]).map_err(|_| WireError::Truncated)?,
        }
      }
      MessageType::ElectionRes => {
        if body.len() < 32 {
          return Err(WireError::Truncated);
        }
        let election_hash =
          Digest32::try_from(&body[0..32]).map_err(|_| WireError::Truncated)?;
        let payload: ElectionResPayload = serde_json::from_slice(&body[32..])
          .map_err(crate::error::RecordError::from)?;
        Message::ElectionRes { election_hash, payload }
      }
      MessageType::ErrorResponse => Message::ErrorResponse(
        String::from_utf8_lossy(body).into_owned(),
      ),
      MessageType::Ping => Message::Ping,
      MessageType::Pong => Message::Pong,
    })
  }
}

/// Writes `len(2B) ∥ payload` to `w` and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
  w: &mut W,
  message: &Message,
) -> Result<(), WireError> {
  let payload = message.encode_payload()?;
  if payload.len() > MAX_FRAME_LEN {
    return Err(WireError::FrameTooLarge(payload.len()));
  }
  w.write_all(&(payload.len() as u16).to_be_bytes()).await?;
  w.write_all(&payload).await?;
  w.flush().await?;
  Ok(())
}

/// Reads one `len(2B) ∥ payload` frame from `r`. A partial receive is
/// handled by `AsyncReadExt::read_exact` buffering across calls internally.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, WireError> {
  let mut len_buf = [0u8; 2];
  match r.read_exact(&mut len_buf).await {
    Ok(_) => {}
    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
      return Err(WireError::ConnectionClosed)
    }
    Err(e) => return Err(e.into()),
  }
  let len = u16::from_be_bytes(len_buf) as usize;
  if len > MAX_FRAME_LEN {
    return Err(WireError::FrameTooLarge(len));
  }
  let mut payload = vec![0u8; len];
  r.read_exact(&mut payload).await?;
  Message::decode_payload(&payload)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn ping_pong_roundtrip_through_frame() {
    let mut buf = Vec::new();
    write_frame(&mut buf, &Message::Ping).await.unwrap();
    let mut cursor = std::io::Cursor::new(buf);
    let decoded = read_frame(&mut cursor).await.unwrap();
    assert!(matches!(decoded, Message::Ping));
  }

  #[tokio::test]
  async fn get_block_roundtrips() {
    let hash = Digest32::sha256(b"some header");
    let mut buf = Vec::new();
    write_frame(&mut buf, &Message::GetBlock { header_hash: hash }).await.unwrap();
    let mut cursor = std::io::Cursor::new(buf);
    match read_frame(&mut cursor).await.unwrap() {
      Message::GetBlock { header_hash } => assert_eq!(header_hash, hash),
      other => panic!("wrong variant: {other:?}"),
    }
  }

  #[tokio::test]
  async fn truncated_frame_is_rejected() {
    // a frame declaring 65535 bytes but only 10 bytes available must fail
    // with a read error, not panic.
    let declared_len: u16 = u16::MAX;
    let mut cursor_buf = declared_len.to_be_bytes().to_vec();
    cursor_buf.extend(std::iter::repeat(0u8).take(10));
    let mut cursor = std::io::Cursor::new(cursor_buf);
    assert!(read_frame(&mut cursor).await.is_err());
  }
}

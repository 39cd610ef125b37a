//! Cryptographic primitives: SHA-256 digests and RSA PKCS#1-v1.5 over
//! SHA-256 vote signatures.
//!
//! Grounded on the teacher's `primitives/keys.rs` newtype-over-fixed-bytes
//! style, generalized from Ed25519 to RSA because spec.md mandates
//! PKCS1v15-SHA256 for vote signatures.

use {
  crate::error::CryptoError,
  rsa::{
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey},
    signature::{Signer, SignatureEncoding, Verifier},
    RsaPrivateKey,
    RsaPublicKey,
  },
  serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer},
  sha2::{Digest, Sha256},
  std::fmt,
};

/// A SHA-256 digest. Used for election hashes, vote hashes, record hashes
/// and block header hashes — every hash in this system is this type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest32([u8; 32]);

/// The all-zero digest used to pad Merkle leaves (spec.md §4.1).
pub const ZERO_DIGEST: Digest32 = Digest32([0u8; 32]);

impl Digest32 {
  pub fn from_bytes(b: [u8; 32]) -> Self {
    Self(b)
  }

  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }

  pub fn to_vec(self) -> Vec<u8> {
    self.0.to_vec()
  }

  pub fn sha256(data: impl AsRef<[u8]>) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    Self(hasher.finalize().into())
  }

  pub fn sha256_concat(parts: &[&[u8]]) -> Self {
    let mut hasher = Sha256::new();
    for part in parts {
      hasher.update(part);
    }
    Self(hasher.finalize().into())
  }
}

impl TryFrom<&[u8]> for Digest32 {
  type Error = std::array::TryFromSliceError;

  fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
    Ok(Self(value.try_into()?))
  }
}

impl fmt::Display for Digest32 {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", crate::b64::encode(self.0))
  }
}

impl fmt::Debug for Digest32 {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Digest32({})", crate::b64::encode(self.0))
  }
}

impl Serialize for Digest32 {
  fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&crate::b64::encode(self.0))
  }
}

impl<'de> Deserialize<'de> for Digest32 {
  fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    let s = String::deserialize(d)?;
    let bytes = crate::b64::decode(&s).map_err(D::Error::custom)?;
    let arr: [u8; 32] = bytes
      .try_into()
      .map_err(|_| D::Error::custom("digest must be exactly 32 bytes"))?;
    Ok(Self(arr))
  }
}

/// An RSA SubjectPublicKeyInfo, base64 on the wire (spec.md §3).
///
/// Kept as raw DER bytes plus a lazily-usable typed key so that equality,
/// hashing and wire round-tripping are cheap and exact, while signature
/// verification still goes through the `rsa` crate.
#[derive(Clone)]
pub struct PublicKey {
  der: Vec<u8>,
  key: RsaPublicKey,
}

impl PublicKey {
  pub fn from_der(der: Vec<u8>) -> Result<Self, CryptoError> {
    let key = RsaPublicKey::from_public_key_der(&der)
      .map_err(CryptoError::MalformedPublicKey)?;
    Ok(Self { der, key })
  }

  pub fn der_bytes(&self) -> &[u8] {
    &self.der
  }

  pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
    let verifier = VerifyingKey::<Sha256>::new(self.key.clone());
    let Ok(sig) = Signature::try_from(signature) else {
      return false;
    };
    verifier.verify(message, &sig).is_ok()
  }
}

impl PartialEq for PublicKey {
  fn eq(&self, other: &Self) -> bool {
    self.der == other.der
  }
}
impl Eq for PublicKey {}

impl std::hash::Hash for PublicKey {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.der.hash(state);
  }
}

impl fmt::Debug for PublicKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "PublicKey({})", crate::b64::encode(&self.der))
  }
}

impl Serialize for PublicKey {
  fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&crate::b64::encode(&self.der))
  }
}

impl<'de> Deserialize<'de> for PublicKey {
  fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    let s = String::deserialize(d)?;
    let der = crate::b64::decode(&s).map_err(D::Error::custom)?;
    PublicKey::from_der(der).map_err(D::Error::custom)
  }
}

/// A voter's RSA keypair, used by clients to sign votes (key generation
/// itself is a test-fixture concern, see `testutil`; a production voter
/// brings their own keypair).
pub struct Keypair {
  private: RsaPrivateKey,
  public: PublicKey,
}

impl Keypair {
  pub fn generate<R: rand::RngCore + rand::CryptoRng>(
    rng: &mut R,
    bits: usize,
  ) -> Result<Self, CryptoError> {
    let private = RsaPrivateKey::new(rng, bits)
      .map_err(CryptoError::KeyGeneration)?;
    let public_key = RsaPublicKey::from(&private);
    let der = public_key
      .to_public_key_der()
      .map_err(CryptoError::MalformedPublicKey)?
      .into_vec();
    Ok(Self {
      private,
      public: PublicKey { der, key: public_key },
    })
  }

  pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
    let private = RsaPrivateKey::from_pkcs8_der(der)
      .map_err(CryptoError::MalformedPrivateKey)?;
    let public_key = RsaPublicKey::from(&private);
    let pub_der = public_key
      .to_public_key_der()
      .map_err(CryptoError::MalformedPublicKey)?
      .into_vec();
    Ok(Self {
      private,
      public: PublicKey { der: pub_der, key: public_key },
    })
  }

  pub fn public(&self) -> &PublicKey {
    &self.public
  }

  /// PKCS#8 DER encoding of the private key, for `civitas keygen` to persist.
  pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, CryptoError> {
    Ok(
      self
        .private
        .to_pkcs8_der()
        .map_err(CryptoError::MalformedPrivateKey)?
        .as_bytes()
        .to_vec(),
    )
  }

  /// Signs `message` using PKCS1v15-SHA256. Used by clients to sign
  /// `election_hash_bytes ∥ utf8(choice)` when casting a vote.
  pub fn sign(&self, message: &[u8]) -> Vec<u8> {
    let signer = SigningKey::<Sha256>::new(self.private.clone());
    signer.sign(message).to_vec()
  }
}

/// Builds the exact byte message a vote's signature covers:
/// `election_hash_bytes ∥ utf8(choice)` (spec.md §3).
pub fn vote_signing_message(election_hash: &Digest32, choice: &str) -> Vec<u8> {
  let mut msg = election_hash.to_vec();
  msg.extend_from_slice(choice.as_bytes());
  msg
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sign_and_verify_roundtrip() {
    let mut rng = rand::thread_rng();
    let kp = Keypair::generate(&mut rng, 2048).unwrap();
    let eh = Digest32::sha256(b"some election");
    let msg = vote_signing_message(&eh, "A");
    let sig = kp.sign(&msg);
    assert!(kp.public().verify(&msg, &sig));
  }

  #[test]
  fn tampered_signature_fails() {
    let mut rng = rand::thread_rng();
    let kp = Keypair::generate(&mut rng, 2048).unwrap();
    let eh = Digest32::sha256(b"some election");
    let msg = vote_signing_message(&eh, "A");
    let mut sig = kp.sign(&msg);
    sig[0] ^= 0xff;
    assert!(!kp.public().verify(&msg, &sig));
  }

  #[test]
  fn digest_b64_roundtrip() {
    let d = Digest32::sha256(b"hello");
    let s = serde_json::to_string(&d).unwrap();
    let back: Digest32 = serde_json::from_str(&s).unwrap();
    assert_eq!(d, back);
  }
}

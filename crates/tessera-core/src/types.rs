//! Core newtypes shared by every Tessera protocol

use std::fmt;

use bitcode::{Decode, Encode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Seat index inside a group, 1-indexed
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub struct MemberIndex(pub u8);

impl MemberIndex {
    pub fn new(index: u8) -> Result<Self> {
        if index == 0 {
            return Err(Error::InvalidMemberIndex(
                "member indexes start at 1".to_string(),
            ));
        }
        Ok(Self(index))
    }

    /// Index of the seat when the group is stored as a zero-based slice
    pub fn position(&self) -> usize {
        usize::from(self.0).saturating_sub(1)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Every member index of a group of `group_size` seats
    pub fn all(group_size: usize) -> impl Iterator<Item = MemberIndex> {
        (1..=group_size.min(u8::MAX as usize)).map(|i| MemberIndex(i as u8))
    }
}

impl fmt::Display for MemberIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of the operator controlling one or more seats
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperatorAddress(pub String);

impl OperatorAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Derive the address from the operator's network public key
    /// (first 20 bytes of its SHA-256 digest, hex encoded)
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        Self(format!("0x{}", hex::encode(&digest[..20])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperatorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one protocol run: the DKG seed or the message being signed.
///
/// Both are arbitrary precision unsigned integers; the identifier keeps their
/// minimal big-endian encoding, so `0` is the empty byte string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct RunId(Vec<u8>);

impl RunId {
    /// Build from big-endian bytes, stripping leading zeros
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        Self(bytes[start..].to_vec())
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_be_bytes(&value.to_be_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim_start_matches("0x");
        let padded = if s.len() % 2 == 1 {
            format!("0{s}")
        } else {
            s.to_string()
        };
        let bytes = hex::decode(padded).map_err(|e| Error::InvalidRunId(e.to_string()))?;
        Ok(Self::from_be_bytes(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        if self.0.is_empty() {
            return "0".to_string();
        }
        hex::encode(&self.0)
    }

    /// Session identifier scoping messages to one attempt of this run
    pub fn session_id(&self, attempt_number: u32) -> String {
        format!("{}-{}", self.to_hex(), attempt_number)
    }

    /// Short display format (first 4 bytes as hex)
    pub fn short(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(4)])
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl Serialize for RunId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        RunId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// ECDSA signature produced by a signing group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct Signature {
    #[serde(with = "hex_bytes_32")]
    pub r: [u8; 32],
    #[serde(with = "hex_bytes_32")]
    pub s: [u8; 32],
    pub recovery_id: u8,
}

impl Signature {
    pub fn new(r: [u8; 32], s: [u8; 32], recovery_id: u8) -> Self {
        Self { r, s, recovery_id }
    }

    /// 65 bytes: r || s || recovery id
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut bytes = [0u8; 65];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..64].copy_from_slice(&self.s);
        bytes[64] = self.recovery_id;
        bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

/// Serde helper for 32-byte arrays as hex strings
pub mod hex_bytes_32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&s, &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(bytes)
    }
}

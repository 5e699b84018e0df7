use alloy_primitives::B256;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display, Formatter};
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParsePubkeyError {
    #[error("invalid base58 string: {0}")]
    InvalidBase58(String),
    #[error("expected 32 bytes, got {0}")]
    WrongLength(usize),
}

/// 32 byte address of an on-chain account.
///
/// Rendered and parsed as base58, which is the form the RPC node expects.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey(B256);

impl Pubkey {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(B256::new(bytes))
    }

    pub fn repeat_byte(byte: u8) -> Self {
        Self(B256::repeat_byte(byte))
    }

    /// A key that is unique within this process. Only meant for tests and mocks.
    pub fn new_unique() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&n.to_be_bytes());
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0.0
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0.as_slice()).into_string()
    }
}

impl From<[u8; 32]> for Pubkey {
    fn from(bytes: [u8; 32]) -> Self {
        Self::new(bytes)
    }
}

impl From<B256> for Pubkey {
    fn from(value: B256) -> Self {
        Self(value)
    }
}

impl FromStr for Pubkey {
    type Err = ParsePubkeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec().map_err(|e| ParsePubkeyError::InvalidBase58(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(ParsePubkeyError::WrongLength(bytes.len()));
        }
        Ok(Self(B256::from_slice(&bytes)))
    }
}

impl Display for Pubkey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl Debug for Pubkey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pubkey({})", self.to_base58())
    }
}

impl Serialize for Pubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for Pubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl BorshSerialize for Pubkey {
    fn serialize<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(self.0.as_slice())
    }
}

impl BorshDeserialize for Pubkey {
    fn deserialize_reader<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut bytes = [0u8; 32];
        reader.read_exact(&mut bytes)?;
        Ok(Self::new(bytes))
    }
}

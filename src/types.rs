//! Core identifier types for the history store.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

/// Durable identifier of a project's history.
///
/// Projects created on the document backend carry a 24-hex-digit id; legacy
/// projects carry a small integer allocated by the relational backend. Both
/// are accepted wherever a history id is expected.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HistoryId {
    Mongo(String),
    Postgres(u64),
}

impl HistoryId {
    /// Parse and validate a history id in either format.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() == 24 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Ok(HistoryId::Mongo(s.to_string()));
        }
        if !s.is_empty() && s.len() <= 19 && s.bytes().all(|b| b.is_ascii_digit()) {
            let id: u64 = s
                .parse()
                .map_err(|_| StoreError::InvalidId(format!("bad history id: {s}")))?;
            if id > 0 {
                return Ok(HistoryId::Postgres(id));
            }
        }
        Err(StoreError::InvalidId(format!("bad history id: {s:?}")))
    }

    pub fn is_mongo(&self) -> bool {
        matches!(self, HistoryId::Mongo(_))
    }
}

impl FromStr for HistoryId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        HistoryId::parse(s)
    }
}

impl TryFrom<String> for HistoryId {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self> {
        HistoryId::parse(&s)
    }
}

impl From<HistoryId> for String {
    fn from(id: HistoryId) -> Self {
        id.to_string()
    }
}

impl fmt::Debug for HistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HistoryId({self})")
    }
}

impl fmt::Display for HistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryId::Mongo(id) => write!(f, "{id}"),
            HistoryId::Postgres(id) => write!(f, "{id}"),
        }
    }
}

/// Git-style blob hash (SHA-1 over `"blob <len>\0" + content`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobHash(pub [u8; 20]);

impl BlobHash {
    /// Hash of the empty blob.
    pub const EMPTY_HEX: &'static str = "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391";

    /// Compute the git blob hash of some content.
    pub fn of_content(content: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("blob {}\0", content.len()).as_bytes());
        hasher.update(content);
        BlobHash(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 40 || s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(StoreError::InvalidId(format!("bad blob hash: {s:?}")));
        }
        let bytes = hex::decode(s).map_err(|e| StoreError::InvalidId(format!("bad blob hash: {e}")))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| StoreError::InvalidId(format!("bad blob hash: {s:?}")))?;
        Ok(BlobHash(arr))
    }
}

impl TryFrom<String> for BlobHash {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self> {
        BlobHash::from_hex(&s)
    }
}

impl From<BlobHash> for String {
    fn from(hash: BlobHash) -> Self {
        hash.to_hex()
    }
}

impl fmt::Debug for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobHash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identifier of a chunk row. Numeric on the relational backend, 24 hex
/// digits on the document backend.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub String);

impl ChunkId {
    /// Zero-padded form used in bucket keys.
    pub fn padded(&self) -> String {
        pad_id(&self.0)
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Left-pad an id to nine characters with zeros.
pub fn pad_id(id: &str) -> String {
    format!("{id:0>9}")
}

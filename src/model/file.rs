//! Files and their loading states.

use crate::blobs::{hash::content_hash, BlobSource, BlobStore};
use crate::error::{Result, StoreError};
use crate::model::TextOperation;
use crate::types::BlobHash;
use serde::{Deserialize, Serialize};

/// How much of a file's content is materialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadMode {
    /// Lengths only. Enough to validate edits structurally.
    Hollow,
    /// Blob reference plus any edits not yet applied to it.
    Lazy,
    /// Full text content in memory.
    Eager,
}

/// File content in one of the three loading states.
///
/// Transitions: any state can become `Hollow`; `Lazy` becomes `Eager` by
/// fetching the blob and replaying pending edits. A hollow file cannot be
/// loaded again because its content reference is gone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileData {
    Hollow {
        byte_length: Option<u64>,
        string_length: Option<usize>,
    },
    Lazy {
        hash: BlobHash,
        byte_length: Option<u64>,
        string_length: Option<usize>,
        operations: Vec<TextOperation>,
    },
    Eager {
        content: String,
        /// Set while the content is unchanged since it was read or stored.
        hash: Option<BlobHash>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFile", into = "RawFile")]
pub struct File {
    data: FileData,
}

/// Wire form of a file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<BlobHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<TextOperation>,
}

impl File {
    pub fn from_string(content: impl Into<String>) -> Self {
        Self {
            data: FileData::Eager {
                content: content.into(),
                hash: None,
            },
        }
    }

    pub fn from_hash(hash: BlobHash, byte_length: Option<u64>, string_length: Option<usize>) -> Self {
        Self {
            data: FileData::Lazy {
                hash,
                byte_length,
                string_length,
                operations: Vec::new(),
            },
        }
    }

    pub fn hollow(byte_length: Option<u64>, string_length: Option<usize>) -> Self {
        Self {
            data: FileData::Hollow {
                byte_length,
                string_length,
            },
        }
    }

    pub fn data(&self) -> &FileData {
        &self.data
    }

    /// Blob hash of the current content, when known without hashing.
    pub fn hash(&self) -> Option<BlobHash> {
        match &self.data {
            FileData::Lazy {
                hash, operations, ..
            } if operations.is_empty() => Some(*hash),
            FileData::Eager { hash, .. } => *hash,
            _ => None,
        }
    }

    /// Hash of the blob this file's content derives from, edited or not.
    pub fn base_hash(&self) -> Option<BlobHash> {
        match &self.data {
            FileData::Lazy { hash, .. } => Some(*hash),
            FileData::Eager { hash, .. } => *hash,
            FileData::Hollow { .. } => None,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match &self.data {
            FileData::Eager { content, .. } => Some(content),
            _ => None,
        }
    }

    pub fn byte_length(&self) -> Option<u64> {
        match &self.data {
            FileData::Hollow { byte_length, .. } => *byte_length,
            FileData::Lazy {
                byte_length,
                operations,
                ..
            } if operations.is_empty() => *byte_length,
            FileData::Lazy { .. } => None,
            FileData::Eager { content, .. } => Some(content.len() as u64),
        }
    }

    pub fn string_length(&self) -> Option<usize> {
        match &self.data {
            FileData::Hollow { string_length, .. } | FileData::Lazy { string_length, .. } => {
                *string_length
            }
            FileData::Eager { content, .. } => Some(content.chars().count()),
        }
    }

    /// SHA-1 of the raw content (no blob header), if the content is loaded.
    pub fn content_hash(&self) -> Option<String> {
        self.content().map(content_hash)
    }

    /// Apply a text edit in whatever state the file is in.
    pub fn edit(&mut self, op: &TextOperation) -> Result<()> {
        match &mut self.data {
            FileData::Hollow {
                byte_length,
                string_length: Some(length),
            } => {
                *length = op.apply_to_length(*length)?;
                *byte_length = None;
            }
            FileData::Lazy {
                byte_length,
                string_length: Some(length),
                operations,
                ..
            } => {
                *length = op.apply_to_length(*length)?;
                *byte_length = None;
                operations.push(op.clone());
            }
            FileData::Eager { content, hash } => {
                *content = op.apply(content)?;
                *hash = None;
            }
            _ => {
                return Err(StoreError::InvalidChange(
                    "cannot apply a text operation to a binary file".into(),
                ))
            }
        }
        Ok(())
    }

    /// Move the file into `mode`, fetching from `source` as needed.
    pub fn load(&mut self, mode: LoadMode, source: &dyn BlobSource) -> Result<()> {
        match mode {
            LoadMode::Hollow => self.load_hollow(source),
            LoadMode::Lazy => match self.data {
                FileData::Hollow { .. } => Err(StoreError::Invariant(
                    "cannot lazily load a hollow file".into(),
                )),
                _ => Ok(()),
            },
            LoadMode::Eager => self.load_eager(source),
        }
    }

    /// Drop content, keeping only what is known without fetching.
    pub fn make_hollow(&mut self) {
        let byte_length = self.byte_length();
        let string_length = self.string_length();
        self.data = FileData::Hollow {
            byte_length,
            string_length,
        };
    }

    fn load_hollow(&mut self, source: &dyn BlobSource) -> Result<()> {
        if let FileData::Lazy {
            hash,
            byte_length: None,
            string_length,
            operations,
        } = &self.data
        {
            if operations.is_empty() {
                let blob = source
                    .get_blob(hash)?
                    .ok_or_else(|| StoreError::BlobNotFound(hash.to_hex()))?;
                self.data = FileData::Hollow {
                    byte_length: Some(blob.byte_length),
                    string_length: string_length.or(blob.string_length),
                };
                return Ok(());
            }
        }
        self.make_hollow();
        Ok(())
    }

    fn load_eager(&mut self, source: &dyn BlobSource) -> Result<()> {
        let (hash, operations) = match &mut self.data {
            FileData::Hollow { .. } => {
                return Err(StoreError::Invariant(
                    "cannot eagerly load a hollow file".into(),
                ))
            }
            FileData::Eager { .. } => return Ok(()),
            FileData::Lazy {
                hash,
                byte_length,
                string_length,
                operations,
            } => {
                if string_length.is_none() {
                    let blob = source
                        .get_blob(hash)?
                        .ok_or_else(|| StoreError::BlobNotFound(hash.to_hex()))?;
                    *byte_length = Some(blob.byte_length);
                    match blob.string_length {
                        Some(length) => *string_length = Some(length),
                        // binary content stays lazy
                        None => return Ok(()),
                    }
                }
                (*hash, operations.clone())
            }
        };

        let mut content = source.get_string(&hash)?;
        for op in &operations {
            content = op.apply(&content)?;
        }
        self.data = FileData::Eager {
            content,
            hash: operations.is_empty().then_some(hash),
        };
        Ok(())
    }

    /// Write unstored eager content to the blob store so the file can be
    /// serialized by reference.
    pub fn store(&mut self, blobs: &BlobStore) -> Result<()> {
        if let FileData::Eager {
            content,
            hash: hash @ None,
        } = &mut self.data
        {
            let blob = blobs.put_string(content)?;
            *hash = Some(blob.hash);
        }
        Ok(())
    }
}

impl TryFrom<RawFile> for File {
    type Error = StoreError;

    fn try_from(raw: RawFile) -> Result<Self> {
        let data = match (raw.content, raw.hash) {
            (Some(content), hash) => FileData::Eager { content, hash },
            (None, Some(hash)) => FileData::Lazy {
                hash,
                byte_length: raw.byte_length,
                string_length: raw.string_length,
                operations: raw.operations,
            },
            (None, None) => {
                if !raw.operations.is_empty() {
                    return Err(StoreError::InvalidFormat(
                        "file has operations but no hash".into(),
                    ));
                }
                FileData::Hollow {
                    byte_length: raw.byte_length,
                    string_length: raw.string_length,
                }
            }
        };
        Ok(File { data })
    }
}

impl From<File> for RawFile {
    fn from(file: File) -> Self {
        match file.data {
            FileData::Hollow {
                byte_length,
                string_length,
            } => RawFile {
                byte_length,
                string_length,
                ..Default::default()
            },
            FileData::Lazy {
                hash,
                byte_length,
                string_length,
                operations,
            } => RawFile {
                hash: Some(hash),
                byte_length: if operations.is_empty() { byte_length } else { None },
                string_length,
                operations,
                ..Default::default()
            },
            FileData::Eager {
                content,
                hash: Some(hash),
            } => RawFile {
                hash: Some(hash),
                byte_length: Some(content.len() as u64),
                string_length: Some(content.chars().count()),
                ..Default::default()
            },
            FileData::Eager {
                content,
                hash: None,
            } => RawFile {
                content: Some(content),
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::Blob;
    use std::collections::HashMap;

    struct Blobs(HashMap<BlobHash, String>);

    impl BlobSource for Blobs {
        fn get_blob(&self, hash: &BlobHash) -> Result<Option<Blob>> {
            Ok(self.0.get(hash).map(|s| Blob {
                hash: *hash,
                byte_length: s.len() as u64,
                string_length: Some(s.chars().count()),
            }))
        }

        fn get_string(&self, hash: &BlobHash) -> Result<String> {
            self.0
                .get(hash)
                .cloned()
                .ok_or_else(|| StoreError::BlobNotFound(hash.to_hex()))
        }
    }

    fn source(content: &str) -> (Blobs, BlobHash) {
        let hash = BlobHash::of_content(content.as_bytes());
        (Blobs(HashMap::from([(hash, content.to_string())])), hash)
    }

    #[test]
    fn test_lazy_edit_then_eager_load() {
        let (blobs, hash) = source("hello");
        let mut file = File::from_hash(hash, Some(5), Some(5));
        file.edit(&TextOperation::new().retain(5).insert(" world")).unwrap();
        assert_eq!(file.string_length(), Some(11));
        assert_eq!(file.hash(), None);

        file.load(LoadMode::Eager, &blobs).unwrap();
        assert_eq!(file.content(), Some("hello world"));
        assert_eq!(file.hash(), None);
    }

    #[test]
    fn test_unedited_eager_keeps_hash() {
        let (blobs, hash) = source("abc");
        let mut file = File::from_hash(hash, None, None);
        file.load(LoadMode::Eager, &blobs).unwrap();
        assert_eq!(file.hash(), Some(hash));
        let raw = serde_json::to_value(&file).unwrap();
        assert_eq!(raw["hash"], hash.to_hex());
        assert_eq!(raw["stringLength"], 3);
        assert!(raw.get("content").is_none());
    }

    #[test]
    fn test_hollow_fetches_missing_lengths() {
        let (blobs, hash) = source("héllo");
        let mut file = File::from_hash(hash, None, None);
        file.load(LoadMode::Hollow, &blobs).unwrap();
        assert_eq!(file.byte_length(), Some(6));
        assert_eq!(file.string_length(), Some(5));
        assert!(file.load(LoadMode::Eager, &blobs).is_err());
    }

    #[test]
    fn test_binary_file_rejects_edits() {
        let mut file = File::hollow(Some(100), None);
        assert!(file
            .edit(&TextOperation::new().insert("x"))
            .unwrap_err()
            .is_invalid_change());
    }

    #[test]
    fn test_raw_forms() {
        let file: File = serde_json::from_str(r#"{"content": "x"}"#).unwrap();
        assert_eq!(file.content(), Some("x"));
        let file: File = serde_json::from_str(r#"{"byteLength": 4, "stringLength": 4}"#).unwrap();
        assert!(matches!(file.data(), FileData::Hollow { .. }));
        assert!(serde_json::from_str::<File>(r#"{"operations": [1]}"#).is_err());
    }
}

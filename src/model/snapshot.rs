//! Materialized file trees.

use crate::blobs::{BlobSource, BlobStore};
use crate::error::{Result, StoreError};
use crate::model::{Change, File, LoadMode};
use crate::types::BlobHash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The file tree of a project at one version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    files: BTreeMap<String, File>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(&self, pathname: &str) -> Option<&File> {
        self.files.get(pathname)
    }

    pub fn file_mut(&mut self, pathname: &str) -> Option<&mut File> {
        self.files.get_mut(pathname)
    }

    pub fn files(&self) -> impl Iterator<Item = (&String, &File)> {
        self.files.iter()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn add_file(&mut self, pathname: &str, file: File) -> Result<()> {
        if self.files.contains_key(pathname) {
            return Err(StoreError::InvalidChange(format!(
                "file already exists: {pathname}"
            )));
        }
        self.files.insert(pathname.to_string(), file);
        Ok(())
    }

    pub fn remove_file(&mut self, pathname: &str) -> Option<File> {
        self.files.remove(pathname)
    }

    pub fn move_file(&mut self, pathname: &str, new_pathname: &str) -> Result<()> {
        if self.files.contains_key(new_pathname) {
            return Err(StoreError::InvalidChange(format!(
                "file already exists: {new_pathname}"
            )));
        }
        let file = self
            .files
            .remove(pathname)
            .ok_or_else(|| StoreError::InvalidChange(format!("file not found: {pathname}")))?;
        self.files.insert(new_pathname.to_string(), file);
        Ok(())
    }

    /// Apply changes in order. Stops at the first failing operation.
    pub fn apply_all<'a>(
        &mut self,
        changes: impl IntoIterator<Item = &'a Change>,
        strict: bool,
    ) -> Result<()> {
        for change in changes {
            change.apply_to(self, strict)?;
        }
        Ok(())
    }

    pub fn find_blob_hashes(&self, hashes: &mut BTreeSet<BlobHash>) {
        for file in self.files.values() {
            if let Some(hash) = file.base_hash() {
                hashes.insert(hash);
            }
        }
    }

    pub fn load_files(&mut self, mode: LoadMode, source: &dyn BlobSource) -> Result<()> {
        for file in self.files.values_mut() {
            file.load(mode, source)?;
        }
        Ok(())
    }

    pub fn make_hollow(&mut self) {
        for file in self.files.values_mut() {
            file.make_hollow();
        }
    }

    pub fn store_files(&mut self, blobs: &BlobStore) -> Result<()> {
        for file in self.files.values_mut() {
            file.store(blobs)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Operation, TextOperation};
    use chrono::Utc;

    #[test]
    fn test_apply_all_hollow() {
        let mut snapshot = Snapshot::new();
        snapshot.add_file("main.tex", File::hollow(Some(5), Some(5))).unwrap();
        let changes = vec![
            Change::new(
                vec![Operation::edit_file("main.tex", TextOperation::new().retain(5).insert("!"))],
                Utc::now(),
            ),
            Change::new(vec![Operation::move_file("main.tex", "doc.tex")], Utc::now()),
        ];
        snapshot.apply_all(&changes, true).unwrap();
        assert_eq!(snapshot.file("doc.tex").unwrap().string_length(), Some(6));
    }

    #[test]
    fn test_add_existing_path_fails() {
        let mut snapshot = Snapshot::new();
        snapshot.add_file("a", File::from_string("")).unwrap();
        assert!(snapshot.add_file("a", File::from_string("")).is_err());
    }

    #[test]
    fn test_serialized_form() {
        let mut snapshot = Snapshot::new();
        snapshot.add_file("a.tex", File::from_string("hi")).unwrap();
        assert_eq!(
            serde_json::to_string(&snapshot).unwrap(),
            r#"{"files":{"a.tex":{"content":"hi"}}}"#
        );
    }
}

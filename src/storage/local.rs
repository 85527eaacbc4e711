//! Filesystem object store. Buckets are directories under a root.

use super::{not_found, ObjectInfo, ObjectStore};
use crate::error::{Result, StoreError};
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root: fs::canonicalize(&root)?,
        })
    }

    /// Reject bucket names and keys that could escape the root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(StoreError::InvalidFormat("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(StoreError::InvalidFormat(format!(
                "unsafe storage key: '{key}'"
            )));
        }
        if Path::new(key)
            .components()
            .any(|c| c == Component::ParentDir)
        {
            return Err(StoreError::InvalidFormat(format!(
                "unsafe storage key: parent traversal '{key}'"
            )));
        }
        Ok(())
    }

    fn resolve(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        Self::validate_key(bucket)?;
        Self::validate_key(key)?;
        Ok(self.root.join(bucket).join(key))
    }

    /// Write to a temp file next to the target and rename it into place.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn list_recursive(&self, base: &Path, dir: &Path, keys: &mut Vec<ObjectInfo>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(base, &entry.path(), keys)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(base) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(ObjectInfo {
                        key,
                        size: entry.metadata()?.len(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalObjectStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(bucket, key)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(bucket, key)),
            Err(e) => Err(e.into()),
        }
    }

    fn get_stream(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.resolve(bucket, key)?;
        match fs::File::open(&path) {
            Ok(file) => Ok(Box::new(std::io::BufReader::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(bucket, key)),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(bucket, key)?;
        self.atomic_write(&path, data)
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.resolve(bucket, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        Self::validate_key(bucket)?;
        let base = self.root.join(bucket);
        // walk from the deepest directory named by the prefix
        let dir = match prefix.rfind('/') {
            Some(idx) => {
                Self::validate_key(&prefix[..idx])?;
                base.join(&prefix[..idx])
            }
            None => base.clone(),
        };
        let mut objects = Vec::new();
        self.list_recursive(&base, &dir, &mut objects)?;
        objects.retain(|o| o.key.starts_with(prefix));
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let path = self.resolve(bucket, key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_list() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        store.put("chunks", "321/000/000/000000001", b"one").unwrap();
        store.put("chunks", "321/000/000/000000002", b"two").unwrap();
        store.put("chunks", "421/000/000/000000001", b"other").unwrap();

        assert_eq!(store.get("chunks", "321/000/000/000000002").unwrap(), b"two");
        let keys: Vec<_> = store
            .list("chunks", "321/000/000/")
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["321/000/000/000000001", "321/000/000/000000002"]);

        store.delete_directory("chunks", "321/000/000/").unwrap();
        assert!(!store.exists("chunks", "321/000/000/000000001").unwrap());
        assert!(store.exists("chunks", "421/000/000/000000001").unwrap());
    }

    #[test]
    fn test_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        assert!(store.get("b", "x").unwrap_err().is_not_found());
        assert!(store.get_stream("b", "x").err().unwrap().is_not_found());
        assert!(store.list("b", "x/").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_unsafe_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        assert!(store.put("b", "../escape", b"x").is_err());
        assert!(store.put("b", "/abs", b"x").is_err());
        assert!(store.put("..", "x", b"x").is_err());
    }
}

//! Bucket key layout.
//!
//! Project data lives under a folder derived from the zero-padded,
//! reversed history id so that sequential ids spread across key prefixes:
//! `123` becomes `321/000/000`, a 24-hex id becomes `xxx/xxx/<18 hex>`.

use crate::error::{Result, StoreError};
use crate::types::{pad_id, BlobHash, ChunkId, HistoryId};

pub fn project_folder(project_id: &HistoryId) -> String {
    let reversed: String = pad_id(&project_id.to_string()).chars().rev().collect();
    format!("{}/{}/{}", &reversed[..3], &reversed[3..6], &reversed[6..])
}

/// Folder with a trailing slash, used for prefix listing and deletion.
pub fn project_prefix(project_id: &HistoryId) -> String {
    format!("{}/", project_folder(project_id))
}

/// Prefix for prefix-wide deletes. Refuses ids that would not parse back,
/// since those can land in the folder of another project.
pub fn checked_project_prefix(project_id: &HistoryId) -> Result<String> {
    let parsed = HistoryId::parse(&project_id.to_string())
        .map_err(|_| StoreError::Config(format!("refusing to address history id {project_id:?}")))?;
    if &parsed != project_id {
        return Err(StoreError::Config(format!("refusing to address history id {project_id:?}")));
    }
    let prefix = project_prefix(project_id);
    validate_project_folder(&prefix)?;
    Ok(prefix)
}

/// Check that a prefix has one of the two recognised project folder shapes.
pub fn validate_project_folder(prefix: &str) -> Result<()> {
    let parts: Vec<&str> = prefix.split('/').collect();
    let ok = match parts.as_slice() {
        [a, b, rest, ""] => {
            let numeric = a.len() == 3
                && b.len() == 3
                && rest.len() >= 3
                && [a, b, rest].iter().all(|p| p.bytes().all(|c| c.is_ascii_digit()));
            let hex = a.len() == 3
                && b.len() == 3
                && rest.len() == 18
                && [a, b, rest]
                    .iter()
                    .all(|p| p.bytes().all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'f')));
            numeric || hex
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(StoreError::Config(format!(
            "invalid project folder: {prefix:?}"
        )))
    }
}

pub fn chunk_key(project_id: &HistoryId, chunk_id: &ChunkId) -> String {
    format!("{}/{}", project_folder(project_id), chunk_id.padded())
}

pub fn chunk_backup_key(project_id: &HistoryId, start_version: u64) -> String {
    format!(
        "{}/{}",
        project_folder(project_id),
        pad_id(&start_version.to_string())
    )
}

pub fn project_blob_key(project_id: &HistoryId, hash: &BlobHash) -> String {
    let hex = hash.to_hex();
    format!("{}/{}/{}", project_folder(project_id), &hex[..2], &hex[2..])
}

pub fn global_blob_key(hash: &BlobHash) -> String {
    let hex = hash.to_hex();
    format!("{}/{}/{}", &hex[..2], &hex[2..4], &hex[4..])
}

/// Key of the wrapped data encryption key in the key bucket.
pub fn dek_key(project_id: &HistoryId) -> String {
    format!("{}/dek", project_folder(project_id))
}

/// Recover the blob hash from a project blob key.
pub fn blob_hash_from_key(key: &str) -> Result<BlobHash> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [_, _, _, head, tail] => BlobHash::from_hex(&format!("{head}{tail}")),
        _ => Err(StoreError::InvalidFormat(format!("not a blob key: {key}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_folder() {
        assert_eq!(project_folder(&HistoryId::Postgres(123)), "321/000/000");
        assert_eq!(project_folder(&HistoryId::Postgres(1234567890)), "098/765/4321");
        assert_eq!(
            project_folder(&HistoryId::parse("5fa1b2c3d4e5f60718293a4b").unwrap()),
            "b4a/392/81706f5e4d3c2b1af5"
        );
    }

    #[test]
    fn test_prefix_validation() {
        validate_project_folder(&project_prefix(&HistoryId::Postgres(7))).unwrap();
        validate_project_folder(&project_prefix(
            &HistoryId::parse("5fa1b2c3d4e5f60718293a4b").unwrap(),
        ))
        .unwrap();
        assert!(validate_project_folder("321/000/000").is_err());
        assert!(validate_project_folder("32/000/000/").is_err());
        assert!(validate_project_folder("b4a/392/81706f/").is_err());
    }

    #[test]
    fn test_checked_prefix_rejects_unparsed_ids() {
        assert_eq!(checked_project_prefix(&HistoryId::Postgres(123)).unwrap(), "321/000/000/");
        // both would otherwise address 000/000/000/
        assert!(matches!(
            checked_project_prefix(&HistoryId::Mongo(String::new())),
            Err(StoreError::Config(_))
        ));
        assert!(matches!(checked_project_prefix(&HistoryId::Postgres(0)), Err(StoreError::Config(_))));
        assert!(checked_project_prefix(&HistoryId::Mongo("../../x".into())).is_err());
    }

    #[test]
    fn test_blob_keys() {
        let hash = BlobHash::from_hex(BlobHash::EMPTY_HEX).unwrap();
        let key = project_blob_key(&HistoryId::Postgres(123), &hash);
        assert_eq!(key, "321/000/000/e6/9de29bb2d1d6434b8b29ae775ad8c2e48c5391");
        assert_eq!(blob_hash_from_key(&key).unwrap(), hash);
        assert_eq!(global_blob_key(&hash), "e6/9d/e29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    #[test]
    fn test_chunk_keys() {
        let project = HistoryId::Postgres(123);
        assert_eq!(chunk_key(&project, &ChunkId("45".into())), "321/000/000/000000045");
        assert_eq!(chunk_backup_key(&project, 7), "321/000/000/000000007");
        assert_eq!(dek_key(&project), "321/000/000/dek");
    }
}

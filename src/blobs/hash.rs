//! Hash functions over blob content.

use crate::error::{Result, StoreError};
use crate::types::BlobHash;
use sha1::{Digest, Sha1};
use std::io::Read;

/// Git blob hash of a stream whose length is known up front.
///
/// The length goes into the header before any content is read, so a stream
/// that turns out shorter or longer than `byte_length` is an error rather
/// than a silently different hash.
pub fn git_blob_hash_reader(mut reader: impl Read, byte_length: u64) -> Result<BlobHash> {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {byte_length}\0").as_bytes());
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        hasher.update(&buf[..n]);
    }
    if total != byte_length {
        return Err(StoreError::Corruption(format!(
            "expected {byte_length} bytes, read {total}"
        )));
    }
    Ok(BlobHash(hasher.finalize().into()))
}

/// SHA-1 of raw text content, hex encoded. Used to validate edits.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha1::digest(content.as_bytes()))
}

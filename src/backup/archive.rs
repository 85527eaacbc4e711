//! Project export from the backup buckets.
//!
//! Archives are gzip'd tarballs built on a worker thread into a temporary
//! file next to the destination. The file only appears at the destination
//! once the archive is complete and within the deadline.

use super::{BackupService, ProjectPersistor};
use crate::blobs::{Blob, BlobSource, BlobStore};
use crate::error::{Result, StoreError};
use crate::history_store;
use crate::model::{Chunk, FileData, History, LoadMode};
use crate::types::{BlobHash, HistoryId};
use crossbeam_channel::{bounded, RecvTimeoutError};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use tar::{Builder, EntryType, Header};
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// What went into an archive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub files: usize,
    /// Entries left out because their content could not be fetched.
    pub skipped: Vec<String>,
}

/// Reads blob content from the backup and metadata from the live store.
struct BackupBlobs<'a> {
    persistor: &'a ProjectPersistor,
    live: &'a BlobStore,
    service: &'a BackupService,
}

impl BackupBlobs<'_> {
    fn bytes(&self, hash: &BlobHash) -> Result<Vec<u8>> {
        if self.service.blobs.globals().is_active(hash) {
            return Ok(self.live.get_bytes(hash)?.to_vec());
        }
        self.persistor.get_blob(hash)
    }
}

impl BlobSource for BackupBlobs<'_> {
    fn get_blob(&self, hash: &BlobHash) -> Result<Option<Blob>> {
        self.live.get_blob(hash)
    }

    fn get_string(&self, hash: &BlobHash) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.bytes(hash)?).into_owned())
    }
}

fn append<W: Write>(builder: &mut Builder<W>, path: &str, content: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, path, content)?;
    Ok(())
}

impl BackupService {
    /// Export the files of the latest backed-up version as a tarball.
    ///
    /// Files whose content cannot be fetched are skipped and reported. A
    /// chunk that cannot be read fails the whole export.
    pub fn archive_latest(&self, project_id: &HistoryId, dest: &Path) -> Result<ArchiveSummary> {
        self.with_deadline(project_id, dest, |service, project_id, out| {
            service.write_latest(project_id, out)
        })
    }

    /// Dump every chunk in the backup and the blobs they reference,
    /// without consulting chunk metadata.
    pub fn archive_raw(&self, project_id: &HistoryId, dest: &Path) -> Result<ArchiveSummary> {
        self.with_deadline(project_id, dest, |service, project_id, out| {
            service.write_raw(project_id, out)
        })
    }

    fn with_deadline<F>(&self, project_id: &HistoryId, dest: &Path, build: F) -> Result<ArchiveSummary>
    where
        F: FnOnce(&BackupService, &HistoryId, &mut Builder<GzEncoder<NamedTempFile>>) -> Result<ArchiveSummary>
            + Send
            + 'static,
    {
        let dir = match dest.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        let (tx, rx) = bounded(1);
        let service = self.clone();
        let worker_project = project_id.clone();
        std::thread::spawn(move || {
            let result = (|| -> Result<(NamedTempFile, ArchiveSummary)> {
                let temp = NamedTempFile::new_in(&dir)?;
                let mut builder = Builder::new(GzEncoder::new(temp, Compression::default()));
                let summary = build(&service, &worker_project, &mut builder)?;
                let temp = builder.into_inner()?.finish()?;
                Ok((temp, summary))
            })();
            // the receiver is gone once the deadline has passed
            let _ = tx.send(result);
        });

        let (temp, summary) = match rx.recv_timeout(self.archive_timeout) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => {
                warn!(%project_id, timeout = ?self.archive_timeout, "archive timed out");
                return Err(StoreError::Timeout(self.archive_timeout));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(StoreError::Invariant("archive worker exited without a result".into()))
            }
        };
        temp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
        info!(%project_id, dest = %dest.display(), files = summary.files, skipped = summary.skipped.len(), "wrote archive");
        Ok(summary)
    }

    fn write_latest<W: Write>(&self, project_id: &HistoryId, out: &mut Builder<W>) -> Result<ArchiveSummary> {
        let persistor = self.persistor.for_project_read_only(project_id)?;
        let status = self.status.get_status(project_id)?;
        let last = status
            .last_backed_up_version
            .ok_or_else(|| StoreError::NotFound(format!("project {project_id} has no backup")))?;
        let start = self.chunks.load_at_version(project_id, last)?.start_version();
        let buffer = persistor
            .get_chunk(start)
            .map_err(|e| StoreError::load(persistor.chunk_path(start), e))?;
        let history = history_store::decode(&buffer)?;
        let backed_up = ((last - start) as usize).min(history.changes().len());
        let changes = history.changes()[..backed_up].to_vec();
        let chunk = Chunk::new(History::new(history.snapshot().clone(), changes), start);
        let mut snapshot = chunk.end_snapshot(false)?;

        let live = self.blobs.for_project(project_id);
        let source = BackupBlobs {
            persistor: &persistor,
            live: &live,
            service: self,
        };
        let mut summary = ArchiveSummary::default();
        let paths: Vec<String> = snapshot.files().map(|(path, _)| path.clone()).collect();
        for path in paths {
            let Some(file) = snapshot.file_mut(&path) else {
                continue;
            };
            let content = match file.load(LoadMode::Eager, &source) {
                Ok(()) => match file.data() {
                    FileData::Eager { content, .. } => Ok(content.clone().into_bytes()),
                    FileData::Lazy { hash, .. } => source.bytes(hash),
                    FileData::Hollow { .. } => Err(StoreError::NotFound(format!("no content for {path}"))),
                },
                Err(e) => Err(e),
            };
            match content {
                Ok(content) => {
                    append(out, &path, &content)?;
                    summary.files += 1;
                }
                Err(e) => {
                    warn!(%project_id, %path, error = %e, "skipping file in archive");
                    summary.skipped.push(path);
                }
            }
        }
        Ok(summary)
    }

    fn write_raw<W: Write>(&self, project_id: &HistoryId, out: &mut Builder<W>) -> Result<ArchiveSummary> {
        let persistor = self.persistor.for_project_read_only(project_id)?;
        let mut summary = ArchiveSummary::default();
        let mut hashes = BTreeSet::new();
        for start in self.persistor.list_chunk_versions(project_id)? {
            let buffer = persistor
                .get_chunk(start)
                .map_err(|e| StoreError::load(persistor.chunk_path(start), e))?;
            let history = history_store::decode(&buffer)?;
            history.find_blob_hashes(&mut hashes);
            append(out, &format!("chunks/{start}.json"), &serde_json::to_vec_pretty(&history)?)?;
            summary.files += 1;
        }

        let live = self.blobs.for_project(project_id);
        let source = BackupBlobs {
            persistor: &persistor,
            live: &live,
            service: self,
        };
        for hash in hashes {
            let path = format!("blobs/{hash}");
            match source.bytes(&hash) {
                Ok(content) => {
                    append(out, &path, &content)?;
                    summary.files += 1;
                }
                Err(e) => {
                    warn!(%project_id, %hash, error = %e, "skipping blob in raw archive");
                    summary.skipped.push(path);
                }
            }
        }
        Ok(summary)
    }
}

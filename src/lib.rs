//! # History Store
//!
//! Durable, versioned storage for the edit history of text projects.
//!
//! ## Core Concepts
//!
//! - **Chunks**: contiguous version ranges of a project's history, each a
//!   snapshot plus the changes that advance it
//! - **Blobs**: content-addressed file content keyed by git blob hash
//! - **Write buffer**: a fast queue of recent changes, drained into chunks
//!   in the background or on demand
//! - **Backups**: per-project encrypted copies of chunks and blobs, with
//!   verification, archiving and delayed deletion
//!
//! ## Example
//!
//! ```ignore
//! use history_store::{Change, File, HistoryId, Operation, Settings, Store};
//!
//! let store = Store::in_memory(Settings::default())?;
//! let project = HistoryId::parse("42")?;
//! store.initialize_project(&project)?;
//!
//! // Persist one change on top of version 0
//! let change = Change::new(
//!     vec![Operation::add_file("main.tex", File::from_string("hello"))],
//!     chrono::Utc::now(),
//! );
//! store.persist_changes(&project, vec![change], 0)?;
//!
//! assert_eq!(store.load_latest(&project)?.end_version(), 1);
//! ```

pub mod backup;
pub mod blobs;
pub mod buffer;
pub mod chunks;
pub mod config;
pub mod error;
pub mod health;
pub mod history_store;
pub mod model;
pub mod persist;
pub mod storage;
pub mod store;
pub mod types;

// Re-exports
pub use backup::{BackupReport, BackupService, KeyRing, RootKey};
pub use blobs::{Blob, BlobService, BlobStore, GlobalBlob, GlobalBlobs};
pub use buffer::{QueueOptions, QueueStatus, WriteBuffer};
pub use chunks::{ChunkStore, DocumentBackend, MetadataBackend, RelationalBackend};
pub use config::Settings;
pub use error::{Result, StoreError};
pub use model::{Change, Chunk, ChunkRecord, File, History, LoadMode, Operation, Snapshot, TextOperation};
pub use persist::{BufferLevel, CommitOptions, CommitResult, PersistLimits, PersistResult, Persister};
pub use store::{Backends, Store};
pub use types::*;

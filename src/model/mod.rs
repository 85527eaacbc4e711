//! Document history model: files, operations, changes, snapshots and
//! chunks.

mod change;
mod file;
mod history;
mod operation;
mod snapshot;
mod text_operation;

pub use change::{Change, Origin, RESYNC_ORIGIN};
pub use file::{File, FileData, LoadMode, RawFile};
pub use history::{Chunk, ChunkRecord, History};
pub use operation::Operation;
pub use snapshot::Snapshot;
pub use text_operation::{Component, TextOperation, MAX_STRING_LENGTH};

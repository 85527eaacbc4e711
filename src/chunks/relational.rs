//! SQLite metadata backend for numeric history ids.

use crate::blobs::Blob;
use crate::chunks::{ChunkState, MetadataBackend};
use crate::error::{Result, StoreError};
use crate::model::ChunkRecord;
use crate::types::{BlobHash, ChunkId, HistoryId};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id INTEGER NOT NULL,
    start_version INTEGER NOT NULL,
    end_version INTEGER NOT NULL,
    end_timestamp INTEGER,
    state TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS chunks_doc_end ON chunks(doc_id, end_version);
CREATE TABLE IF NOT EXISTS blobs (
    doc_id INTEGER NOT NULL,
    hash TEXT NOT NULL,
    byte_length INTEGER NOT NULL,
    string_length INTEGER,
    PRIMARY KEY (doc_id, hash)
);
CREATE TABLE IF NOT EXISTS projects (
    doc_id INTEGER PRIMARY KEY,
    mongo_id TEXT NOT NULL
);
"#;

const CHUNK_COLUMNS: &str = "id, start_version, end_version, end_timestamp";

pub struct RelationalBackend {
    conn: Mutex<Connection>,
}

impl RelationalBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn doc_id(project_id: &HistoryId) -> Result<i64> {
    match project_id {
        HistoryId::Postgres(id) => i64::try_from(*id)
            .map_err(|_| StoreError::InvalidId(format!("history id out of range: {id}"))),
        HistoryId::Mongo(id) => Err(StoreError::InvalidId(format!(
            "relational backend cannot store history id {id}"
        ))),
    }
}

fn row_id(chunk_id: &ChunkId) -> Result<i64> {
    chunk_id
        .0
        .parse()
        .map_err(|_| StoreError::InvalidId(format!("not a relational chunk id: {chunk_id}")))
}

fn to_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(|t| t.timestamp_millis())
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<ChunkRecord> {
    let id: i64 = row.get(0)?;
    let start: i64 = row.get(1)?;
    let end: i64 = row.get(2)?;
    let ts: Option<i64> = row.get(3)?;
    Ok(ChunkRecord {
        id: ChunkId(id.to_string()),
        start_version: start as u64,
        end_version: end as u64,
        end_timestamp: ts.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
    })
}

fn blob_from_row(row: &Row<'_>) -> rusqlite::Result<(String, i64, Option<i64>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn to_blob((hash, byte_length, string_length): (String, i64, Option<i64>)) -> Result<Blob> {
    Ok(Blob {
        hash: BlobHash::from_hex(&hash)?,
        byte_length: byte_length as u64,
        string_length: string_length.map(|n| n as usize),
    })
}

fn conflict(project_id: &HistoryId, detail: impl Into<String>) -> StoreError {
    StoreError::ChunkVersionConflict {
        project_id: project_id.to_string(),
        detail: detail.into(),
    }
}

fn latest_active(conn: &Connection, doc: i64) -> rusqlite::Result<Option<ChunkRecord>> {
    conn.query_row(
        &format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE doc_id = ?1 AND state = 'active' \
             ORDER BY end_version DESC LIMIT 1"
        ),
        params![doc],
        chunk_from_row,
    )
    .optional()
}

impl MetadataBackend for RelationalBackend {
    fn get_latest_chunk(&self, project_id: &HistoryId) -> Result<Option<ChunkRecord>> {
        let doc = doc_id(project_id)?;
        Ok(latest_active(&self.conn.lock(), doc)?)
    }

    fn get_chunk_for_version(&self, project_id: &HistoryId, version: u64) -> Result<Option<ChunkRecord>> {
        let doc = doc_id(project_id)?;
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {CHUNK_COLUMNS} FROM chunks \
                     WHERE doc_id = ?1 AND state = 'active' AND end_version >= ?2 \
                     ORDER BY end_version ASC LIMIT 1"
                ),
                params![doc, version as i64],
                chunk_from_row,
            )
            .optional()?)
    }

    fn get_chunk_for_timestamp(
        &self,
        project_id: &HistoryId,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<ChunkRecord>> {
        let doc = doc_id(project_id)?;
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                &format!(
                    "SELECT {CHUNK_COLUMNS} FROM chunks \
                     WHERE doc_id = ?1 AND state = 'active' AND end_timestamp >= ?2 \
                     ORDER BY end_version ASC LIMIT 1"
                ),
                params![doc, timestamp.timestamp_millis()],
                chunk_from_row,
            )
            .optional()?;
        match found {
            Some(record) => Ok(Some(record)),
            None => Ok(latest_active(&conn, doc)?),
        }
    }

    fn get_chunks_from_version(
        &self,
        project_id: &HistoryId,
        from_version: u64,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>> {
        let doc = doc_id(project_id)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks \
             WHERE doc_id = ?1 AND state = 'active' AND end_version >= ?2 \
             ORDER BY start_version ASC LIMIT ?3"
        ))?;
        let records = stmt
            .query_map(params![doc, from_version as i64, limit as i64], chunk_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn get_all_chunk_ids(&self, project_id: &HistoryId) -> Result<Vec<ChunkId>> {
        let doc = doc_id(project_id)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM chunks WHERE doc_id = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![doc], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids.into_iter().map(|id| ChunkId(id.to_string())).collect())
    }

    fn insert_pending_chunk(&self, project_id: &HistoryId, start_version: u64, end_version: u64) -> Result<ChunkId> {
        let doc = doc_id(project_id)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chunks (doc_id, start_version, end_version, state) VALUES (?1, ?2, ?3, ?4)",
            params![
                doc,
                start_version as i64,
                end_version as i64,
                ChunkState::Pending.as_str()
            ],
        )?;
        Ok(ChunkId(conn.last_insert_rowid().to_string()))
    }

    fn confirm_create(
        &self,
        project_id: &HistoryId,
        chunk_id: &ChunkId,
        end_timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let doc = doc_id(project_id)?;
        let id = row_id(chunk_id)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let start: i64 = tx
            .query_row(
                "SELECT start_version FROM chunks WHERE id = ?1 AND doc_id = ?2 AND state = 'pending'",
                params![id, doc],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("pending chunk {chunk_id}")))?;

        let clash: Option<i64> = tx
            .query_row(
                "SELECT id FROM chunks WHERE doc_id = ?1 AND state = 'active' AND start_version = ?2",
                params![doc, start],
                |row| row.get(0),
            )
            .optional()?;
        if clash.is_some() {
            return Err(conflict(project_id, format!("a chunk already starts at version {start}")));
        }
        if let Some(latest) = latest_active(&tx, doc)? {
            if latest.end_version as i64 != start {
                return Err(conflict(
                    project_id,
                    format!("new chunk starts at {start}, latest ends at {}", latest.end_version),
                ));
            }
        }

        tx.execute(
            "UPDATE chunks SET state = 'active', end_timestamp = ?1 WHERE id = ?2",
            params![to_millis(end_timestamp), id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn confirm_update(
        &self,
        project_id: &HistoryId,
        expected_end_version: u64,
        old_chunk_id: &ChunkId,
        new_chunk_id: &ChunkId,
        end_timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let doc = doc_id(project_id)?;
        let old_id = row_id(old_chunk_id)?;
        let new_id = row_id(new_chunk_id)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        match latest_active(&tx, doc)? {
            Some(latest) if latest.id == *old_chunk_id && latest.end_version == expected_end_version => {}
            Some(latest) => {
                return Err(conflict(
                    project_id,
                    format!(
                        "expected chunk {old_chunk_id} ending at {expected_end_version}, latest is {} ending at {}",
                        latest.id, latest.end_version
                    ),
                ))
            }
            None => return Err(conflict(project_id, "no active chunk to update")),
        }

        tx.execute(
            "UPDATE chunks SET state = 'closed' WHERE id = ?1 AND doc_id = ?2",
            params![old_id, doc],
        )?;
        let activated = tx.execute(
            "UPDATE chunks SET state = 'active', end_timestamp = ?1 \
             WHERE id = ?2 AND doc_id = ?3 AND state = 'pending'",
            params![to_millis(end_timestamp), new_id, doc],
        )?;
        if activated != 1 {
            return Err(StoreError::NotFound(format!("pending chunk {new_chunk_id}")));
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_pending_chunk(&self, project_id: &HistoryId, chunk_id: &ChunkId) -> Result<()> {
        let doc = doc_id(project_id)?;
        let id = row_id(chunk_id)?;
        self.conn.lock().execute(
            "DELETE FROM chunks WHERE id = ?1 AND doc_id = ?2 AND state = 'pending'",
            params![id, doc],
        )?;
        Ok(())
    }

    fn delete_project_chunks(&self, project_id: &HistoryId) -> Result<()> {
        let doc = doc_id(project_id)?;
        self.conn
            .lock()
            .execute("DELETE FROM chunks WHERE doc_id = ?1", params![doc])?;
        Ok(())
    }

    fn get_mongo_project_id(&self, project_id: &HistoryId) -> Result<Option<String>> {
        let doc = doc_id(project_id)?;
        Ok(self
            .conn
            .lock()
            .query_row(
                "SELECT mongo_id FROM projects WHERE doc_id = ?1",
                params![doc],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_mongo_project_id(&self, project_id: &HistoryId, mongo_id: &str) -> Result<()> {
        let doc = doc_id(project_id)?;
        self.conn.lock().execute(
            "INSERT INTO projects (doc_id, mongo_id) VALUES (?1, ?2) \
             ON CONFLICT(doc_id) DO UPDATE SET mongo_id = excluded.mongo_id",
            params![doc, mongo_id],
        )?;
        Ok(())
    }

    fn insert_blob(&self, project_id: &HistoryId, blob: &Blob) -> Result<()> {
        let doc = doc_id(project_id)?;
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO blobs (doc_id, hash, byte_length, string_length) VALUES (?1, ?2, ?3, ?4)",
            params![
                doc,
                blob.hash.to_hex(),
                blob.byte_length as i64,
                blob.string_length.map(|n| n as i64)
            ],
        )?;
        Ok(())
    }

    fn find_blob(&self, project_id: &HistoryId, hash: &BlobHash) -> Result<Option<Blob>> {
        let doc = doc_id(project_id)?;
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT hash, byte_length, string_length FROM blobs WHERE doc_id = ?1 AND hash = ?2",
                params![doc, hash.to_hex()],
                blob_from_row,
            )
            .optional()?;
        row.map(to_blob).transpose()
    }

    fn find_blobs(&self, project_id: &HistoryId, hashes: &[BlobHash]) -> Result<Vec<Blob>> {
        let doc = doc_id(project_id)?;
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; hashes.len()].join(", ");
        let sql = format!(
            "SELECT hash, byte_length, string_length FROM blobs WHERE doc_id = {doc} AND hash IN ({placeholders})"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(hashes.iter().map(|h| h.to_hex())), blob_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(to_blob).collect()
    }

    fn delete_blobs(&self, project_id: &HistoryId) -> Result<()> {
        let doc = doc_id(project_id)?;
        self.conn
            .lock()
            .execute("DELETE FROM blobs WHERE doc_id = ?1", params![doc])?;
        Ok(())
    }
}

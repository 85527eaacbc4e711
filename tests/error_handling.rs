//! Error handling tests: conflicts, invalid input, and damaged backups.

use chrono::{Duration, Utc};
use history_store::backup::MemoryBackupStatusStore;
use history_store::blobs::hash::content_hash;
use history_store::model::RESYNC_ORIGIN;
use history_store::persist::{HashMismatchPolicy, RecordingResync};
use history_store::storage::MemoryObjectStore;
use history_store::{
    Backends, BlobHash, Change, DocumentBackend, File, GlobalBlobs, HistoryId, Operation, QueueOptions,
    RelationalBackend, Settings, Store, StoreError, TextOperation,
};
use std::sync::Arc;

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.backup.root_keys = vec!["5c".repeat(32)];
    settings.backup.retry_delay_ms = 0;
    settings
}

struct Harness {
    store: Store,
    objects: Arc<MemoryObjectStore>,
    resync: Arc<RecordingResync>,
}

fn harness(settings: Settings) -> Harness {
    let objects = Arc::new(MemoryObjectStore::new());
    let resync = Arc::new(RecordingResync::default());
    let store = Store::new(
        settings,
        Backends {
            objects: objects.clone(),
            relational: Arc::new(RelationalBackend::open_in_memory().unwrap()),
            document: Arc::new(DocumentBackend::in_memory()),
            globals: GlobalBlobs::default(),
            backup_status: Arc::new(MemoryBackupStatusStore::new()),
            resync: resync.clone(),
        },
    )
    .unwrap();
    Harness { store, objects, resync }
}

fn add(name: &str, content: &str) -> Change {
    Change::new(vec![Operation::add_file(name, File::from_string(content))], Utc::now())
}

fn edit_with_hash(name: &str, base_len: usize, text: &str, hash: Option<String>) -> Change {
    let mut change = Change::new(
        vec![Operation::edit_file(name, TextOperation::new().retain(base_len).insert(text))],
        Utc::now(),
    );
    if let Operation::EditFile { content_hash, .. } = &mut change.operations_mut()[0] {
        *content_hash = hash;
    }
    change
}

fn seeded(h: &Harness, project_id: &HistoryId) {
    h.store.initialize_project(project_id).unwrap();
    h.store
        .persist_changes(project_id, vec![add("main.tex", "abc")], 0)
        .unwrap()
        .unwrap();
}

fn persisted_end(store: &Store, project_id: &HistoryId) -> u64 {
    store
        .chunks()
        .get_latest_chunk_metadata(project_id)
        .unwrap()
        .unwrap()
        .end_version
}

// --- Concurrency Conflicts ---

#[test]
fn test_stale_client_end_version() {
    let h = harness(settings());
    let project_id = HistoryId::Postgres(2001);
    seeded(&h, &project_id);

    let err = h
        .store
        .persist_changes(&project_id, vec![edit_with_hash("main.tex", 3, "d", None)], 0)
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(matches!(
        err,
        StoreError::ConflictingEndVersion {
            client_end_version: 0,
            latest_end_version: 1
        }
    ));
    assert_eq!(persisted_end(&h.store, &project_id), 1);
}

#[test]
fn test_stale_chunk_update_is_rejected_whole() {
    let h = harness(settings());
    let project_id = HistoryId::Postgres(2002);
    seeded(&h, &project_id);

    let mut chunk = h.store.chunks().load_latest(&project_id, true).unwrap();
    chunk.push_change(edit_with_hash("main.tex", 3, "d", None));
    let err = h.store.chunks().update(&project_id, 0, &chunk).unwrap_err();
    assert!(matches!(err, StoreError::ChunkVersionConflict { .. }));

    let records = h.store.chunks().get_project_chunks(&project_id).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].end_version, 1);
    assert_eq!(h.store.load_latest(&project_id).unwrap().changes().len(), 1);
}

#[test]
fn test_queue_on_stale_head() {
    let h = harness(settings());
    let project_id = HistoryId::Postgres(2003);
    seeded(&h, &project_id);
    h.store
        .queue_changes(&project_id, &[add("b.tex", "b")], 1, QueueOptions::default())
        .unwrap();

    let err = h
        .store
        .queue_changes(&project_id, &[add("c.tex", "c")], 1, QueueOptions::default())
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(h.store.load_latest(&project_id).unwrap().end_version(), 2);
}

// --- Invalid Changes ---

#[test]
fn test_invalid_change_queues_nothing() {
    let h = harness(settings());
    let project_id = HistoryId::Postgres(2004);
    seeded(&h, &project_id);

    let changes = vec![add("ok.tex", "fine"), edit_with_hash("missing.tex", 0, "x", None)];
    let err = h
        .store
        .queue_changes(&project_id, &changes, 1, QueueOptions::default())
        .unwrap_err();
    assert!(err.is_invalid_change(), "unexpected error: {err}");
    assert_eq!(h.store.load_latest(&project_id).unwrap().end_version(), 1);
    assert_eq!(h.store.buffer().get_state(&project_id).unwrap().head_version, None);
}

#[test]
fn test_strict_hash_policy_rejects_drift() {
    let mut settings = settings();
    settings.content_hash_policy = HashMismatchPolicy::Strict;
    let h = harness(settings);
    let project_id = HistoryId::Postgres(2005);
    seeded(&h, &project_id);

    let drifted = edit_with_hash("main.tex", 3, "d", Some(content_hash("not abcd")));
    let err = h.store.persist_changes(&project_id, vec![drifted], 1).unwrap_err();
    assert!(matches!(err, StoreError::ContentHashMismatch { .. }));
    assert_eq!(persisted_end(&h.store, &project_id), 1);

    let matching = edit_with_hash("main.tex", 3, "d", Some(content_hash("abcd")));
    h.store.persist_changes(&project_id, vec![matching], 1).unwrap().unwrap();
    assert_eq!(persisted_end(&h.store, &project_id), 2);
}

#[test]
fn test_resync_changes_never_trigger_resync() {
    let mut settings = settings();
    settings.limits.auto_resync = true;
    let h = harness(settings);
    let project_id = HistoryId::Postgres(2006);
    seeded(&h, &project_id);

    let drifted = edit_with_hash("main.tex", 3, "d", Some(content_hash("wrong"))).with_origin(RESYNC_ORIGIN);
    h.store
        .queue_changes(&project_id, &[drifted], 1, QueueOptions::default())
        .unwrap();
    let result = h.store.persist_buffer(&project_id).unwrap();
    assert!(result.resync_needed);
    assert!(h.resync.requests().is_empty());

    let drifted = edit_with_hash("main.tex", 4, "e", Some(content_hash("wrong")));
    h.store
        .queue_changes(&project_id, &[drifted], 2, QueueOptions::default())
        .unwrap();
    h.store.persist_buffer(&project_id).unwrap();
    assert_eq!(h.resync.requests(), vec![project_id.clone()]);
}

#[test]
fn test_missing_project_and_bad_ids() {
    let h = harness(settings());
    let err = h.store.load_latest(&HistoryId::Postgres(2007)).unwrap_err();
    assert!(err.is_not_found());

    for bad in ["", "0", "abc", "5f0c9e8b7a6d5c4b3a29180"] {
        assert!(matches!(HistoryId::parse(bad), Err(StoreError::InvalidId(_))), "{bad:?}");
    }

    let mut settings = settings();
    settings.backup.root_keys = vec!["abcd".into()];
    assert!(matches!(Store::in_memory(settings), Err(StoreError::Config(_))));
}

// --- Backups ---

#[test]
fn test_altered_backup_blob_is_detected() {
    let h = harness(settings());
    let project_id = HistoryId::Postgres(2008);
    seeded(&h, &project_id);
    h.store.backup_project(&project_id).unwrap();
    assert_eq!(h.store.verify_project(&project_id).unwrap(), 1);

    // same length, different content
    let hash = BlobHash::of_content(b"abc");
    h.store
        .backup()
        .persistor()
        .for_project(&project_id)
        .unwrap()
        .put_blob(&hash, b"abd")
        .unwrap();

    let err = h.store.verify_project(&project_id).unwrap_err();
    assert!(matches!(err, StoreError::BackupCorrupted { .. }), "unexpected error: {err}");
    assert!(matches!(
        h.store.verify_blobs(&project_id, &[hash]),
        Err(StoreError::BackupCorrupted { .. })
    ));
}

#[test]
fn test_backup_behind_latest_chunk_is_an_rpo_violation() {
    let h = harness(settings());
    let project_id = HistoryId::Postgres(2009);
    seeded(&h, &project_id);
    assert!(matches!(
        h.store.verify_project(&project_id),
        Err(StoreError::BackupRpoViolation { .. })
    ));
}

#[test]
fn test_delete_refused_while_history_remains() {
    let h = harness(settings());
    let project_id = HistoryId::Postgres(2010);
    let web_id = "64b7f0c2a1d3e4f5a6b7c8da";
    seeded(&h, &project_id);
    h.store.backup_project(&project_id).unwrap();
    h.store
        .record_soft_deletion(web_id, Some(project_id.clone()), Utc::now() - Duration::days(120))
        .unwrap();
    let before = h.objects.object_count();

    let err = h.store.delete_project_backup(web_id).unwrap_err();
    assert!(matches!(err, StoreError::NotReadyToDelete { .. }));
    assert_eq!(h.objects.object_count(), before);
    assert_eq!(h.store.verify_project(&project_id).unwrap(), 1);
}

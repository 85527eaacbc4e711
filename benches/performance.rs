//! Performance benchmarks for the history store.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use history_store::blobs::hash::git_blob_hash_reader;
use history_store::{Change, File, HistoryId, Operation, QueueOptions, Settings, Store, TextOperation};
use std::io::Cursor;
use tempfile::TempDir;

fn create_store(dir: &TempDir) -> Store {
    Store::open_local(dir.path().join("store"), Settings::default()).unwrap()
}

fn seeded(store: &Store, project_id: &HistoryId) {
    store.initialize_project(project_id).unwrap();
    store
        .persist_changes(
            project_id,
            vec![Change::new(
                vec![Operation::add_file("main.tex", File::from_string("x"))],
                Utc::now(),
            )],
            0,
        )
        .unwrap();
}

fn append(len: usize) -> Change {
    Change::new(
        vec![Operation::edit_file(
            "main.tex",
            TextOperation::new().retain(len).insert("y"),
        )],
        Utc::now(),
    )
}

/// Benchmark direct persists of single edits
fn bench_persist_changes(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);
    let project_id = HistoryId::Postgres(1);
    seeded(&store, &project_id);
    let mut end = 1u64;

    c.bench_function("persist_single_edit", |b| {
        b.iter(|| {
            let change = append(end as usize);
            black_box(store.persist_changes(&project_id, vec![change], end).unwrap());
            end += 1;
        });
    });
}

/// Benchmark draining buffers of varying depth
fn bench_persist_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("persist_buffer");

    for depth in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("queued_changes", depth), &depth, |b, &depth| {
            b.iter_batched(
                || {
                    let store = Store::in_memory(Settings::default()).unwrap();
                    let project_id = HistoryId::Postgres(2);
                    seeded(&store, &project_id);
                    let changes: Vec<_> = (0..depth).map(|i| append(1 + i)).collect();
                    store
                        .queue_changes(&project_id, &changes, 1, QueueOptions::default())
                        .unwrap();
                    (store, project_id)
                },
                |(store, project_id)| black_box(store.persist_buffer(&project_id).unwrap()),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark loading the latest chunk at varying chunk lengths
fn bench_load_latest(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_latest");

    for length in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("chunk_changes", length), &length, |b, &length| {
            let dir = TempDir::new().unwrap();
            let store = create_store(&dir);
            let project_id = HistoryId::Postgres(3);
            seeded(&store, &project_id);
            let changes: Vec<_> = (0..length).map(|i| append(1 + i)).collect();
            store.persist_changes(&project_id, changes, 1).unwrap();

            b.iter(|| {
                black_box(store.load_latest(&project_id).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark blob operations
fn bench_blobs(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);
    let project_id = HistoryId::Postgres(4);
    store.initialize_project(&project_id).unwrap();
    let blobs = store.blobs(&project_id);

    let content: Vec<u8> = (0..10000).map(|i| (i % 256) as u8).collect();

    c.bench_function("blob_put_10kb", |b| {
        b.iter(|| {
            black_box(blobs.put_bytes(&content, None).unwrap());
        });
    });

    c.bench_function("blob_hash_stream_10kb", |b| {
        b.iter(|| {
            black_box(git_blob_hash_reader(Cursor::new(&content), content.len() as u64).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_persist_changes,
    bench_persist_buffer,
    bench_load_latest,
    bench_blobs,
);

criterion_main!(benches);

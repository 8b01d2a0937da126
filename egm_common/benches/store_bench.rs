//! Slot store transaction benchmarks.
//!
//! Measures commit latency of the in-memory store and of the file-backed
//! store with its atomic image replacement.

use criterion::{Criterion, criterion_group, criterion_main};
use egm_common::persistence::PersistentStore;
use std::hint::black_box;

fn bench_in_memory_commit(c: &mut Criterion) {
    let store = PersistentStore::in_memory();
    let block = store.create_block("Ledger", 16).unwrap();

    c.bench_function("store_commit_in_memory", |b| {
        b.iter(|| {
            let mut tx = store.begin();
            tx.add(&block, black_box(3), 10).unwrap();
            tx.commit().unwrap();
        });
    });
}

fn bench_file_commit(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = PersistentStore::open(dir.path().join("bench.bin")).expect("open store");
    let ledger = store.create_block("Ledger", 16).unwrap();
    let remaining = store.create_block("Remaining", 16).unwrap();

    c.bench_function("store_commit_file_drain", |b| {
        b.iter(|| {
            let mut tx = store.begin();
            tx.add(&ledger, 0, -10).unwrap();
            tx.add(&remaining, 0, black_box(10)).unwrap();
            tx.commit().unwrap();
        });
    });
}

criterion_group!(benches, bench_in_memory_commit, bench_file_commit);
criterion_main!(benches);

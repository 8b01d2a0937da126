//! Edge detection benchmarks.
//!
//! Measures one poll cycle diff for a quiet board, a single change and a
//! full 64-bit flip.

use criterion::{Criterion, criterion_group, criterion_main};
use egm_hal::poller::detect_edges;
use std::hint::black_box;

fn bench_detect_edges(c: &mut Criterion) {
    c.bench_function("detect_edges_no_change", |b| {
        b.iter(|| detect_edges(black_box(0xA5A5), black_box(0xA5A5), u64::MAX, 0));
    });

    c.bench_function("detect_edges_single_bit", |b| {
        b.iter(|| detect_edges(black_box(0), black_box(1 << 17), u64::MAX, 0));
    });

    c.bench_function("detect_edges_full_flip", |b| {
        b.iter(|| detect_edges(black_box(0), black_box(u64::MAX), u64::MAX, 0));
    });
}

criterion_group!(benches, bench_detect_edges);
criterion_main!(benches);

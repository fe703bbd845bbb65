//! Rebase and patch benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::BTreeMap;
use tidepool_bench::utils::{mutate, random_document, write_history};
use tidepool_core::{apply_to_views, fold_into, Operation, ViewMap};

fn history(versions: usize) -> Vec<Operation> {
    let mut docs = vec![random_document(8, 2)];
    for _ in 1..versions {
        let next = mutate(&docs[docs.len() - 1], 4);
        docs.push(next);
    }
    write_history(&docs).unwrap()
}

/// Benchmark folding a whole history into baselines.
fn bench_fold(c: &mut Criterion) {
    let mut group = c.benchmark_group("fold");

    for versions in [10, 50, 200].iter() {
        let operations = history(*versions);
        let ack = operations[operations.len() / 2].timestamp.clone();
        group.throughput(Throughput::Elements(operations.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(versions), versions, |b, _| {
            b.iter(|| {
                let mut baselines = BTreeMap::new();
                let mut remaining = operations.clone();
                let summary = fold_into(&mut baselines, &mut remaining, black_box(&ack));
                black_box((summary, baselines, remaining));
            });
        });
    }
    group.finish();
}

/// Benchmark replaying a history onto empty views.
fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");

    for versions in [10, 50, 200].iter() {
        let operations = history(*versions);
        group.throughput(Throughput::Elements(operations.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(versions), versions, |b, _| {
            b.iter(|| {
                let mut views = ViewMap::new();
                apply_to_views(&mut views, black_box(&operations));
                black_box(views);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fold, bench_replay);
criterion_main!(benches);

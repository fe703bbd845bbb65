//! Diff engine benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tidepool_bench::utils::{identified, list_document, mutate, random_document};
use tidepool_core::{diff_to_patches, list_patch, DiffOptions, DocTree, SequentialSubIds, Timestamp};

fn clock() -> impl FnMut() -> Timestamp {
    let mut tick = 0;
    move || {
        tick += 1;
        Timestamp::new(0, tick, 0, "bench")
    }
}

/// Benchmark diffing a document against a lightly edited copy.
fn bench_diff_documents(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff_document");

    for width in [4, 8, 16].iter() {
        let before = random_document(*width, 2);
        let after = mutate(&before, 5);
        let from = identified(&before).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(width), width, |b, _| {
            b.iter(|| {
                let mut to = DocTree::from_json(&after).unwrap();
                let mut ids = SequentialSubIds::new("n");
                let ops = diff_to_patches(
                    black_box(&from),
                    &mut to,
                    &mut clock(),
                    &mut ids,
                    &DiffOptions::default(),
                )
                .unwrap();
                black_box(ops);
            });
        });
    }
    group.finish();
}

/// Benchmark reordering identified list items.
fn bench_diff_reorder(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff_reorder");

    for len in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*len as u64));
        let from = identified(&list_document(*len)).unwrap();
        let mut moved = from.clone();
        let list = moved.child(moved.root(), "items").unwrap();
        moved.move_item(list, 0, *len - 1);

        group.bench_with_input(BenchmarkId::from_parameter(len), len, |b, _| {
            b.iter(|| {
                let mut to = moved.clone();
                let mut ids = SequentialSubIds::new("n");
                let ops = diff_to_patches(
                    black_box(&from),
                    &mut to,
                    &mut clock(),
                    &mut ids,
                    &DiffOptions::default(),
                )
                .unwrap();
                black_box(ops);
            });
        });
    }
    group.finish();
}

/// Benchmark scalar list patches.
fn bench_list_patch(c: &mut Criterion) {
    let mut group = c.benchmark_group("list_patch");

    for len in [10, 100, 1000].iter() {
        let old: Vec<_> = (0..*len).map(serde_json::Value::from).collect();
        let mut new = old.clone();
        new.insert(*len / 2, serde_json::Value::from("inserted"));
        new.remove(*len / 4);

        group.throughput(Throughput::Elements(*len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), len, |b, _| {
            b.iter(|| black_box(list_patch(black_box(&old), black_box(&new))));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_diff_documents, bench_diff_reorder, bench_list_patch);
criterion_main!(benches);

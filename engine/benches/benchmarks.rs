//! Performance benchmarks for stash-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use stash_engine::{payload_from_value, Mutation, Outbox, Payload};

fn fields(value: serde_json::Value) -> Payload {
    payload_from_value(value).unwrap()
}

fn populated_outbox(entities: u64) -> Outbox {
    let mut outbox = Outbox::new();
    for i in 0..entities {
        outbox.append(
            Mutation::insert(
                format!("m_{}", i),
                "events",
                format!("evt_{}", i),
                fields(json!({"title": format!("Event {}", i), "start": i})),
                i,
            ),
            false,
        );
    }
    outbox
}

fn bench_outbox_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("outbox_append");

    // New entity per append
    group.bench_function("append_new_entity", |b| {
        let mut outbox = Outbox::new();
        let mut id = 0u64;

        b.iter(|| {
            id += 1;
            outbox.append(
                black_box(Mutation::insert(
                    format!("m_{}", id),
                    "events",
                    format!("evt_{}", id),
                    fields(json!({"title": "Test"})),
                    id,
                )),
                false,
            )
        })
    });

    // Repeated updates to one entity stay a single entry
    group.bench_function("append_merge_same_entity", |b| {
        let mut outbox = populated_outbox(1);
        let mut id = 0u64;

        b.iter(|| {
            id += 1;
            outbox.append(
                black_box(Mutation::update(
                    format!("u_{}", id),
                    "events",
                    "evt_0",
                    fields(json!({"start": id})),
                    id,
                )),
                false,
            )
        })
    });

    group.finish();
}

fn bench_outbox_flush_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("outbox_flush_path");

    for size in [100u64, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::new("snapshot", size), size, |b, &size| {
            let outbox = populated_outbox(size);
            b.iter(|| black_box(outbox.snapshot()))
        });

        group.bench_with_input(BenchmarkId::new("remove_all", size), size, |b, &size| {
            let ids: Vec<String> = (0..size).map(|i| format!("m_{}", i)).collect();
            b.iter_batched(
                || populated_outbox(size),
                |mut outbox| black_box(outbox.remove(&ids)),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_outbox_append, bench_outbox_flush_path);
criterion_main!(benches);

//! Event log and durable store benchmarks.

use bpmnflow_core::event::{DomainEvent, ModelMeta, INSTANCE_MACHINE};
use bpmnflow_core::{PersistedEvent, TimeUuid};
use bpmnflow_storage::record::decode_all;
use bpmnflow_storage::{DurableStore, EventRecord, FileStore, MemoryStore};
use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;

static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn events(n: usize, value_size: usize) -> Vec<PersistedEvent> {
    let filler = "x".repeat(value_size);
    (0..n)
        .map(|i| {
            PersistedEvent::new(
                TimeUuid::MIN,
                INSTANCE_MACHINE,
                "bench",
                ModelMeta::default(),
                DomainEvent::ContextAdded {
                    key: format!("k{}", i),
                    value: json!({"seq": i, "filler": filler}),
                },
            )
        })
        .collect()
}

fn bench_record_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_encode");

    for size in [64usize, 1024, 16 * 1024] {
        let record = EventRecord::new(1, events(1, size).remove(0));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &record, |b, record| {
            let mut buf = BytesMut::with_capacity(size * 2);
            b.iter(|| {
                buf.clear();
                record.encode_into(&mut buf).unwrap();
                black_box(buf.len())
            });
        });
    }

    group.finish();
}

fn bench_record_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_decode");

    for count in [10usize, 100, 1000] {
        let mut buf = BytesMut::new();
        for (i, event) in events(count, 128).into_iter().enumerate() {
            EventRecord::new(i as u64, event)
                .encode_into(&mut buf)
                .unwrap();
        }
        let data = buf.freeze();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("log", count), &data, |b, data| {
            b.iter(|| black_box(decode_all(data).unwrap()))
        });
    }

    group.finish();
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_append");
    group.sample_size(20);

    let memory = MemoryStore::new();
    let dir = TempDir::new().unwrap();
    let file = FileStore::open(dir.path()).unwrap();
    let stores: [(&str, &dyn DurableStore); 2] = [("memory", &memory), ("file", &file)];

    for (name, store) in stores {
        for batch in [1usize, 10, 100] {
            let template = events(batch, 128);
            group.throughput(Throughput::Elements(batch as u64));
            group.bench_with_input(BenchmarkId::new(name, batch), &batch, |b, _| {
                b.iter(|| {
                    let id = format!("append-{}", INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed));
                    let mut batch = template.clone();
                    store.append(&id, None, &mut batch).unwrap();
                    black_box(store.save_snapshot(&id, 0, None, None).unwrap())
                });
            });
        }
    }

    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_read");
    group.sample_size(20);

    let dir = TempDir::new().unwrap();
    let store = FileStore::open(dir.path()).unwrap();

    for count in [10usize, 100, 1000] {
        let id = format!("read-{}", count);
        let mut batch = events(count, 128);
        store.append(&id, None, &mut batch).unwrap();
        store.save_snapshot(&id, 0, None, None).unwrap();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("file", count), &id, |b, id| {
            b.iter(|| black_box(store.read(id).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_record_encode,
    bench_record_decode,
    bench_append,
    bench_read,
);

criterion_main!(benches);

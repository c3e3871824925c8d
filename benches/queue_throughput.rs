//! Durable queue benchmarks.
//!
//! Run with: `cargo bench --bench queue_throughput`
//! Compare baselines: `cargo bench --bench queue_throughput -- --baseline main`
//!
//! These measure the paths a busy tracking client hammers: single-entry
//! append (fsync dominated), batched append, and the drain cycle the sync
//! worker runs (batched read plus acknowledgment).

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use tempfile::TempDir;
use tracklet::operation::{AttributePath, Operation, SeriesPoint, Value};
use tracklet::queue::DiskQueue;
use tracklet::QueueConfig;

fn sample_operation(i: u64) -> Operation {
    match i % 3 {
        0 => Operation::Assign {
            path: AttributePath::parse("params/lr"),
            value: Value::Float(0.001),
        },
        1 => Operation::Append {
            path: AttributePath::parse("metrics/loss"),
            point: SeriesPoint {
                value: 0.42,
                timestamp_ms: 1_700_000_000_000 + i,
                step: Some(i as f64),
            },
        },
        _ => Operation::AddTags {
            path: AttributePath::parse("sys/tags"),
            tags: vec![format!("tag-{}", i)],
        },
    }
}

/// Single-entry append: one frame encode plus one fsync per call
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    group.throughput(Throughput::Elements(1));
    group.sample_size(20);

    for (name, operation) in [
        ("scalar", sample_operation(0)),
        ("series_point", sample_operation(1)),
        ("tags", sample_operation(2)),
    ] {
        group.bench_function(name, |b| {
            let dir = TempDir::new().unwrap();
            let mut queue = DiskQueue::open(dir.path(), &QueueConfig::default()).unwrap();
            b.iter(|| queue.append(black_box(&operation)).unwrap());
        });
    }

    group.finish();
}

/// Batched append: the fsync amortizes over the batch
fn bench_append_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_batch");
    group.sample_size(20);

    for batch_size in [16u64, 128, 1024] {
        let batch: Vec<Operation> = (0..batch_size).map(sample_operation).collect();
        group.throughput(Throughput::Elements(batch_size));
        group.bench_function(format!("entries_{}", batch_size), |b| {
            let dir = TempDir::new().unwrap();
            let mut queue = DiskQueue::open(dir.path(), &QueueConfig::default()).unwrap();
            b.iter(|| queue.append_batch(black_box(&batch)).unwrap());
        });
    }

    group.finish();
}

/// Peek-style batched read over a filled queue; nothing is acked, so each
/// call re-reads from the same mark
fn bench_get_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_batch");
    group.sample_size(20);

    for batch_size in [16usize, 64, 256] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_function(format!("entries_{}", batch_size), |b| {
            let dir = TempDir::new().unwrap();
            let mut queue = DiskQueue::open(dir.path(), &QueueConfig::default()).unwrap();
            let fill: Vec<Operation> = (0..1024).map(sample_operation).collect();
            queue.append_batch(&fill).unwrap();
            b.iter(|| queue.get_batch(black_box(batch_size), usize::MAX).unwrap());
        });
    }

    group.finish();
}

/// Full drain cycle as the sync worker runs it: read a batch, acknowledge
/// it, repeat until empty. Each acknowledgment persists the ack mark.
fn bench_drain_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain_cycle");
    group.throughput(Throughput::Elements(256));
    group.sample_size(10);

    group.bench_function("entries_256_batch_64", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let mut queue = DiskQueue::open(dir.path(), &QueueConfig::default()).unwrap();
                let fill: Vec<Operation> = (0..256).map(sample_operation).collect();
                queue.append_batch(&fill).unwrap();
                (dir, queue)
            },
            |(_dir, mut queue)| {
                while !queue.is_drained() {
                    let batch = queue.get_batch(64, usize::MAX).unwrap();
                    let last = batch.last().map(|e| e.sequence).unwrap_or(0);
                    queue.ack(black_box(last)).unwrap();
                }
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_append,
    bench_append_batch,
    bench_get_batch,
    bench_drain_cycle
);
criterion_main!(benches);

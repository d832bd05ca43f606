use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tokio::time::Instant;

use leasebus_pubsub::lease::table::Admission;
use leasebus_pubsub::{LeaseTable, MessageId};

const WINDOW: Duration = Duration::from_secs(30);

fn ids(n: usize) -> Vec<MessageId> {
    (0..n).map(|i| MessageId::new(format!("m{i}"))).collect()
}

/// Table pre-filled with `n` pending leases.
fn filled(ids: &[MessageId], now: Instant) -> LeaseTable {
    let table = LeaseTable::new();
    for id in ids {
        table.admit(id, b"payload".to_vec(), now, WINDOW);
    }
    table
}

fn bench_admit_and_ack(c: &mut Criterion) {
    let mut group = c.benchmark_group("admit_and_ack");

    for outstanding in [0usize, 1_000, 10_000] {
        let now = Instant::now();
        let background = ids(outstanding);
        let table = filled(&background, now);
        let id = MessageId::from("hot");

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(outstanding),
            &outstanding,
            |b, _| {
                b.iter(|| {
                    let admitted = table.admit(&id, black_box(vec![0u8; 256]), now, WINDOW);
                    debug_assert!(matches!(admitted, Admission::Leased { .. }));
                    if let Ok(reservation) = table.reserve_ack(&id) {
                        table.finalize_ack(reservation);
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep");

    for outstanding in [100usize, 1_000, 10_000] {
        let now = Instant::now();
        let background = ids(outstanding);

        group.throughput(Throughput::Elements(outstanding as u64));
        group.bench_with_input(
            BenchmarkId::new("all_expired", outstanding),
            &outstanding,
            |b, _| {
                b.iter_batched(
                    || filled(&background, now),
                    |table| black_box(table.sweep(now + WINDOW, 5, WINDOW)),
                    criterion::BatchSize::LargeInput,
                );
            },
        );

        let table = filled(&background, now);
        group.bench_with_input(
            BenchmarkId::new("none_expired", outstanding),
            &outstanding,
            |b, _| {
                b.iter(|| black_box(table.sweep(now, 5, WINDOW)));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_admit_and_ack, bench_sweep);
criterion_main!(benches);

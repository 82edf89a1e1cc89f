use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use cubdb::Db;
use tempfile::tempdir;

fn put_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let dir = tempdir().unwrap();
                    let db: Db<u64, u64> = Db::open(dir.path()).unwrap();
                    (dir, db)
                },
                |(_dir, db)| {
                    for i in 0..size as u64 {
                        db.put(i, i).unwrap();
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn lookup_throughput(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db: Db<u64, u64> = Db::open(dir.path()).unwrap();
    for i in 0..10_000u64 {
        db.put(i, i).unwrap();
    }

    let mut group = c.benchmark_group("lookup");
    group.throughput(Throughput::Elements(1));
    group.bench_function("point_lookup", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = i % 10_000;
            i += 1;
            black_box(db.get(key).unwrap());
        });
    });
    group.finish();
}

criterion_group!(benches, put_throughput, lookup_throughput);
criterion_main!(benches);

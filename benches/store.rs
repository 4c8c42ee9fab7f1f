//! Store benchmarks: point operations and range scans through the full
//! engine (facade -> tree -> allocators -> mmap caches).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;

use chaoskv::Store;

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_put");

    for count in [100usize, 1000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("sequential", count), count, |b, &count| {
            b.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let store = Store::open(dir.path()).unwrap();
                    (dir, store)
                },
                |(dir, mut store)| {
                    for i in 0..count {
                        let key = format!("key{i:08}");
                        let val = format!("val{i:08}");
                        store.put(key.as_bytes(), val.as_bytes()).unwrap();
                    }
                    (dir, store)
                },
            );
        });
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_get");

    for count in [100usize, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("existing_key", count), count, |b, &count| {
            let dir = tempdir().unwrap();
            let mut store = Store::open(dir.path()).unwrap();
            for i in 0..count {
                let key = format!("key{i:08}");
                let val = format!("val{i:08}");
                store.put(key.as_bytes(), val.as_bytes()).unwrap();
            }

            let mut i = 0usize;
            b.iter(|| {
                let key = format!("key{:08}", i % count);
                i += 1;
                black_box(store.get(key.as_bytes()).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_range(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_range");

    let count = 10_000usize;
    group.throughput(Throughput::Elements(count as u64));
    group.bench_function("full_scan_10k", |b| {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        for i in 0..count {
            let key = format!("key{i:08}");
            store.put(key.as_bytes(), key.as_bytes()).unwrap();
        }

        b.iter(|| {
            let mut n = 0usize;
            let mut it = store.range(b"key00000000", b"key99999999").unwrap();
            while it.valid() {
                black_box(it.key().unwrap());
                it.next().unwrap();
                n += 1;
            }
            assert_eq!(n, count);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_put, bench_get, bench_range);
criterion_main!(benches);

//! Storage primitive benchmarks
//!
//! Measures the hot paths of a segment import: buffered list appends, the
//! chunked sort, hash inserts and lookups, and the BCD codec that keeps
//! numeric lexicals inline.

use std::cmp::Ordering;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;
use tristore::codec::{pack_number, unpack_number};
use tristore::{List, LockOp, Lockable, ModelHash, OpenFlags, Resource, ResourceHash};

fn cmp_first_8(a: &[u8], b: &[u8]) -> Ordering {
    a[..8].cmp(&b[..8])
}

fn bench_list_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("list_append");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("quads_10k", |b| {
        b.iter_with_setup(
            || {
                let dir = tempdir().unwrap();
                let list =
                    List::open(dir.path().join("b.list"), 32, OpenFlags::read_write()).unwrap();
                (dir, list)
            },
            |(_dir, mut list)| {
                list.lock(LockOp::Exclusive).unwrap();
                let mut rec = [0u8; 32];
                for i in 0..10_000u64 {
                    rec[..8].copy_from_slice(&i.to_le_bytes());
                    list.add_locked(black_box(&rec)).unwrap();
                }
                list.lock(LockOp::Unlock).unwrap();
            },
        );
    });

    group.finish();
}

fn bench_list_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("list_sort");

    for &rows in &[10_000u64, 100_000] {
        group.throughput(Throughput::Elements(rows));
        group.bench_with_input(BenchmarkId::new("chunked", rows), &rows, |b, &rows| {
            b.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let mut list =
                        List::open(dir.path().join("b.list"), 32, OpenFlags::read_write()).unwrap();
                    list.lock(LockOp::Exclusive).unwrap();
                    let mut rec = [0u8; 32];
                    for i in 0..rows {
                        rec[..8].copy_from_slice(&(rows - i).to_le_bytes());
                        list.add_locked(&rec).unwrap();
                    }
                    list.lock(LockOp::Unlock).unwrap();
                    (dir, list)
                },
                |(_dir, mut list)| {
                    list.sort_chunked(cmp_first_8).unwrap();
                },
            );
        });
    }

    group.finish();
}

fn bench_model_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("model_hash");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("put_1k", |b| {
        b.iter_with_setup(
            || {
                let dir = tempdir().unwrap();
                let mh =
                    ModelHash::open(dir.path().join("b.mhash"), OpenFlags::read_write()).unwrap();
                (dir, mh)
            },
            |(_dir, mut mh)| {
                mh.lock(LockOp::Exclusive).unwrap();
                for k in 1..=1000u64 {
                    mh.put_locked(black_box(k << 10), k as u32).unwrap();
                }
                mh.lock(LockOp::Unlock).unwrap();
            },
        );
    });

    group.bench_function("get_1k", |b| {
        let dir = tempdir().unwrap();
        let mut mh = ModelHash::open(dir.path().join("b.mhash"), OpenFlags::read_write()).unwrap();
        mh.lock(LockOp::Exclusive).unwrap();
        for k in 1..=1000u64 {
            mh.put_locked(k << 10, k as u32).unwrap();
        }
        mh.lock(LockOp::Unlock).unwrap();

        mh.lock(LockOp::Shared).unwrap();
        b.iter(|| {
            for k in 1..=1000u64 {
                black_box(mh.get_locked(black_box(k << 10)).unwrap());
            }
        });
        mh.lock(LockOp::Unlock).unwrap();
    });

    group.finish();
}

fn bench_resource_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("resource_hash");
    group.sample_size(20);
    group.throughput(Throughput::Elements(1000));

    group.bench_function("put_inline_1k", |b| {
        b.iter_with_setup(
            || {
                let dir = tempdir().unwrap();
                let rh =
                    ResourceHash::open(dir.path().join("b.res"), OpenFlags::read_write()).unwrap();
                (dir, rh)
            },
            |(_dir, mut rh)| {
                rh.lock(LockOp::Exclusive).unwrap();
                for i in 0..1000u64 {
                    let res = Resource::new((0x10 + i) << 10, 0, format!("v{i}"));
                    rh.put_locked(black_box(&res)).unwrap();
                }
                rh.lock(LockOp::Unlock).unwrap();
            },
        );
    });

    group.bench_function("get_inline_1k", |b| {
        let dir = tempdir().unwrap();
        let mut rh = ResourceHash::open(dir.path().join("b.res"), OpenFlags::read_write()).unwrap();
        rh.lock(LockOp::Exclusive).unwrap();
        for i in 0..1000u64 {
            rh.put_locked(&Resource::new((0x10 + i) << 10, 0, format!("v{i}")))
                .unwrap();
        }
        rh.lock(LockOp::Unlock).unwrap();

        rh.lock(LockOp::Shared).unwrap();
        b.iter(|| {
            for i in 0..1000u64 {
                black_box(rh.get_locked(black_box((0x10 + i) << 10)).unwrap());
            }
        });
        rh.lock(LockOp::Unlock).unwrap();
    });

    group.finish();
}

fn bench_bcd(c: &mut Criterion) {
    let mut group = c.benchmark_group("bcd");

    group.bench_function("pack", |b| {
        b.iter(|| pack_number(black_box("-1.602176634e-19")))
    });
    group.bench_function("unpack", |b| {
        let packed = pack_number("-1.602176634e-19").unwrap();
        b.iter(|| unpack_number(black_box(&packed)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_list_append,
    bench_list_sort,
    bench_model_hash,
    bench_resource_hash,
    bench_bcd
);
criterion_main!(benches);

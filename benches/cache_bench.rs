use criterion::{criterion_group, criterion_main, Criterion};
use rand::prelude::*;

use shardkv::protocol::{Op, Response};
use shardkv::{CacheIndex, KeyFingerprint, KvStore};

fn lookup_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    group.bench_function("cache_hit_batch", |b| {
        let cache = CacheIndex::new(1024, 4096);
        for i in 0..1000u64 {
            let key = KeyFingerprint::from_key(&i.to_le_bytes());
            cache.insert(&Op::put(key, b"value").unwrap());
        }
        let mut rng = thread_rng();
        b.iter(|| {
            let ops: Vec<Op> = (0..16)
                .map(|_| {
                    let i: u64 = rng.gen_range(0..1000);
                    Op::get(KeyFingerprint::from_key(&i.to_le_bytes()))
                })
                .collect();
            let mut resp = vec![Response::empty(); ops.len()];
            cache.lookup_batch(&ops, &mut resp)
        });
    });

    group.bench_function("cache_miss_batch", |b| {
        let cache = CacheIndex::new(1024, 4096);
        let mut rng = thread_rng();
        b.iter(|| {
            let ops: Vec<Op> = (0..16)
                .map(|_| {
                    let i: u64 = rng.gen_range(0..1000);
                    Op::get(KeyFingerprint::from_key(&i.to_le_bytes()))
                })
                .collect();
            let mut resp = vec![Response::empty(); ops.len()];
            cache.lookup_batch(&ops, &mut resp)
        });
    });

    group.finish();
}

fn store_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");

    group.bench_function("put_batch", |b| {
        let kv = KvStore::new(1024, 4096);
        let mut rng = thread_rng();
        b.iter(|| {
            let ops: Vec<Op> = (0..16)
                .map(|_| {
                    let i: u64 = rng.gen_range(0..1000);
                    Op::put(KeyFingerprint::from_key(&i.to_le_bytes()), b"value").unwrap()
                })
                .collect();
            let mut resp = vec![Response::empty(); ops.len()];
            kv.batch_op(&ops, &mut resp);
        });
    });

    group.bench_function("get_batch", |b| {
        let kv = KvStore::new(1024, 4096);
        for i in 0..1000u64 {
            let key = KeyFingerprint::from_key(&i.to_le_bytes());
            let mut resp = [Response::empty(); 1];
            kv.batch_op(&[Op::put(key, b"value").unwrap()], &mut resp);
        }
        let mut rng = thread_rng();
        b.iter(|| {
            let ops: Vec<Op> = (0..16)
                .map(|_| {
                    let i: u64 = rng.gen_range(0..1000);
                    Op::get(KeyFingerprint::from_key(&i.to_le_bytes()))
                })
                .collect();
            let mut resp = vec![Response::empty(); ops.len()];
            kv.batch_op(&ops, &mut resp);
        });
    });

    group.finish();
}

criterion_group!(benches, lookup_bench, store_bench);
criterion_main!(benches);

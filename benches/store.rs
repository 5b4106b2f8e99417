use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use ebb::{Config, Item, MemoryKvStore};
use std::sync::Arc;

fn memory_only_store() -> ebb::Store {
    Config::new()
        .do_persistence(false)
        .flush_interval(None)
        .open(Arc::new(MemoryKvStore::default()))
}

fn set(c: &mut Criterion) {
    let store = memory_only_store();
    let value = vec![0u8; 128];
    let mut n: u64 = 0;

    c.bench_function("set 128 B", |b| {
        b.iter(|| {
            n += 1;
            let key = n.to_be_bytes().to_vec();
            store
                .set(Item::new(key, value.clone(), 0, 0, 0), 0, false)
                .expect("set works");
        });
    });

    store.stop();
}

fn get_hit(c: &mut Criterion) {
    let store = memory_only_store();
    let value = vec![0u8; 128];

    for n in 0u64..1_000 {
        store
            .set(Item::new(n.to_be_bytes().to_vec(), value.clone(), 0, 0, 0), 0, false)
            .expect("set works");
    }

    let mut n: u64 = 0;
    c.bench_function("get hit 128 B", |b| {
        b.iter(|| {
            n = (n + 1) % 1_000;
            store.get(&n.to_be_bytes(), 0, 0).expect("key exists");
        });
    });

    store.stop();
}

fn flush_batch(c: &mut Criterion) {
    c.bench_function("flush 1k dirty items", |b| {
        b.iter_batched(
            || {
                let kvstore = Arc::new(MemoryKvStore::default());
                let store = Config::new()
                    .flush_interval(None)
                    .open(kvstore);

                for n in 0u64..1_000 {
                    store
                        .set(
                            Item::new(n.to_be_bytes().to_vec(), vec![0u8; 64], 0, 0, 0),
                            0,
                            false,
                        )
                        .expect("set works");
                }
                store
            },
            |store| {
                store.flush();
                store.stop();
            },
            BatchSize::PerIteration,
        );
    });
}

criterion_group!(benches, set, get_hit, flush_batch);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::Rng;
use tempfile::tempdir;

use minikv::storage::lsm::SkipList;
use minikv::{Db, Entry, Options};

const N: usize = 1_000;

fn bench_options(dir: &std::path::Path) -> Options {
    let mut opts = Options::new(dir);
    opts.sync_writes = false;
    opts
}

fn skiplist_add(c: &mut Criterion) {
    c.bench_function("skiplist_add_1k", |b| {
        b.iter_batched(
            SkipList::new,
            |list| {
                for i in 0..N {
                    list.add(Entry::new(format!("k{:06}", i), vec![b'x'; 100])).unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn db_set_small(c: &mut Criterion) {
    c.bench_function("db_set_small_1k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let db = Db::open(bench_options(dir.path())).unwrap();
                (dir, db)
            },
            |(_dir, db)| {
                for i in 0..N {
                    db.set(Entry::new(format!("k{:06}", i), vec![b'x'; 100])).unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn db_set_large(c: &mut Criterion) {
    c.bench_function("db_set_large_vlog_1k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let db = Db::open(bench_options(dir.path())).unwrap();
                (dir, db)
            },
            |(_dir, db)| {
                for i in 0..N {
                    db.set(Entry::new(format!("k{:06}", i), vec![b'x'; 4096])).unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn db_get_random(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = Db::open(bench_options(dir.path())).unwrap();
    for i in 0..10 * N {
        let len = if i % 10 == 0 { 2048 } else { 100 };
        db.set(Entry::new(format!("k{:06}", i), vec![b'x'; len])).unwrap();
    }
    db.flush().unwrap();

    let mut rng = rand::thread_rng();
    c.bench_function("db_get_random_10k", |b| {
        b.iter(|| {
            let key = format!("k{:06}", rng.gen_range(0..10 * N));
            black_box(db.get(key.as_bytes()).unwrap());
        });
    });
}

criterion_group!(benches, skiplist_add, db_set_small, db_set_large, db_get_random);
criterion_main!(benches);

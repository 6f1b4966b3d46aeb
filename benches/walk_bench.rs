//! Benchmarks for widewalk
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::fs;

fn benchmark_queue_operations(c: &mut Criterion) {
    use widewalk::walker::queue::{QueueFlags, TravQueue};
    use widewalk::walker::record::Arena;

    c.bench_function("queue_push_pop", |b| {
        let mut arena = Arena::new();
        let id = arena.alloc(None, b"bench");
        let mut queue = TravQueue::new(QueueFlags::empty());

        b.iter(|| {
            queue.push(id);
            let popped = queue.pop().unwrap();
            black_box(popped);
        })
    });

    c.bench_function("queue_ordered_flush", |b| {
        let mut arena = Arena::new();
        let ids: Vec<_> = (0..64)
            .map(|i| arena.alloc(None, format!("f{}", i).as_bytes()))
            .collect();

        b.iter(|| {
            let mut queue = TravQueue::new(QueueFlags::BUFFER | QueueFlags::ORDER);
            for &id in &ids {
                queue.push(id);
            }
            queue.flush();
            while let Some(popped) = queue.pop() {
                black_box(popped);
            }
        })
    });
}

fn benchmark_walk(c: &mut Criterion) {
    use widewalk::{walk, Action, WalkOptions};

    // A modest tree: 16 directories of 32 files
    let tmp = tempfile::tempdir().unwrap();
    for d in 0..16 {
        let dir = tmp.path().join(format!("d{:02}", d));
        fs::create_dir(&dir).unwrap();
        for f in 0..32 {
            fs::File::create(dir.join(format!("f{:02}", f))).unwrap();
        }
    }

    c.bench_function("walk_bfs_sync", |b| {
        let options = WalkOptions { threads: 0, ..Default::default() };
        b.iter(|| {
            let mut count = 0u64;
            walk(&[tmp.path()], |entry| {
                count += black_box(entry.depth() as u64);
                Action::Continue
            }, &options)
            .unwrap();
            black_box(count);
        })
    });

    c.bench_function("walk_bfs_threaded", |b| {
        let options = WalkOptions { threads: 2, ..Default::default() };
        b.iter(|| {
            let mut count = 0u64;
            walk(&[tmp.path()], |entry| {
                count += black_box(entry.depth() as u64);
                Action::Continue
            }, &options)
            .unwrap();
            black_box(count);
        })
    });
}

criterion_group!(benches, benchmark_queue_operations, benchmark_walk);
criterion_main!(benches);

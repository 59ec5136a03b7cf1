use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use pmem_epoch::{GcBuilder, GcTarget, Pool, MIN_POOL};
use tempfile::TempDir;

struct Pages;

impl GcTarget for Pages {
    type Kind = ();
    const REUSE_PAGES: bool = true;
}

fn bench_epoch_guard(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let gc = GcBuilder::new(dir.path().join("gc"))
        .layout("bench")
        .open()
        .unwrap();

    c.bench_function("epoch_guard", |b| b.iter(|| gc.epoch_guard()));
}

fn bench_add_garbage(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let data = Pool::create(dir.path().join("data"), "bench", MIN_POOL * 8).unwrap();
    let gc = GcBuilder::new(dir.path().join("gc"))
        .capacity(MIN_POOL * 8)
        .layout("bench")
        .interval(Duration::from_millis(1))
        .register::<Pages>()
        .open()
        .unwrap();
    gc.start_gc();

    let cell = gc.tmp_field::<Pages>(0).unwrap();
    c.bench_function("add_garbage_with_reuse", |b| {
        b.iter(|| unsafe {
            if !gc.try_reuse::<Pages>(cell).unwrap() {
                data.alloc(cell, 64).unwrap();
            }
            gc.add_garbage::<Pages>(cell).unwrap();
        })
    });

    gc.stop_gc();
}

criterion_group!(benches, bench_epoch_guard, bench_add_garbage);
criterion_main!(benches);

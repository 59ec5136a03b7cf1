//! End-to-end scenarios against real pools.

use std::mem;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam_utils::thread;
use pmem_epoch::{EpochGc, GcBuilder, GcTarget, Oid, Pool, MIN_POOL};
use tempfile::TempDir;

const LAYOUT: &str = "gc_scenarios";
const POOL_SIZE: usize = MIN_POOL * 8;
const INTERVAL: Duration = Duration::from_millis(5);
const THREAD_NUM: usize = 4;
const GARBAGE_NUM: usize = 100_000;

/// The scenario target: a shared counter whose weak refs witness the
/// destructor, with destructed pages retained for reuse.
struct SharedPayload;

impl GcTarget for SharedPayload {
    type Kind = Arc<u64>;
    const REUSE_PAGES: bool = true;
}

fn builder(dir: &TempDir) -> GcBuilder {
    GcBuilder::new(dir.path().join("gc"))
        .capacity(POOL_SIZE)
        .layout(LAYOUT)
        .interval(INTERVAL)
        .gc_threads(THREAD_NUM)
        .register::<SharedPayload>()
}

fn data_pool(dir: &TempDir) -> Pool {
    Pool::open_or_create(dir.path().join("data"), LAYOUT, POOL_SIZE).unwrap()
}

/// Publishes `count` payloads from the calling thread, reusing destructed
/// pages when the collector offers them, and returns a weak ref per payload.
fn publish(gc: &EpochGc, data: &Pool, count: usize) -> Vec<Weak<u64>> {
    let mut weaks = Vec::with_capacity(count);
    let cell = gc.tmp_field::<SharedPayload>(0).unwrap();
    for i in 0..count {
        unsafe {
            if !gc.try_reuse::<SharedPayload>(cell).unwrap() {
                data.alloc(cell, mem::size_of::<Arc<u64>>()).unwrap();
            }
            let value = Arc::new(i as u64);
            weaks.push(Arc::downgrade(&value));
            Pool::direct(*cell).cast::<Arc<u64>>().write(value);
            gc.add_garbage::<SharedPayload>(cell).unwrap();
        }
    }
    weaks
}

fn publish_many(gc: &EpochGc, data: &Pool, threads: usize, count: usize) -> Vec<Weak<u64>> {
    if threads == 1 {
        return publish(gc, data, count);
    }
    thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| scope.spawn(|_| publish(gc, data, count)))
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    })
    .unwrap()
}

fn verify_stop_gc(threads: usize) {
    let dir = TempDir::new().unwrap();
    let data = data_pool(&dir);
    let gc = builder(&dir).open().unwrap();
    gc.start_gc();

    let weaks = publish_many(&gc, &data, threads, GARBAGE_NUM);
    gc.stop_gc();

    for weak in &weaks {
        assert!(weak.upgrade().is_none(), "a payload survived stop_gc");
    }
    drop(gc);
    assert_eq!(data.live_objects(), 0, "every page went back to the allocator");
}

#[test]
fn stop_gc_releases_all_garbage_single_thread() {
    verify_stop_gc(1);
}

#[test]
fn stop_gc_releases_all_garbage_multi_thread() {
    verify_stop_gc(THREAD_NUM);
}

#[test]
fn drop_releases_all_garbage() {
    let dir = TempDir::new().unwrap();
    let data = data_pool(&dir);
    let gc = builder(&dir).open().unwrap();
    gc.start_gc();

    let weaks = publish_many(&gc, &data, THREAD_NUM, GARBAGE_NUM);
    drop(gc);

    for weak in &weaks {
        assert!(weak.upgrade().is_none(), "a payload survived the destructor");
    }
    assert_eq!(data.live_objects(), 0);
}

fn verify_epoch_guard(dir: &TempDir, threads: usize) {
    let data = data_pool(dir);
    let gc = builder(dir).open().unwrap();
    gc.start_gc();

    let gate = Mutex::new(());
    let (started_tx, started_rx) = mpsc::channel();

    let weaks = thread::scope(|scope| {
        let held = gate.lock().unwrap();

        let gc = &gc;
        let gate = &gate;
        scope.spawn(move |_| {
            let _guard = gc.epoch_guard();
            started_tx.send(()).unwrap();
            // Park on the gate with the guard held.
            drop(gate.lock().unwrap());
        });
        started_rx.recv().unwrap();

        let weaks = publish_many(gc, &data, threads, GARBAGE_NUM);

        // Give the reclaimers plenty of ticks; the guard must hold them off.
        std::thread::sleep(INTERVAL * 20);
        for weak in &weaks {
            assert!(weak.upgrade().is_some(), "reclaimed under an open guard");
        }

        drop(held);
        weaks
    })
    .unwrap();

    gc.stop_gc();
    for weak in &weaks {
        assert!(weak.upgrade().is_none(), "a payload survived stop_gc");
    }
    drop(gc);
    assert_eq!(data.live_objects(), 0, "everything reclaimed once the guard closed");
}

#[test]
fn epoch_guard_blocks_reclamation_single_thread() {
    let dir = TempDir::new().unwrap();
    verify_epoch_guard(&dir, 1);
}

#[test]
fn epoch_guard_blocks_reclamation_multi_thread() {
    let dir = TempDir::new().unwrap();
    verify_epoch_guard(&dir, THREAD_NUM);
}

#[test]
fn reopening_the_same_pool_behaves_identically() {
    let dir = TempDir::new().unwrap();
    for _ in 0..2 {
        verify_epoch_guard(&dir, THREAD_NUM);
    }
}

/// Payloads bounce through a shared embedding array before being discarded,
/// so reused pages are handed between threads in arbitrary order. Every
/// page must still be destructed exactly once by the time the collector
/// stops.
#[test]
fn reused_pages_are_released_exactly_once() {
    use rand::Rng;

    let dir = TempDir::new().unwrap();
    let data = data_pool(&dir);
    let gc = builder(&dir).open().unwrap();
    gc.start_gc();

    let embedded: Vec<Mutex<Oid>> = (0..THREAD_NUM).map(|_| Mutex::new(Oid::NULL)).collect();

    let weaks: Vec<Weak<u64>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREAD_NUM)
            .map(|_| {
                let gc = &gc;
                let data = &data;
                let embedded = &embedded;
                scope.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut weaks = Vec::with_capacity(GARBAGE_NUM);
                    let cell = gc.tmp_field::<SharedPayload>(0).unwrap();
                    for i in 0..GARBAGE_NUM {
                        let _guard = gc.epoch_guard();
                        unsafe {
                            if !gc.try_reuse::<SharedPayload>(cell).unwrap() {
                                data.alloc(cell, mem::size_of::<Arc<u64>>()).unwrap();
                            }
                            let value = Arc::new(i as u64);
                            weaks.push(Arc::downgrade(&value));
                            Pool::direct(*cell).cast::<Arc<u64>>().write(value);

                            // Swap the fresh page into a random shared slot
                            // and discard whatever was there before.
                            {
                                let mut slot =
                                    embedded[rng.gen_range(0..THREAD_NUM)].lock().unwrap();
                                let old = *slot;
                                *slot = *cell;
                                *cell = old;
                            }
                            if !(*cell).is_null() {
                                gc.add_garbage::<SharedPayload>(cell).unwrap();
                            }
                        }
                    }
                    weaks
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    })
    .unwrap();

    // Discard the payloads still sitting in the embedding array.
    let cell = gc.tmp_field::<SharedPayload>(0).unwrap();
    for slot in &embedded {
        let oid = *slot.lock().unwrap();
        if !oid.is_null() {
            unsafe {
                *cell = oid;
                gc.add_garbage::<SharedPayload>(cell).unwrap();
            }
        }
    }

    gc.stop_gc();
    for weak in &weaks {
        assert!(weak.upgrade().is_none());
    }
    drop(gc);
    assert_eq!(data.live_objects(), 0);
}

//! Recovery behavior across a simulated crash.

use std::mem;
use std::sync::{Arc, Weak};

use pmem_epoch::{GcBuilder, GcTarget, Pool, MIN_POOL, TMP_FIELD_NUM};
use tempfile::TempDir;

const LAYOUT: &str = "gc_recovery";
const POOL_SIZE: usize = MIN_POOL * 4;

struct SharedPayload;

impl GcTarget for SharedPayload {
    type Kind = Arc<u64>;
    const REUSE_PAGES: bool = true;
}

fn builder(dir: &TempDir) -> GcBuilder {
    GcBuilder::new(dir.path().join("gc"))
        .capacity(POOL_SIZE)
        .layout(LAYOUT)
        .register::<SharedPayload>()
}

/// Crashing with a populated chain and one in-flight scratch id: the next
/// open frees the chain's pages without running destructors, reports the
/// scratch id, and leaves it alone.
#[test]
fn orphaned_chains_are_recovered_on_open() {
    const PUBLISHED: usize = 1_000;

    let dir = TempDir::new().unwrap();
    let data = Pool::create(dir.path().join("data"), LAYOUT, POOL_SIZE).unwrap();

    let weaks: Vec<Weak<u64>> = {
        let gc = builder(&dir).open().unwrap();

        // Publish enough garbage to span several buffers, never starting
        // collection so the whole chain stays in the pool.
        let mut weaks = Vec::with_capacity(PUBLISHED);
        let cell = gc.tmp_field::<SharedPayload>(0).unwrap();
        for i in 0..PUBLISHED {
            unsafe {
                data.alloc(cell, mem::size_of::<Arc<u64>>()).unwrap();
                let value = Arc::new(i as u64);
                weaks.push(Arc::downgrade(&value));
                Pool::direct(*cell).cast::<Arc<u64>>().write(value);
                gc.add_garbage::<SharedPayload>(cell).unwrap();
            }
        }

        // One allocation stays in flight in a scratch field.
        let inflight = gc.tmp_field::<SharedPayload>(5).unwrap();
        unsafe { data.alloc(inflight, mem::size_of::<Arc<u64>>()).unwrap() };

        // Crash: no drain, no teardown.
        mem::forget(gc);
        weaks
    };
    assert_eq!(data.live_objects(), PUBLISHED + 1);

    let gc = builder(&dir).open().unwrap();

    // The chain's pages went back to the allocator; only the in-flight
    // scratch allocation survived.
    assert_eq!(data.live_objects(), 1);

    // Recovery returns memory but never destructs.
    for weak in &weaks {
        assert!(weak.upgrade().is_some(), "recovery must not run destructors");
    }

    let banks = gc.unreleased_fields::<SharedPayload>();
    assert_eq!(banks.len(), 1, "one thread slot has in-flight ids");
    for (i, field) in banks[0].iter().enumerate() {
        if i == 5 {
            assert!(!field.is_null());
        } else {
            assert!(field.is_null());
        }
    }

    // The application decides; here it frees the in-flight allocation.
    unsafe { Pool::free(banks[0][5]) };
    assert!(gc.unreleased_fields::<SharedPayload>().is_empty());
    assert_eq!(data.live_objects(), 0);
}

/// A clean shutdown leaves nothing for recovery to do.
#[test]
fn clean_shutdown_leaves_nothing_to_recover() {
    let dir = TempDir::new().unwrap();
    let data = Pool::create(dir.path().join("data"), LAYOUT, POOL_SIZE).unwrap();

    {
        let gc = builder(&dir).open().unwrap();
        gc.start_gc();
        let cell = gc.tmp_field::<SharedPayload>(0).unwrap();
        for i in 0..100u64 {
            unsafe {
                data.alloc(cell, mem::size_of::<Arc<u64>>()).unwrap();
                Pool::direct(*cell).cast::<Arc<u64>>().write(Arc::new(i));
                gc.add_garbage::<SharedPayload>(cell).unwrap();
            }
        }
        gc.stop_gc();
    }
    assert_eq!(data.live_objects(), 0);

    let gc = builder(&dir).open().unwrap();
    assert!(gc.unreleased_fields::<SharedPayload>().is_empty());
    assert_eq!(data.live_objects(), 0);
}

/// The scratch bank stays authoritative across restarts: TMP_FIELD_NUM ids
/// parked in scratch survive any number of re-opens.
#[test]
fn scratch_ids_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let data = Pool::create(dir.path().join("data"), LAYOUT, POOL_SIZE).unwrap();

    {
        let gc = builder(&dir).open().unwrap();
        for i in 0..TMP_FIELD_NUM {
            let field = gc.tmp_field::<SharedPayload>(i).unwrap();
            unsafe { data.alloc(field, 16).unwrap() };
        }
        mem::forget(gc);
    }

    for _ in 0..2 {
        let gc = builder(&dir).open().unwrap();
        let banks = gc.unreleased_fields::<SharedPayload>();
        assert_eq!(banks.len(), 1);
        assert!(banks[0].iter().all(|field| !field.is_null()));
        assert_eq!(data.live_objects(), TMP_FIELD_NUM);
        mem::forget(gc);
    }
}

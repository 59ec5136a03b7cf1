//! The global epoch and per-thread pins.
//!
//! The manager owns one global epoch counter and a dense array of local-epoch
//! slots, one per thread id. A pinned thread's slot holds the global epoch it
//! observed on entry; an unpinned slot holds [`INACTIVE`]. Garbage tagged
//! with an epoch strictly below the minimum over all pinned slots (and the
//! global epoch itself) can no longer be observed by any reader and may be
//! released.
//!
//! Pinning follows the store/fence/re-check protocol: the slot store must be
//! globally visible before the thread performs its first protected load, and
//! the re-check guarantees the stored value is never older than one epoch
//! behind the global counter.

use std::marker::PhantomData;
use std::sync::atomic::Ordering::{Relaxed, Release, SeqCst};
use std::sync::atomic::{fence, AtomicU32, AtomicU64};

use crossbeam_utils::CachePadded;

use crate::thread_id;
use crate::MAX_THREADS;

/// The slot value of a thread that holds no pin.
const INACTIVE: u64 = u64::MAX;

struct LocalEpoch {
    /// The epoch observed at pin time, or [`INACTIVE`].
    epoch: AtomicU64,
    /// Nested-guard count. Only the owning thread touches it.
    pins: AtomicU32,
}

pub(crate) struct EpochManager {
    global: CachePadded<AtomicU64>,
    locals: Box<[CachePadded<LocalEpoch>]>,
}

impl EpochManager {
    pub(crate) fn new() -> EpochManager {
        let locals = (0..MAX_THREADS)
            .map(|_| {
                CachePadded::new(LocalEpoch {
                    epoch: AtomicU64::new(INACTIVE),
                    pins: AtomicU32::new(0),
                })
            })
            .collect();
        EpochManager {
            global: CachePadded::new(AtomicU64::new(1)),
            locals,
        }
    }

    /// The current global epoch, used to tag freshly added garbage.
    #[inline]
    pub(crate) fn current(&self) -> u64 {
        self.global.load(SeqCst)
    }

    /// Moves the global epoch forward by one.
    pub(crate) fn advance(&self) -> u64 {
        self.global.fetch_add(1, SeqCst) + 1
    }

    /// The minimum epoch any pinned thread may still observe.
    ///
    /// Garbage tagged strictly below this value is reclaimable.
    pub(crate) fn min_epoch(&self) -> u64 {
        fence(SeqCst);
        let mut min = self.global.load(Relaxed);
        for local in self.locals.iter() {
            let epoch = local.epoch.load(Relaxed);
            if epoch < min {
                min = epoch;
            }
        }
        min
    }

    /// Pins the calling thread. Reentrant; nested guards share the epoch of
    /// the outermost one.
    pub(crate) fn guard(&self) -> EpochGuard<'_> {
        let local = &*self.locals[thread_id::current()];
        let pins = local.pins.load(Relaxed);
        local.pins.store(pins + 1, Relaxed);

        if pins == 0 {
            let mut epoch = self.global.load(Relaxed);
            loop {
                local.epoch.store(epoch, Relaxed);
                fence(SeqCst);
                let global = self.global.load(Relaxed);
                if global == epoch {
                    break;
                }
                epoch = global;
            }
        }

        EpochGuard {
            local,
            _not_send: PhantomData,
        }
    }
}

/// Keeps the creating thread's epoch pinned until dropped.
///
/// While any guard is alive on a thread, no garbage registered at or after
/// the guard's epoch is released. Guards are cheap, reentrant, and bound to
/// the thread that created them.
#[must_use]
pub struct EpochGuard<'a> {
    local: &'a LocalEpoch,
    _not_send: PhantomData<*mut ()>,
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        let pins = self.local.pins.load(Relaxed);
        self.local.pins.store(pins - 1, Relaxed);
        if pins == 1 {
            self.local.epoch.store(INACTIVE, Release);
        }
    }
}

impl std::fmt::Debug for EpochGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("EpochGuard { .. }")
    }
}

//! Dense thread ids and liveness tokens.
//!
//! Every thread that touches a collector is lazily assigned a small id below
//! [`MAX_THREADS`](crate::MAX_THREADS); ids return to a free list when the
//! thread exits and are handed out again. The id indexes both the epoch
//! manager's local-epoch slots and the per-thread garbage lists.
//!
//! A [`Heartbeat`] is a weak token tied to the id's owner: it reports the
//! thread as expired once the owner has exited, at which point the thread's
//! persistent garbage list becomes eligible for rebinding and forced cleanup.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::MAX_THREADS;

struct IdRegistry {
    free: Vec<usize>,
    next: usize,
}

static REGISTRY: Mutex<IdRegistry> = Mutex::new(IdRegistry {
    free: Vec::new(),
    next: 0,
});

struct OwnedId {
    id: usize,
    beat: Arc<()>,
}

impl Drop for OwnedId {
    fn drop(&mut self) {
        REGISTRY.lock().free.push(self.id);
    }
}

fn acquire() -> OwnedId {
    let mut registry = REGISTRY.lock();
    let id = match registry.free.pop() {
        Some(id) => id,
        None => {
            let id = registry.next;
            assert!(
                id < MAX_THREADS,
                "more than {} threads registered with the collector",
                MAX_THREADS,
            );
            registry.next = id + 1;
            id
        }
    };
    OwnedId {
        id,
        beat: Arc::new(()),
    }
}

thread_local! {
    static CURRENT: OwnedId = acquire();
}

/// The calling thread's dense id.
pub(crate) fn current() -> usize {
    CURRENT.with(|owned| owned.id)
}

/// A liveness token for the calling thread.
pub(crate) fn heartbeat() -> Heartbeat {
    CURRENT.with(|owned| Heartbeat(Arc::downgrade(&owned.beat)))
}

/// A weak liveness token. Expires when the owning thread exits.
#[derive(Clone)]
pub(crate) struct Heartbeat(Weak<()>);

impl Heartbeat {
    /// A token that is already expired; the state of a list that has never
    /// been bound to a thread.
    pub(crate) const fn dead() -> Heartbeat {
        Heartbeat(Weak::new())
    }

    pub(crate) fn expired(&self) -> bool {
        self.0.strong_count() == 0
    }
}

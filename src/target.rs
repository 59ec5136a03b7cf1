//! Per-target reclamation policy.

use std::any::TypeId;
use std::mem;
use std::ptr;

/// The reclamation policy of one class of garbage.
///
/// A target is a zero-sized marker type registered with
/// [`GcBuilder::register`](crate::GcBuilder::register). It fixes two things:
/// the value type destructed before a slot is released, and whether
/// destructed slots are retained for reuse instead of being freed.
///
/// # Examples
///
/// ```
/// use pmem_epoch::GcTarget;
///
/// struct SharedCounter;
///
/// impl GcTarget for SharedCounter {
///     type Kind = std::sync::Arc<u64>;
///     const REUSE_PAGES: bool = true;
/// }
/// ```
pub trait GcTarget: 'static {
    /// The value destructed in place before a slot is released.
    ///
    /// Use `()` for raw pages that need no destructor. The destructor must
    /// tolerate running again after a crash.
    type Kind: Sized;

    /// Whether destructed slots stay in the list for
    /// [`try_reuse`](crate::EpochGc::try_reuse) instead of being freed.
    const REUSE_PAGES: bool;
}

/// The built-in target: no destructor, no page reuse.
///
/// Every collector carries this target; garbage added for it is freed as soon
/// as its epoch expires.
#[derive(Debug)]
pub struct DefaultTarget;

impl GcTarget for DefaultTarget {
    type Kind = ();
    const REUSE_PAGES: bool = false;
}

/// A [`GcTarget`] erased for storage in the collector's target table.
#[derive(Clone, Copy)]
pub(crate) struct TargetVtable {
    pub(crate) type_id: TypeId,
    pub(crate) name: &'static str,
    pub(crate) reuse_pages: bool,
    /// Runs the target's destructor on a direct pointer. `None` when
    /// `T::Kind` has nothing to drop.
    pub(crate) destroy: Option<unsafe fn(*mut u8)>,
}

impl std::fmt::Debug for TargetVtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetVtable")
            .field("name", &self.name)
            .field("reuse_pages", &self.reuse_pages)
            .finish_non_exhaustive()
    }
}

impl TargetVtable {
    pub(crate) fn of<T: GcTarget>() -> TargetVtable {
        unsafe fn drop_kind<K>(ptr: *mut u8) {
            unsafe { ptr::drop_in_place(ptr.cast::<K>()) }
        }

        TargetVtable {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            reuse_pages: T::REUSE_PAGES,
            destroy: if mem::needs_drop::<T::Kind>() {
                Some(drop_kind::<T::Kind>)
            } else {
                None
            },
        }
    }
}

//! The volatile header binding a chain to a live thread.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;

use parking_lot::Mutex;

use crate::list::dram::{self, DramBuf};
use crate::list::pmem::PmemBuf;
use crate::list::tls::TlsFields;
use crate::pool::{Oid, Pool, Result};
use crate::target::TargetVtable;
use crate::thread_id::{self, Heartbeat};
use crate::TMP_FIELD_NUM;

/// One garbage list: the header for a (target, thread slot) pair.
///
/// The header owns no persistent state of its own; it caches direct pointers
/// into the slot's [`TlsFields`] record and the chain hanging off it. The
/// mutex serializes reclamation against (re)binding. The producer-side
/// pointers (`tail`, `head`) are touched without the mutex, but only ever by
/// the single thread the heartbeat currently binds, or by a reclaimer that
/// has proven that thread dead.
pub(crate) struct GarbageList {
    vtable: TargetVtable,
    pool: Pool,
    state: UnsafeCell<State>,
    mtx: Mutex<()>,
}

struct State {
    /// Liveness of the bound thread; expired when unbound.
    beat: Heartbeat,
    /// The buffer the reuse path pops from.
    head: *mut PmemBuf,
    /// The buffer the producer appends to.
    tail: *mut PmemBuf,
    /// This slot's persistent record.
    tls: *mut TlsFields,
    /// `&(*tls).head` once bound.
    gc_head: *mut Oid,
    /// `&(*tls).tmp_head` once bound.
    gc_tmp: *mut Oid,
}

// The state cell is guarded by `mtx` for structural changes; unlocked access
// is confined to the bound thread (see the struct docs).
unsafe impl Send for GarbageList {}
unsafe impl Sync for GarbageList {}

impl GarbageList {
    pub(crate) fn new(vtable: TargetVtable, pool: Pool, tls: *mut TlsFields) -> GarbageList {
        GarbageList {
            vtable,
            pool,
            state: UnsafeCell::new(State {
                beat: Heartbeat::dead(),
                head: ptr::null_mut(),
                tail: ptr::null_mut(),
                tls,
                gc_head: ptr::null_mut(),
                gc_tmp: ptr::null_mut(),
            }),
            mtx: Mutex::new(()),
        }
    }

    /// Binds the calling thread to this list if the previous binding has
    /// expired, allocating the initial buffer on a fresh chain and attaching
    /// a new companion to the head buffer.
    fn bind_current_thread(&self) -> Result<()> {
        let state = self.state.get();
        unsafe {
            if !(*state).beat.expired() {
                return Ok(());
            }

            let _lock = self.mtx.lock();
            (*state).gc_head = ptr::addr_of_mut!((*(*state).tls).head);
            (*state).gc_tmp = ptr::addr_of_mut!((*(*state).tls).tmp_head);

            if (*(*state).gc_head).is_null() {
                self.pool
                    .zalloc((*state).gc_head, mem::size_of::<PmemBuf>())?;
            }
            let head: *mut PmemBuf = Pool::direct(*(*state).gc_head).cast();
            PmemBuf::set_dram(head, Box::into_raw(DramBuf::boxed()));
            (*state).tail = head;
            (*state).head = head;
            (*state).beat = thread_id::heartbeat();
        }
        Ok(())
    }

    /// The address of the calling thread's `i`-th scratch field.
    pub(crate) fn tmp_field(&self, i: usize) -> Result<*mut Oid> {
        assert!(i < TMP_FIELD_NUM);
        self.bind_current_thread()?;
        unsafe { Ok(ptr::addr_of_mut!((*(*self.state.get()).tls).scratch[i])) }
    }

    /// Appends the id in `cell` tagged with `epoch`.
    ///
    /// # Safety
    ///
    /// `cell` must point to a persistent cell holding a non-null id that no
    /// other cell aliases.
    pub(crate) unsafe fn add_garbage(&self, epoch: u64, cell: *mut Oid) -> Result<()> {
        self.bind_current_thread()?;
        let state = self.state.get();
        dram::add_garbage(&mut (*state).tail, epoch, cell, &self.pool)
    }

    /// Pops a destructed page into `out` if one is available.
    ///
    /// # Safety
    ///
    /// `out` must point to a persistent cell holding the null id.
    pub(crate) unsafe fn try_reuse(&self, out: *mut Oid) -> Result<bool> {
        self.bind_current_thread()?;
        let state = self.state.get();
        Ok(dram::reuse_page(&mut (*state).head, out))
    }

    /// One reclamation pass over this list.
    ///
    /// Skips out immediately if another reclaimer holds the lock or the list
    /// has no chain. Dispatches on the target policy and the owner's
    /// liveness, then releases the whole slot once the owner has exited and
    /// the chain has drained.
    pub(crate) fn clear_garbage(&self, protected: u64) {
        let Some(_lock) = self.mtx.try_lock() else {
            return;
        };
        let state = self.state.get();
        unsafe {
            if (*state).gc_head.is_null() || (*(*state).gc_head).is_null() {
                return;
            }

            if self.vtable.reuse_pages && !(*state).beat.expired() {
                dram::destruct(&self.vtable, (*state).gc_head, protected, (*state).gc_tmp);
            } else {
                dram::clear(&self.vtable, (*state).gc_head, protected, (*state).gc_tmp);
            }

            let head: *mut PmemBuf = Pool::direct(*(*state).gc_head).cast();
            let companion = PmemBuf::dram(head);
            if !(*state).beat.expired() || !(*companion).is_empty() {
                return;
            }

            // The owner is gone and the chain has drained; give the dangling
            // buffer back and leave the slot ready for rebinding.
            drop(Box::from_raw(companion));
            (*state).tail = ptr::null_mut();
            (*state).head = ptr::null_mut();
            Pool::free((*state).gc_head);
        }
    }

    /// Drains the chain unconditionally and unbinds the list.
    ///
    /// Runs on `stop_gc` and on drop. The persistent record survives; only
    /// the chain and the binding are torn down.
    pub(crate) fn shutdown(&self) {
        let _lock = self.mtx.lock();
        let state = self.state.get();
        unsafe {
            if !(*state).gc_head.is_null() && !(*(*state).gc_head).is_null() {
                dram::clear(&self.vtable, (*state).gc_head, u64::MAX, (*state).gc_tmp);
                let head: *mut PmemBuf = Pool::direct(*(*state).gc_head).cast();
                drop(Box::from_raw(PmemBuf::dram(head)));
                Pool::free((*state).gc_head);
            }
            (*state).beat = Heartbeat::dead();
            (*state).tail = ptr::null_mut();
            (*state).head = ptr::null_mut();
        }
    }
}

impl Drop for GarbageList {
    fn drop(&mut self) {
        self.shutdown();
    }
}

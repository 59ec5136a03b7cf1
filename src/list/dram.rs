//! The volatile half of a garbage buffer and the drivers over a chain.
//!
//! Three monotone cursors partition a buffer's slots:
//!
//! ```text
//!   0 .. begin      released or handed back for reuse
//!   begin .. mid    destructed, waiting for reuse or release
//!   mid .. end      inserted, still epoch-protected
//!   end .. 252      never written
//! ```
//!
//! The producer owns `end`, the owning thread's reuse path owns `begin`, and
//! the reclaimer (serialized by the header mutex) owns `mid`. The successor
//! pointer carries a sticky `USED` tag in its top bit once the reuse path has
//! crossed into the successor; a tagged buffer may no longer be bypassed by
//! the reclaimer.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::AtomicUsize;

use crossbeam_utils::Backoff;

use crate::list::pmem::PmemBuf;
use crate::pool::{Oid, Pool, Result};
use crate::target::TargetVtable;
use crate::BUF_SIZE;

const USED: usize = 1 << 63;

const _: () = assert!(mem::size_of::<usize>() == 8);

/// The volatile companion of one [`PmemBuf`], keyed by its mapped address.
///
/// Companions are heap objects created whenever a buffer enters service
/// (at allocation, or on first bind after a restart) and destroyed right
/// after their persistent buffer is freed.
#[repr(align(64))]
pub(crate) struct DramBuf {
    /// First slot not yet freed or reused.
    begin: AtomicUsize,
    /// First slot not yet destructed.
    mid: AtomicUsize,
    /// The global epoch observed when each slot was filled. Written by the
    /// producer before the `end` release that publishes the slot.
    epochs: UnsafeCell<[u64; BUF_SIZE]>,
    /// First never-written slot.
    end: AtomicUsize,
    /// Mapped address of the successor buffer, tagged with `USED` in the top
    /// bit once the reuse path treats this buffer as its head.
    next: AtomicUsize,
}

// The epoch tags are published by the release store of `end` and read only
// below an acquired `end`, so the plain array is safe to share.
unsafe impl Send for DramBuf {}
unsafe impl Sync for DramBuf {}

impl DramBuf {
    pub(crate) fn boxed() -> Box<DramBuf> {
        Box::new(DramBuf {
            begin: AtomicUsize::new(0),
            mid: AtomicUsize::new(0),
            epochs: UnsafeCell::new([0; BUF_SIZE]),
            end: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
        })
    }

    /// True if the buffer holds no garbage and never filled up.
    pub(crate) fn is_empty(&self) -> bool {
        let end = self.end.load(Relaxed);
        end - self.begin.load(Relaxed) == 0 && end < BUF_SIZE
    }

    #[cfg(test)]
    pub(crate) fn cursors(&self) -> (usize, usize, usize) {
        (
            self.begin.load(Relaxed),
            self.mid.load(Relaxed),
            self.end.load(Relaxed),
        )
    }
}

/// Appends the id in `cell` to the tail buffer, growing the chain when the
/// tail fills up. Consumes the cell durably; see [`PmemBuf::push_slot`].
///
/// # Safety
///
/// Only the thread bound to the chain may call this. `*tail` must be the
/// chain's tail buffer with a live companion, and `cell` must hold a non-null
/// id.
pub(crate) unsafe fn add_garbage(
    tail: &mut *mut PmemBuf,
    epoch: u64,
    cell: *mut Oid,
    pool: &Pool,
) -> Result<()> {
    let pmem = *tail;
    let dram = &*PmemBuf::dram(pmem);

    let pos = dram.end.load(Relaxed);
    (*dram.epochs.get())[pos] = epoch;
    PmemBuf::push_slot(pmem, pos, cell);

    if pos == BUF_SIZE - 1 {
        let new_tail = PmemBuf::create_next(pmem, pool)?;
        PmemBuf::set_dram(new_tail, Box::into_raw(DramBuf::boxed()));
        dram.next.store(new_tail as usize, Release);
        *tail = new_tail;
    }

    dram.end.fetch_add(1, Release);
    Ok(())
}

/// Pops a destructed id off the reuse head into `out`. Returns `false`
/// (leaving `out` untouched) when nothing destructed is available.
///
/// # Safety
///
/// Only the thread bound to the chain may call this. `*head` must be the
/// chain's reuse-head buffer with a live companion.
pub(crate) unsafe fn reuse_page(head: &mut *mut PmemBuf, out: *mut Oid) -> bool {
    let pmem = *head;
    let dram = &*PmemBuf::dram(pmem);

    let pos = dram.begin.load(Relaxed);
    if pos == dram.mid.load(Acquire) {
        return false;
    }

    PmemBuf::take_slot(pmem, pos, out);

    if pos == BUF_SIZE - 1 {
        // Crossing into the successor: tag this buffer's link so the
        // reclaimer keeps it reachable until we are through.
        let backoff = Backoff::new();
        let mut next = dram.next.load(Acquire);
        loop {
            match dram.next.compare_exchange_weak(next, next | USED, Relaxed, Acquire) {
                Ok(_) => break,
                Err(current) => {
                    next = current;
                    backoff.spin();
                }
            }
        }
        *head = (next & !USED) as *mut PmemBuf;
    }

    dram.begin.fetch_add(1, Release);
    true
}

/// Runs destructors over the chain for slots whose epoch has expired,
/// releasing buffers the owning thread has fully consumed.
///
/// Used for reuse targets while the owner is alive: destructed slots stay in
/// the chain for [`reuse_page`]. A buffer the owner never started consuming
/// (`begin == 0`) can still be released if the buffer one step behind it is
/// in the same state and untagged: the reclaimer re-routes that candidate's
/// successor past the abandoned buffer, frees its slots, and unlinks it.
///
/// Stops at the first buffer with protected slots left; later buffers wait
/// for the next pass.
///
/// # Safety
///
/// `list_oid`/`tmp_oid` must be the chain's head/swap pair, every buffer on
/// the chain must have a live companion, and the caller must hold the
/// header's reclaimer lock.
pub(crate) unsafe fn destruct(
    vtable: &TargetVtable,
    mut list_oid: *mut Oid,
    protected: u64,
    mut tmp_oid: *mut Oid,
) {
    let mut candidate: *mut DramBuf = ptr::null_mut();
    loop {
        let pmem: *mut PmemBuf = Pool::direct(ptr::read(list_oid)).cast();
        let dram_ptr = PmemBuf::dram(pmem);
        let dram = &*dram_ptr;

        let end = dram.end.load(Acquire);
        let mut mid = dram.mid.load(Relaxed);
        while mid < end && (*dram.epochs.get())[mid] < protected {
            if let Some(destroy) = vtable.destroy {
                destroy(Pool::direct(ptr::read(PmemBuf::slot(pmem, mid))));
            }
            mid += 1;
        }
        dram.mid.store(mid, Release);
        if mid < BUF_SIZE {
            break;
        }

        let mut pos = dram.begin.load(Acquire);
        if pos > 0 {
            candidate = ptr::null_mut();
            if pos == BUF_SIZE {
                PmemBuf::exchange_head(pmem, list_oid, tmp_oid);
                drop(Box::from_raw(dram_ptr));
                continue;
            }
        } else {
            if !candidate.is_null() && (*candidate).begin.load(Relaxed) == 0 {
                let current = (*candidate).next.load(Relaxed);
                let next = dram.next.load(Relaxed);
                if current & USED == 0
                    && (*candidate)
                        .next
                        .compare_exchange(current, next, Release, Relaxed)
                        .is_ok()
                {
                    // The reuse path cannot reach this buffer anymore;
                    // everything in it is abandoned.
                    while pos < BUF_SIZE {
                        PmemBuf::release_slot(pmem, pos);
                        pos += 1;
                    }
                    PmemBuf::exchange_head(pmem, list_oid, tmp_oid);
                    drop(Box::from_raw(dram_ptr));
                    continue;
                }
            }
            candidate = dram_ptr;
        }

        list_oid = ptr::addr_of_mut!((*pmem).next);
        tmp_oid = ptr::addr_of_mut!((*pmem).tmp);
    }
}

/// Destructs and frees every expired slot on the chain, unlinking exhausted
/// buffers as it goes.
///
/// Used for non-reusing targets, dead owners, and forced teardown
/// (`protected == u64::MAX`).
///
/// # Safety
///
/// Same contract as [`destruct`].
pub(crate) unsafe fn clear(
    vtable: &TargetVtable,
    list_oid: *mut Oid,
    protected: u64,
    tmp_oid: *mut Oid,
) {
    loop {
        let pmem: *mut PmemBuf = Pool::direct(ptr::read(list_oid)).cast();
        let dram_ptr = PmemBuf::dram(pmem);
        let dram = &*dram_ptr;

        let mid = dram.mid.load(Relaxed);
        let mut pos = dram.begin.load(Relaxed);
        while pos < mid {
            // Already destructed; just return the memory.
            PmemBuf::release_slot(pmem, pos);
            pos += 1;
        }
        let end = dram.end.load(Acquire);
        while pos < end && (*dram.epochs.get())[pos] < protected {
            if let Some(destroy) = vtable.destroy {
                destroy(Pool::direct(ptr::read(PmemBuf::slot(pmem, pos))));
            }
            PmemBuf::release_slot(pmem, pos);
            pos += 1;
        }
        dram.begin.store(pos, Release);
        dram.mid.store(pos, Release);
        if pos < BUF_SIZE {
            break;
        }

        PmemBuf::exchange_head(pmem, list_oid, tmp_oid);
        drop(Box::from_raw(dram_ptr));
    }
}

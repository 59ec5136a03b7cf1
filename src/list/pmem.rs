//! The persistent half of a garbage buffer.
//!
//! All mutators follow the persist-before-publish rule: a slot or link is
//! durable before any volatile cursor or pointer makes it observable, and a
//! moved id is durable in its destination before the source cell is nulled,
//! so that across any crash the id lives in exactly one place.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use tracing::debug;

use crate::list::dram::DramBuf;
use crate::list::tls::TlsFields;
use crate::pool::{Oid, Pool, Result, ALLOC_HEADER, CACHE_LINE};
use crate::BUF_SIZE;

/// A persistent buffer node: a bounded array of garbage ids plus the chain
/// link and the swap slot used to unlink it.
///
/// `next` and `tmp` sit in the same cache line as required by
/// [`exchange_head`](PmemBuf::exchange_head); the leading pad keeps the whole
/// allocation (block header included) a whole number of cache lines.
#[repr(C)]
pub(crate) struct PmemBuf {
    /// Mapped address of the volatile companion. Not durable: after a
    /// restart this holds garbage and is rebuilt on first bind.
    dram: AtomicPtr<DramBuf>,
    _pad: u64,
    pub(crate) next: Oid,
    pub(crate) tmp: Oid,
    slots: [Oid; BUF_SIZE],
}

const _: () = assert!((ALLOC_HEADER + mem::size_of::<PmemBuf>()) % CACHE_LINE == 0);

impl PmemBuf {
    /// The volatile companion, or null if none has been attached since the
    /// pool was opened.
    #[inline]
    pub(crate) unsafe fn dram(this: *mut PmemBuf) -> *mut DramBuf {
        (*this).dram.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) unsafe fn set_dram(this: *mut PmemBuf, dram: *mut DramBuf) {
        (*this).dram.store(dram, Ordering::Release);
    }

    #[inline]
    pub(crate) unsafe fn slot(this: *mut PmemBuf, pos: usize) -> *mut Oid {
        ptr::addr_of_mut!((*this).slots[pos])
    }

    /// Moves the id out of `cell` into slot `pos`.
    ///
    /// Two persists: the slot is durable before the source is nulled, so a
    /// crash in between leaves the id in both places and recovery's aliasing
    /// check resolves the duplicate.
    ///
    /// # Safety
    ///
    /// `pos` must be an unused slot owned by the calling producer and `cell`
    /// must hold a non-null id.
    pub(crate) unsafe fn push_slot(this: *mut PmemBuf, pos: usize, cell: *mut Oid) {
        let slot = PmemBuf::slot(this, pos);
        ptr::write(slot, ptr::read(cell));
        Pool::persist(slot.cast(), mem::size_of::<Oid>());

        (*cell).off = 0;
        Pool::persist(ptr::addr_of!((*cell).off).cast(), mem::size_of::<u64>());
    }

    /// Moves the id in slot `pos` out into `out`. The mirror of
    /// [`push_slot`](PmemBuf::push_slot).
    ///
    /// # Safety
    ///
    /// Slot `pos` must hold a destructed id that no reclaimer will touch.
    pub(crate) unsafe fn take_slot(this: *mut PmemBuf, pos: usize, out: *mut Oid) {
        let slot = PmemBuf::slot(this, pos);
        ptr::write(out, ptr::read(slot));
        Pool::persist(out.cast(), mem::size_of::<Oid>());

        (*slot).off = 0;
        Pool::persist(ptr::addr_of!((*slot).off).cast(), mem::size_of::<u64>());
    }

    /// Frees the allocation slot `pos` refers to and nulls the slot.
    #[inline]
    pub(crate) unsafe fn release_slot(this: *mut PmemBuf, pos: usize) {
        Pool::free(PmemBuf::slot(this, pos));
    }

    /// Allocates a zeroed successor, links it durably, and returns it.
    pub(crate) unsafe fn create_next(this: *mut PmemBuf, pool: &Pool) -> Result<*mut PmemBuf> {
        pool.zalloc(ptr::addr_of_mut!((*this).next), mem::size_of::<PmemBuf>())?;
        Ok(Pool::direct((*this).next).cast())
    }

    /// Splices the chain head past `this` and frees `this`.
    ///
    /// `head` is the cell the chain hangs off (the record's `head` or a
    /// predecessor's `next`) and `tmp` is the swap slot adjacent to it. The
    /// id being unlinked is parked in the swap slot first; both cells share a
    /// cache line, so the single persist covers the pair and recovery can
    /// always tell which step the crash interrupted.
    ///
    /// # Safety
    ///
    /// `*head` must refer to `this`, `tmp` must be the swap slot paired with
    /// `head`, and the caller must be the only reclaimer on this chain.
    pub(crate) unsafe fn exchange_head(
        this: *mut PmemBuf,
        head: *mut Oid,
        tmp: *mut Oid,
    ) -> *mut PmemBuf {
        ptr::write(tmp, ptr::read(head));
        (*head).off = (*this).next.off;
        Pool::persist(head.cast(), 2 * mem::size_of::<Oid>());

        Pool::free(tmp);
        Pool::direct(ptr::read(head)).cast()
    }

    /// Startup recovery for one thread record: releases every orphaned
    /// garbage id hanging off `tls` and tears the chain down.
    ///
    /// Swap slots are normalized first: a swap slot equal to its paired
    /// head means the crash hit before the splice and the slot is simply
    /// cleared; a differing non-null swap slot is an unlinked-but-unfreed
    /// buffer and is freed. Slot ids that are byte-equal to a scratch id are
    /// skipped: the scratch bank is authoritative for in-flight allocations,
    /// and skipping the duplicate is what prevents a double free after a
    /// crash between the two persists of a slot move.
    ///
    /// No destructors run here; recovery only returns memory.
    ///
    /// # Safety
    ///
    /// `tls` must point to a record in an open pool and nothing else may
    /// touch the record's chain during recovery.
    pub(crate) unsafe fn release_all(tls: *mut TlsFields) {
        if (*tls).head.is_null() {
            return;
        }

        let mut freed = 0usize;
        normalize(
            ptr::addr_of_mut!((*tls).tmp_head),
            ptr::read(ptr::addr_of!((*tls).head)),
            &mut freed,
        );

        let mut buf: *mut PmemBuf = Pool::direct((*tls).head).cast();
        loop {
            normalize(
                ptr::addr_of_mut!((*buf).tmp),
                ptr::read(ptr::addr_of!((*buf).next)),
                &mut freed,
            );
            for pos in 0..BUF_SIZE {
                let slot = PmemBuf::slot(buf, pos);
                let oid = ptr::read(slot);
                if oid.is_null() || TlsFields::has_same_oid(tls, oid) {
                    continue;
                }
                Pool::free(slot);
                freed += 1;
            }
            if (*buf).next.is_null() {
                break;
            }
            buf = PmemBuf::exchange_head(
                buf,
                ptr::addr_of_mut!((*tls).head),
                ptr::addr_of_mut!((*tls).tmp_head),
            );
        }
        Pool::free(ptr::addr_of_mut!((*tls).head));

        debug!(freed, "released orphaned garbage");
    }
}

/// Applies the swap-slot recovery rule: clear it if it still equals the head
/// it was copied from, free it if the splice already happened.
unsafe fn normalize(tmp: *mut Oid, head: Oid, freed: &mut usize) {
    let parked = ptr::read(tmp);
    if parked.is_null() {
        return;
    }
    if parked == head {
        ptr::write(tmp, Oid::NULL);
        Pool::persist(tmp.cast(), mem::size_of::<Oid>());
    } else {
        Pool::free(tmp);
        *freed += 1;
    }
}

//! The thread-local persistent record.

use std::mem;
use std::ptr;

use crate::pool::Oid;
use crate::TMP_FIELD_NUM;

/// A thread's root object in persistent memory.
///
/// The scratch bank holds in-flight allocations: ids the owning thread has
/// taken out of the allocator (or out of the reuse path) but not yet either
/// published into a durable structure or handed to the collector. After a
/// crash the bank is the authoritative record of those allocations. `head`
/// roots the thread's buffer chain and `tmp_head` is the swap slot that makes
/// head advancement crash-consistent; the two share a cache line so a single
/// persist covers both.
///
/// Records live inside a per-target region that survives restarts; they are
/// only ever manipulated through raw pointers into the pool mapping.
#[repr(C)]
pub(crate) struct TlsFields {
    pub(crate) scratch: [Oid; TMP_FIELD_NUM],
    pub(crate) head: Oid,
    pub(crate) tmp_head: Oid,
}

const _: () = assert!(mem::size_of::<TlsFields>() == 240);
const _: () = assert!(mem::align_of::<TlsFields>() == 8);

impl TlsFields {
    /// Returns `true` if any scratch slot holds exactly `oid` (both words
    /// compared).
    ///
    /// # Safety
    ///
    /// `this` must point into a mapped pool region.
    pub(crate) unsafe fn has_same_oid(this: *const TlsFields, oid: Oid) -> bool {
        for i in 0..TMP_FIELD_NUM {
            if ptr::read(ptr::addr_of!((*this).scratch[i])) == oid {
                return true;
            }
        }
        false
    }

    /// The addresses of all scratch slots still holding an id, or `None` if
    /// the bank is clean. Clean slots come back as null pointers.
    ///
    /// # Safety
    ///
    /// `this` must point into a mapped pool region.
    pub(crate) unsafe fn remaining(this: *mut TlsFields) -> Option<[*mut Oid; TMP_FIELD_NUM]> {
        let mut dirty = false;
        let mut fields = [ptr::null_mut(); TMP_FIELD_NUM];
        for (i, field) in fields.iter_mut().enumerate() {
            let slot = ptr::addr_of_mut!((*this).scratch[i]);
            if !ptr::read(slot).is_null() {
                *field = slot;
                dirty = true;
            }
        }
        dirty.then_some(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Box<TlsFields> {
        Box::new(TlsFields {
            scratch: [Oid::NULL; TMP_FIELD_NUM],
            head: Oid::NULL,
            tmp_head: Oid::NULL,
        })
    }

    #[test]
    fn same_oid_compares_both_words() {
        let mut tls = record();
        let oid = Oid {
            pool_uuid_lo: 7,
            off: 4096,
        };
        tls.scratch[4] = oid;

        let this: *const TlsFields = &*tls;
        unsafe {
            assert!(TlsFields::has_same_oid(this, oid));
            assert!(!TlsFields::has_same_oid(
                this,
                Oid {
                    pool_uuid_lo: 8,
                    ..oid
                }
            ));
            assert!(!TlsFields::has_same_oid(
                this,
                Oid {
                    off: 8192,
                    ..oid
                }
            ));
        }
    }

    #[test]
    fn remaining_reports_dirty_slots() {
        let mut tls = record();
        let this: *mut TlsFields = &mut *tls;
        unsafe {
            assert!(TlsFields::remaining(this).is_none());

            tls.scratch[0].off = 16;
            tls.scratch[12].off = 32;
            let fields = TlsFields::remaining(this).unwrap();
            assert!(!fields[0].is_null());
            assert!(!fields[12].is_null());
            assert!(fields[1..12].iter().all(|field| field.is_null()));
        }
    }
}

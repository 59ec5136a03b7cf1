//! The per-thread two-tier garbage list.
//!
//! Each (target, thread) pair owns a chain of fixed-size buffers. Every
//! buffer exists twice: a persistent node ([`pmem::PmemBuf`]) holding the
//! garbage ids, the chain link, and a swap slot for crash-consistent
//! unlinking; and a volatile companion ([`dram::DramBuf`]) holding the three
//! cursors and epoch tags that drive the lock-free producer/reclaimer state
//! machine. The chain is rooted in the thread's persistent record
//! ([`tls::TlsFields`]) and fronted by a volatile header
//! ([`head::GarbageList`]) that binds the chain to a live thread.

pub(crate) mod dram;
pub(crate) mod head;
pub(crate) mod pmem;
pub(crate) mod tls;

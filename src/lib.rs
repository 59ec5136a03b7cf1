//! Epoch-based memory reclamation for persistent memory.
//!
//! Data structures on byte-addressable persistent memory face the same
//! reclamation problem as their volatile cousins: a thread that unlinks a node
//! must wait until no concurrent reader can still observe it before the node's
//! memory may be released. This crate implements the epoch-based solution for
//! persistent pools, with one extra twist that volatile collectors never have
//! to deal with: every hand-off of a to-be-released allocation must be
//! recoverable from persistent state alone, so that a crash at any instruction
//! boundary leaks nothing and frees nothing twice.
//!
//! # Object ids
//!
//! Allocations are identified by an [`Oid`], a 128-bit pair of pool id and
//! offset. An `Oid` is the only pointer form ever stored durably; the
//! allocator translates it back to a mapped address on every use, so ids stay
//! valid across restarts even though mapped addresses do not.
//!
//! # Pinning
//!
//! Before reading epoch-protected data, a thread creates an [`EpochGuard`]
//! via [`EpochGc::epoch_guard`]. The guard pins the thread's local epoch to
//! the current global epoch; garbage registered afterwards is not released
//! until every pin taken at or before that epoch has been dropped.
//!
//! # Garbage
//!
//! A thread discards an allocation by moving its id into one of its scratch
//! fields ([`EpochGc::tmp_field`]) and handing the field to
//! [`EpochGc::add_garbage`]. The id travels through a per-thread chain of
//! fixed-size buffers that is laid out redundantly in persistent and volatile
//! memory; background reclaimer threads walk the chains and release whatever
//! the epoch protocol proves unreachable. Targets that opt into page reuse
//! ([`GcTarget::REUSE_PAGES`]) can take destructed pages back out of the chain
//! with [`EpochGc::try_reuse`] instead of paying for a fresh allocation.
//!
//! # Recovery
//!
//! Opening a pool replays every thread's persistent chain and releases the
//! garbage a previous process left behind. Scratch fields survive recovery
//! untouched; [`EpochGc::unreleased_fields`] reports them so the application
//! can decide which in-flight allocations are still referenced by its own
//! durable structures.

#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

mod epoch;
mod gc;
mod list;
mod pool;
mod target;
mod thread_id;

pub use self::epoch::EpochGuard;
pub use self::gc::{EpochGc, GcBuilder};
pub use self::pool::{Error, Oid, Pool, Result, MIN_POOL};
pub use self::target::{DefaultTarget, GcTarget};

/// The number of scratch fields in each thread's persistent record.
pub const TMP_FIELD_NUM: usize = 13;

/// The number of garbage slots in each buffer of a thread's chain.
pub const BUF_SIZE: usize = 252;

/// The maximum number of threads that may use a collector concurrently.
pub const MAX_THREADS: usize = 256;

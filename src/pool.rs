//! File-backed persistent memory pools.
//!
//! A pool is a single file mapped shared into the address space. The first
//! page holds the pool header; the rest is a bump-allocated heap of blocks,
//! each preceded by a 16-byte block header. Freed blocks are tracked on
//! volatile per-size free lists that are rebuilt by walking the heap when the
//! pool is opened, so the durable state never contains allocator metadata
//! beyond the bump cursor and the per-block state words.
//!
//! Pools register themselves in a process-wide table keyed by their id, which
//! is what makes [`Pool::direct`] and [`Pool::free`] work on ids from *any*
//! open pool; garbage handed to the collector does not have to live in the
//! collector's own pool.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

/// The smallest capacity a pool can be created with.
pub const MIN_POOL: usize = 8 << 20;

/// Bytes of allocator metadata in front of every allocation.
pub(crate) const ALLOC_HEADER: usize = 16;

/// The cache-line size assumed for persist granularity.
pub(crate) const CACHE_LINE: usize = 64;

/// The store-line size of the persistent medium.
pub(crate) const PM_LINE: usize = 256;

const POOL_HEADER_SIZE: u64 = 4096;
const POOL_MAGIC: u64 = 0x706d_6570_6f63_6831; // "pmepoch1"
const POOL_VERSION: u64 = 1;

const BLOCK_LIVE: u64 = 0x4c49_5645_4c49_5645;
const BLOCK_FREE: u64 = 0x4652_4545_4652_4545;
const BLOCK_ROOT: u64 = 0x524f_4f54_524f_4f54;

/// A 128-bit durable pointer: the id of an allocation within some pool.
///
/// An `Oid` is null iff its offset is zero, regardless of the pool word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct Oid {
    /// The id of the owning pool.
    pub pool_uuid_lo: u64,
    /// The byte offset of the allocation within the pool file.
    pub off: u64,
}

impl Oid {
    /// The null id.
    pub const NULL: Oid = Oid {
        pool_uuid_lo: 0,
        off: 0,
    };

    /// Returns `true` if this id does not refer to an allocation.
    #[inline]
    pub fn is_null(self) -> bool {
        self.off == 0
    }
}

/// Errors surfaced by pool construction and allocation.
#[derive(Debug, Error)]
pub enum Error {
    /// The pool file could not be created, grown, or mapped.
    #[error("pool i/o error: {0}")]
    Io(#[from] io::Error),

    /// The file exists but was created with a different layout tag or
    /// an incompatible version of this crate.
    #[error("pool layout mismatch (expected {expected:#x}, found {found:#x})")]
    Layout {
        /// The tag hash this pool was opened with.
        expected: u64,
        /// The tag hash stored in the pool header.
        found: u64,
    },

    /// The pool has no room left for the requested allocation.
    #[error("pool exhausted: {requested} bytes requested")]
    OutOfMemory {
        /// The size of the failed request, including the block header.
        requested: usize,
    },

    /// The heap walk found a block header that is neither live, free,
    /// nor the root object.
    #[error("pool metadata is corrupted at offset {offset:#x}")]
    Corrupted {
        /// The offset of the bad block header.
        offset: u64,
    },
}

/// A specialized result type for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[inline]
pub(crate) const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Flushes the cache lines covering `[ptr, ptr + len)` to the persistent
/// medium and waits for the flush to complete.
#[cfg(target_arch = "x86_64")]
pub(crate) fn persist(ptr: *const u8, len: usize) {
    use std::arch::x86_64::{_mm_clflush, _mm_sfence};

    let start = ptr as usize & !(CACHE_LINE - 1);
    let end = ptr as usize + len;
    let mut line = start;
    while line < end {
        unsafe { _mm_clflush(line as *const u8) };
        line += CACHE_LINE;
    }
    unsafe { _mm_sfence() };
}

#[cfg(not(target_arch = "x86_64"))]
pub(crate) fn persist(ptr: *const u8, len: usize) {
    // No portable cache flush; fall back to a synchronous msync of the
    // covered pages.
    let page = page_size();
    let start = ptr as usize & !(page - 1);
    let end = align_up(ptr as usize + len, page);
    unsafe {
        libc::msync(start as *mut libc::c_void, end - start, libc::MS_SYNC);
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn page_size() -> usize {
    use std::sync::atomic::AtomicUsize;

    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

fn layout_hash(tag: &str) -> u64 {
    // FNV-1a over the tag bytes.
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in tag.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

fn fresh_uuid() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let seed = nanos
        ^ (u64::from(std::process::id()) << 32)
        ^ COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_mul(0x9e37_79b9_7f4a_7c15);

    // splitmix64 finalizer; zero is reserved for the null id.
    let mut z = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    z | 1
}

#[repr(C)]
struct PoolHeader {
    magic: u64,
    version: u64,
    layout: u64,
    uuid_lo: u64,
    capacity: u64,
    bump: u64,
    root: Oid,
}

#[repr(C)]
struct BlockHeader {
    size: u64,
    state: u64,
}

/// A shared file mapping. Unmapped on drop.
struct Mapping {
    ptr: *mut u8,
    len: usize,
}

impl Mapping {
    /// # Safety
    ///
    /// The file must stay at least `len` bytes long while the mapping lives.
    unsafe fn map_file(file: &File, len: usize) -> io::Result<Mapping> {
        use std::os::unix::io::AsRawFd;

        let ptr = libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Mapping {
            ptr: ptr.cast(),
            len,
        })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

struct PoolInner {
    map: Mapping,
    uuid_lo: u64,
    capacity: u64,
    alloc: Mutex<FreeLists>,
    _file: File,
}

// The mapping is plain shared memory; all mutation goes through the
// allocator mutex or through raw pointers whose ordering the callers own.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

#[derive(Default)]
struct FreeLists {
    by_size: HashMap<u64, Vec<u64>>,
}

static POOLS: RwLock<Vec<(u64, Weak<PoolInner>)>> = RwLock::new(Vec::new());

fn register(inner: &Arc<PoolInner>) {
    let mut pools = POOLS.write();
    pools.retain(|(_, weak)| weak.strong_count() > 0);
    // Most-recent-first, so re-opening a pool shadows a leaked older handle.
    pools.insert(0, (inner.uuid_lo, Arc::downgrade(inner)));
}

fn lookup(uuid_lo: u64) -> Option<Arc<PoolInner>> {
    POOLS
        .read()
        .iter()
        .find_map(|(id, weak)| (*id == uuid_lo).then(|| weak.upgrade()).flatten())
}

impl PoolInner {
    #[inline]
    fn header(&self) -> *mut PoolHeader {
        self.map.ptr.cast()
    }

    #[inline]
    unsafe fn block(&self, block_off: u64) -> *mut BlockHeader {
        self.map.ptr.add(block_off as usize).cast()
    }

    /// Carves out a block and returns the payload offset. The block header is
    /// durable before the offset is handed to the caller.
    ///
    /// Blocks are whole cache lines, so a structure laid out to end on a line
    /// boundary (header included) keeps its internal line sharing in memory.
    fn alloc_block(&self, size: usize, state: u64) -> Result<u64> {
        let total = align_up(size.max(1) + ALLOC_HEADER, CACHE_LINE) as u64;
        let mut lists = self.alloc.lock();

        let block_off = match lists.by_size.get_mut(&total).and_then(Vec::pop) {
            Some(off) => off,
            None => unsafe {
                let header = self.header();
                let bump = (*header).bump;
                if bump + total > self.capacity {
                    return Err(Error::OutOfMemory {
                        requested: total as usize,
                    });
                }
                (*header).bump = bump + total;
                persist(ptr::addr_of!((*header).bump).cast(), 8);
                bump
            },
        };

        unsafe {
            let block = self.block(block_off);
            (*block).size = total;
            (*block).state = state;
            persist(block.cast(), ALLOC_HEADER);
        }
        Ok(block_off + ALLOC_HEADER as u64)
    }

    fn free_block(&self, payload_off: u64) {
        let block_off = payload_off - ALLOC_HEADER as u64;
        unsafe {
            let block = self.block(block_off);
            assert!(
                (*block).state == BLOCK_LIVE || (*block).state == BLOCK_ROOT,
                "double free of pool offset {:#x}",
                payload_off,
            );
            (*block).state = BLOCK_FREE;
            persist(block.cast(), ALLOC_HEADER);
            self.alloc
                .lock()
                .by_size
                .entry((*block).size)
                .or_default()
                .push(block_off);
        }
    }

    /// Walks the heap up to the bump cursor, rebuilding the free lists and
    /// counting live blocks.
    fn walk(&self, lists: Option<&mut FreeLists>) -> Result<usize> {
        let bump = unsafe { (*self.header()).bump };
        let mut lists = lists;
        let mut live = 0;
        let mut off = POOL_HEADER_SIZE;
        while off < bump {
            let block = unsafe { self.block(off) };
            let (size, state) = unsafe { ((*block).size, (*block).state) };
            if size < ALLOC_HEADER as u64 || size % 16 != 0 || off + size > bump {
                return Err(Error::Corrupted { offset: off });
            }
            match state {
                BLOCK_LIVE => live += 1,
                BLOCK_ROOT => {}
                BLOCK_FREE => {
                    if let Some(lists) = lists.as_deref_mut() {
                        lists.by_size.entry(size).or_default().push(off);
                    }
                }
                _ => return Err(Error::Corrupted { offset: off }),
            }
            off += size;
        }
        Ok(live)
    }
}

/// A handle to an open pool. Cloning the handle shares the mapping.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Creates a pool file at `path` and formats it with the given layout tag.
    ///
    /// The capacity is clamped up to [`MIN_POOL`].
    pub fn create(path: impl AsRef<Path>, layout: &str, capacity: usize) -> Result<Pool> {
        let capacity = capacity.max(MIN_POOL);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(capacity as u64)?;
        let map = unsafe { Mapping::map_file(&file, capacity)? };

        let uuid_lo = fresh_uuid();
        let inner = Arc::new(PoolInner {
            map,
            uuid_lo,
            capacity: capacity as u64,
            alloc: Mutex::new(FreeLists::default()),
            _file: file,
        });
        unsafe {
            let header = inner.header();
            ptr::write(
                header,
                PoolHeader {
                    magic: POOL_MAGIC,
                    version: POOL_VERSION,
                    layout: layout_hash(layout),
                    uuid_lo,
                    capacity: capacity as u64,
                    bump: POOL_HEADER_SIZE,
                    root: Oid::NULL,
                },
            );
            persist(header.cast(), mem::size_of::<PoolHeader>());
        }
        register(&inner);
        debug!(path = %path.as_ref().display(), uuid = uuid_lo, "created pool");
        Ok(Pool { inner })
    }

    /// Opens an existing pool file and rebuilds the allocator state from it.
    pub fn open(path: impl AsRef<Path>, layout: &str) -> Result<Pool> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let len = file.metadata()?.len() as usize;
        let map = unsafe { Mapping::map_file(&file, len)? };

        let header = map.ptr.cast::<PoolHeader>();
        let expected = layout_hash(layout);
        unsafe {
            if (*header).magic != POOL_MAGIC || (*header).version != POOL_VERSION {
                return Err(Error::Corrupted { offset: 0 });
            }
            if (*header).layout != expected {
                return Err(Error::Layout {
                    expected,
                    found: (*header).layout,
                });
            }
        }

        let inner = Arc::new(PoolInner {
            uuid_lo: unsafe { (*header).uuid_lo },
            capacity: unsafe { (*header).capacity },
            map,
            alloc: Mutex::new(FreeLists::default()),
            _file: file,
        });
        {
            let mut lists = inner.alloc.lock();
            inner.walk(Some(&mut *lists))?;
        }
        register(&inner);
        debug!(path = %path.as_ref().display(), uuid = inner.uuid_lo, "opened pool");
        Ok(Pool { inner })
    }

    /// Opens `path` if it exists, creating and formatting it otherwise.
    pub fn open_or_create(path: impl AsRef<Path>, layout: &str, capacity: usize) -> Result<Pool> {
        if path.as_ref().exists() {
            Pool::open(path, layout)
        } else {
            Pool::create(path, layout, capacity)
        }
    }

    /// The id half of every [`Oid`] allocated from this pool.
    #[inline]
    pub fn uuid(&self) -> u64 {
        self.inner.uuid_lo
    }

    /// Returns the pool's root object, allocating it zeroed on first use.
    ///
    /// If an existing root is smaller than `size`, a larger zeroed root is
    /// allocated, the old contents are copied over durably, and the old root
    /// block is released.
    pub fn root(&self, size: usize) -> Result<*mut u8> {
        let header = self.inner.header();
        unsafe {
            let root = (*header).root;
            if root.is_null() {
                let off = self.inner.alloc_block(size, BLOCK_ROOT)?;
                let payload = self.inner.map.ptr.add(off as usize);
                ptr::write_bytes(payload, 0, size);
                persist(payload, size);
                (*header).root = Oid {
                    pool_uuid_lo: self.inner.uuid_lo,
                    off,
                };
                persist(ptr::addr_of!((*header).root).cast(), mem::size_of::<Oid>());
                return Ok(payload);
            }

            let block = self.inner.block(root.off - ALLOC_HEADER as u64);
            let old_payload = ((*block).size as usize) - ALLOC_HEADER;
            if old_payload >= size {
                return Ok(self.inner.map.ptr.add(root.off as usize));
            }

            // Grow: copy into a fresh zeroed root, then swap durably.
            let off = self.inner.alloc_block(size, BLOCK_ROOT)?;
            let payload = self.inner.map.ptr.add(off as usize);
            ptr::write_bytes(payload, 0, size);
            ptr::copy_nonoverlapping(self.inner.map.ptr.add(root.off as usize), payload, old_payload);
            persist(payload, size);
            (*header).root = Oid {
                pool_uuid_lo: self.inner.uuid_lo,
                off,
            };
            persist(ptr::addr_of!((*header).root).cast(), mem::size_of::<Oid>());
            self.inner.free_block(root.off);
            Ok(payload)
        }
    }

    /// Allocates `size` bytes and publishes the new id into `*cell` durably.
    ///
    /// # Safety
    ///
    /// `cell` must point to a live, persist-able `Oid` cell.
    pub unsafe fn alloc(&self, cell: *mut Oid, size: usize) -> Result<()> {
        let off = self.inner.alloc_block(size, BLOCK_LIVE)?;
        ptr::write(
            cell,
            Oid {
                pool_uuid_lo: self.inner.uuid_lo,
                off,
            },
        );
        persist(cell.cast(), mem::size_of::<Oid>());
        Ok(())
    }

    /// Like [`alloc`](Pool::alloc), but the payload is zeroed durably before
    /// the id is published.
    ///
    /// # Safety
    ///
    /// `cell` must point to a live, persist-able `Oid` cell.
    pub unsafe fn zalloc(&self, cell: *mut Oid, size: usize) -> Result<()> {
        let off = self.inner.alloc_block(size, BLOCK_LIVE)?;
        let payload = self.inner.map.ptr.add(off as usize);
        ptr::write_bytes(payload, 0, size);
        persist(payload, size);
        ptr::write(
            cell,
            Oid {
                pool_uuid_lo: self.inner.uuid_lo,
                off,
            },
        );
        persist(cell.cast(), mem::size_of::<Oid>());
        Ok(())
    }

    /// Releases the allocation `*cell` refers to and nulls `*cell` durably.
    ///
    /// The id may belong to any open pool. A null cell is a no-op. The free
    /// is durable when this returns.
    ///
    /// # Safety
    ///
    /// `*cell` must hold either the null id or the id of a live allocation
    /// that no other cell will also be freed through.
    pub unsafe fn free(cell: *mut Oid) {
        let oid = ptr::read(cell);
        if oid.is_null() {
            return;
        }
        let pool = lookup(oid.pool_uuid_lo).expect("freed an oid that belongs to no open pool");
        pool.free_block(oid.off);
        ptr::write(cell, Oid::NULL);
        persist(cell.cast(), mem::size_of::<Oid>());
    }

    /// Translates an id from any open pool into a mapped address.
    ///
    /// Returns a null pointer for the null id. Panics if the owning pool is
    /// not open in this process.
    #[inline]
    pub fn direct(oid: Oid) -> *mut u8 {
        if oid.is_null() {
            return ptr::null_mut();
        }
        let pool = lookup(oid.pool_uuid_lo).expect("resolved an oid that belongs to no open pool");
        unsafe { pool.map.ptr.add(oid.off as usize) }
    }

    /// Flushes `[ptr, ptr + len)` to the persistent medium.
    #[inline]
    pub fn persist(ptr: *const u8, len: usize) {
        persist(ptr, len);
    }

    /// Counts the live allocations in this pool. The root object is not
    /// counted.
    ///
    /// This walks the heap and is meant for tests and diagnostics.
    pub fn live_objects(&self) -> usize {
        let _lists = self.inner.alloc.lock();
        self.inner.walk(None).expect("pool metadata is corrupted")
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("uuid", &self.inner.uuid_lo)
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

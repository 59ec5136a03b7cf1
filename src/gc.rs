//! The garbage collection coordinator.

use std::any::TypeId;
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::epoch::{EpochGuard, EpochManager};
use crate::list::head::GarbageList;
use crate::list::pmem::PmemBuf;
use crate::list::tls::TlsFields;
use crate::pool::{align_up, Oid, Pool, Result, MIN_POOL, PM_LINE};
use crate::target::{DefaultTarget, GcTarget, TargetVtable};
use crate::thread_id;
use crate::{MAX_THREADS, TMP_FIELD_NUM};

/// The default reclamation tick.
const DEFAULT_INTERVAL: Duration = Duration::from_micros(100_000);

/// Configures and opens an [`EpochGc`].
///
/// # Examples
///
/// ```no_run
/// use pmem_epoch::{GcBuilder, GcTarget};
///
/// struct Nodes;
/// impl GcTarget for Nodes {
///     type Kind = ();
///     const REUSE_PAGES: bool = true;
/// }
///
/// let gc = GcBuilder::new("/mnt/pmem/gc.pool")
///     .gc_threads(2)
///     .register::<Nodes>()
///     .open()
///     .unwrap();
/// gc.start_gc();
/// ```
#[derive(Debug)]
pub struct GcBuilder {
    path: PathBuf,
    capacity: usize,
    layout: String,
    interval: Duration,
    gc_threads: usize,
    targets: Vec<TargetVtable>,
}

impl GcBuilder {
    /// Starts a configuration for the pool file at `path`.
    ///
    /// The default target is always present; further targets are added with
    /// [`register`](GcBuilder::register).
    pub fn new(path: impl Into<PathBuf>) -> GcBuilder {
        GcBuilder {
            path: path.into(),
            capacity: MIN_POOL * 2,
            layout: "gc_on_pmem".into(),
            interval: DEFAULT_INTERVAL,
            gc_threads: 1,
            targets: vec![TargetVtable::of::<DefaultTarget>()],
        }
    }

    /// The pool capacity in bytes used when the file does not exist yet.
    pub fn capacity(mut self, bytes: usize) -> GcBuilder {
        self.capacity = bytes;
        self
    }

    /// The layout tag the pool is formatted or validated with.
    pub fn layout(mut self, tag: &str) -> GcBuilder {
        self.layout = tag.into();
        self
    }

    /// The tick of the epoch advancer and the reclaimers.
    pub fn interval(mut self, interval: Duration) -> GcBuilder {
        self.interval = interval;
        self
    }

    /// How many reclaimer threads [`start_gc`](EpochGc::start_gc) spawns.
    pub fn gc_threads(mut self, count: usize) -> GcBuilder {
        self.gc_threads = count.max(1);
        self
    }

    /// Adds a garbage target. The registration order fixes each target's
    /// slot in the pool's root array, so re-opening a pool must register the
    /// same targets in the same order.
    ///
    /// # Panics
    ///
    /// Panics if `T` is already registered.
    pub fn register<T: GcTarget>(mut self) -> GcBuilder {
        let vtable = TargetVtable::of::<T>();
        assert!(
            self.targets.iter().all(|t| t.type_id != vtable.type_id),
            "target {} registered twice",
            vtable.name,
        );
        self.targets.push(vtable);
        self
    }

    /// Opens (or creates) the pool, recovers every orphaned chain, and wires
    /// the per-thread lists.
    pub fn open(self) -> Result<EpochGc> {
        let pool = Pool::open_or_create(&self.path, &self.layout, self.capacity)?;
        let root: *mut Oid = pool
            .root(mem::size_of::<Oid>() * self.targets.len())?
            .cast();

        let mut targets = Vec::with_capacity(self.targets.len());
        for (pos, vtable) in self.targets.iter().enumerate() {
            let region = init_region(&pool, unsafe { root.add(pos) }, vtable)?;
            let lists = (0..MAX_THREADS)
                .map(|slot| {
                    CachePadded::new(GarbageList::new(*vtable, pool.clone(), unsafe {
                        region.add(slot)
                    }))
                })
                .collect();
            targets.push(TargetLists {
                vtable: *vtable,
                lists,
                region,
            });
        }

        Ok(EpochGc {
            inner: Arc::new(GcInner {
                targets: targets.into_boxed_slice(),
                epochs: EpochManager::new(),
                running: AtomicBool::new(false),
                interval: self.interval,
                gc_threads: self.gc_threads,
                pool,
            }),
            gc_thread: Mutex::new(None),
        })
    }
}

/// Allocates (once) the per-target region of thread records and recovers any
/// slot whose chain survived a previous process.
fn init_region(pool: &Pool, slot: *mut Oid, vtable: &TargetVtable) -> Result<*mut TlsFields> {
    unsafe {
        if (*slot).is_null() {
            let size = align_up(mem::size_of::<TlsFields>() * (MAX_THREADS + 1), PM_LINE);
            pool.zalloc(slot, size)?;
        }
        // The region holds one spare record so the array can start at the
        // first line-aligned address.
        let region = align_up(Pool::direct(*slot) as usize, PM_LINE) as *mut TlsFields;

        let mut recovered = 0usize;
        for i in 0..MAX_THREADS {
            let tls = region.add(i);
            if !(*tls).head.is_null() {
                PmemBuf::release_all(tls);
                recovered += 1;
            }
        }
        if recovered > 0 {
            debug!(garbage = vtable.name, recovered, "recovered garbage chains");
        }
        Ok(region)
    }
}

struct TargetLists {
    vtable: TargetVtable,
    lists: Box<[CachePadded<GarbageList>]>,
    region: *mut TlsFields,
}

struct GcInner {
    /// Dropped before `pool` so every forced drain still sees the mapping.
    targets: Box<[TargetLists]>,
    epochs: EpochManager,
    running: AtomicBool,
    interval: Duration,
    gc_threads: usize,
    pool: Pool,
}

// `region` points into the pool mapping owned by `pool`.
unsafe impl Send for GcInner {}
unsafe impl Sync for GcInner {}

/// An epoch-based garbage collector over a persistent pool.
///
/// The collector owns one garbage list per (target, thread) pair, the epoch
/// manager, and the background threads that advance the global epoch and
/// reclaim expired garbage. Dropping it stops collection, drains every list,
/// and closes the pool; the pool file remains and can be re-opened with the
/// same target registrations.
pub struct EpochGc {
    inner: Arc<GcInner>,
    gc_thread: Mutex<Option<JoinHandle<()>>>,
}

impl EpochGc {
    /// Pins the calling thread's epoch until the guard is dropped.
    pub fn epoch_guard(&self) -> EpochGuard<'_> {
        self.inner.epochs.guard()
    }

    fn target<T: GcTarget>(&self) -> &TargetLists {
        let id = TypeId::of::<T>();
        self.inner
            .targets
            .iter()
            .find(|target| target.vtable.type_id == id)
            .expect("the garbage target was not registered with the builder")
    }

    fn list<T: GcTarget>(&self) -> &GarbageList {
        &self.target::<T>().lists[thread_id::current()]
    }

    /// A stable address of the calling thread's `i`-th scratch field for
    /// target `T`.
    ///
    /// Store freshly allocated ids here before publishing them; whatever the
    /// field holds at crash time is reported by
    /// [`unreleased_fields`](EpochGc::unreleased_fields) after the next open.
    ///
    /// # Panics
    ///
    /// Panics unless `i < TMP_FIELD_NUM` and `T` is registered.
    pub fn tmp_field<T: GcTarget>(&self, i: usize) -> Result<*mut Oid> {
        self.list::<T>().tmp_field(i)
    }

    /// The scratch banks, across all thread slots, that still hold at least
    /// one id. Clean slots come back as null pointers.
    ///
    /// This is the application's recovery hook: after re-opening a pool,
    /// every surviving scratch id is either referenced by some durable
    /// structure or should be freed by the caller.
    pub fn unreleased_fields<T: GcTarget>(&self) -> Vec<[*mut Oid; TMP_FIELD_NUM]> {
        let target = self.target::<T>();
        let mut banks = Vec::new();
        for slot in 0..MAX_THREADS {
            if let Some(fields) = unsafe { TlsFields::remaining(target.region.add(slot)) } {
                banks.push(fields);
            }
        }
        banks
    }

    /// Hands the id in `*cell` to the collector and nulls the cell durably.
    ///
    /// # Safety
    ///
    /// `cell` must point to a persistent cell (normally a scratch field of
    /// this collector) holding a non-null id that no other cell aliases.
    pub unsafe fn add_garbage<T: GcTarget>(&self, cell: *mut Oid) -> Result<()> {
        self.list::<T>()
            .add_garbage(self.inner.epochs.current(), cell)
    }

    /// Takes a destructed page back out of the calling thread's list,
    /// storing its id into `*out`. Returns `false` and leaves `out` untouched
    /// when nothing is available.
    ///
    /// Only targets that opt into [`GcTarget::REUSE_PAGES`] may call this;
    /// the check is enforced at compile time.
    ///
    /// # Safety
    ///
    /// `out` must point to a persistent cell holding the null id.
    pub unsafe fn try_reuse<T: GcTarget>(&self, out: *mut Oid) -> Result<bool> {
        const {
            assert!(
                T::REUSE_PAGES,
                "try_reuse requires a target with REUSE_PAGES"
            )
        };
        self.list::<T>().try_reuse(out)
    }

    /// Starts the epoch advancer and the reclaimer threads.
    ///
    /// Returns `false` if collection was already running.
    pub fn start_gc(&self) -> bool {
        if self.inner.running.load(Ordering::Relaxed) {
            return false;
        }
        self.inner.running.store(true, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        *self.gc_thread.lock() = Some(thread::spawn(move || run_gc(inner)));
        info!("garbage collection started");
        true
    }

    /// Stops collection and drains every list, so that a clean stop leaves
    /// no reclaimable garbage behind.
    ///
    /// Returns `false` if collection was not running.
    pub fn stop_gc(&self) -> bool {
        if !self.inner.running.load(Ordering::Relaxed) {
            return false;
        }
        self.inner.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.gc_thread.lock().take() {
            handle.join().expect("the GC thread panicked");
        }
        for target in self.inner.targets.iter() {
            for list in target.lists.iter() {
                list.shutdown();
            }
        }
        info!("garbage collection stopped");
        true
    }
}

impl Drop for EpochGc {
    fn drop(&mut self) {
        self.stop_gc();
    }
}

impl std::fmt::Debug for EpochGc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochGc")
            .field("pool", &self.inner.pool)
            .field("targets", &self.inner.targets.len())
            .field("running", &self.inner.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// The epoch-advancer loop. Spawns the reclaimers, ticks the global epoch
/// until stopped, then joins them.
fn run_gc(inner: Arc<GcInner>) {
    let mut reclaimers = Vec::with_capacity(inner.gc_threads);
    for _ in 0..inner.gc_threads {
        let inner = Arc::clone(&inner);
        reclaimers.push(thread::spawn(move || {
            let mut wake = Instant::now() + inner.interval;
            while inner.running.load(Ordering::Relaxed) {
                let protected = inner.epochs.min_epoch();
                for target in inner.targets.iter() {
                    for list in target.lists.iter() {
                        list.clear_garbage(protected);
                    }
                }
                sleep_until(wake);
                wake += inner.interval;
            }
        }));
    }

    let mut wake = Instant::now() + inner.interval;
    while inner.running.load(Ordering::Relaxed) {
        sleep_until(wake);
        wake += inner.interval;
        inner.epochs.advance();
    }

    for reclaimer in reclaimers {
        reclaimer.join().expect("a reclaimer thread panicked");
    }
    debug!("reclaimer threads joined");
}

fn sleep_until(wake: Instant) {
    let now = Instant::now();
    if wake > now {
        thread::sleep(wake - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn builder(dir: &TempDir) -> GcBuilder {
        GcBuilder::new(dir.path().join("gc"))
            .layout("gc_unit_test")
            .interval(Duration::from_millis(1))
    }

    #[test]
    fn start_and_stop_report_transitions() {
        let dir = TempDir::new().unwrap();
        let gc = builder(&dir).open().unwrap();

        assert!(!gc.stop_gc(), "nothing to stop yet");
        assert!(gc.start_gc());
        assert!(!gc.start_gc(), "already running");
        assert!(gc.stop_gc());
        assert!(!gc.stop_gc(), "already stopped");
        assert!(gc.start_gc(), "restart after stop");
        assert!(gc.stop_gc());
    }

    #[test]
    fn default_target_is_always_present() {
        let dir = TempDir::new().unwrap();
        let gc = builder(&dir).open().unwrap();

        let field = gc.tmp_field::<DefaultTarget>(0).unwrap();
        assert!(!field.is_null());
        assert!(gc.unreleased_fields::<DefaultTarget>().is_empty());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        struct Twice;
        impl GcTarget for Twice {
            type Kind = ();
            const REUSE_PAGES: bool = false;
        }
        let _ = GcBuilder::new("unused").register::<Twice>().register::<Twice>();
    }

    #[test]
    fn scratch_fields_show_up_as_unreleased() {
        let dir = TempDir::new().unwrap();
        let gc = builder(&dir).open().unwrap();
        let data = Pool::create(dir.path().join("data"), "gc_unit_test", MIN_POOL).unwrap();

        unsafe {
            let field = gc.tmp_field::<DefaultTarget>(3).unwrap();
            data.alloc(field, 32).unwrap();

            let banks = gc.unreleased_fields::<DefaultTarget>();
            assert_eq!(banks.len(), 1);
            assert_eq!(banks[0][3], field);
            assert!(banks[0][0].is_null());

            Pool::free(field);
        }
        assert!(gc.unreleased_fields::<DefaultTarget>().is_empty());
    }
}

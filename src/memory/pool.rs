//! Size-classed pool of reusable memory blocks.
//!
//! Block sizes are powers of two from 64 B to 512 MiB. Each class keeps a
//! lock-free free list; a lease pops from the smallest class that fits or
//! allocates a fresh block when the list is empty. Blocks come back on
//! their own when the last handle onto them is dropped.
//!
//! ## Instrumentation
//!
//! Observers registered with [`BlockPool::subscribe`] see blocks being
//! created, destroyed and suspected of leaking. With lease tracking on
//! (the default in debug builds) every checked-out block is recorded so
//! [`BlockPool::scan_for_leaks`] can report leases that stayed out longer
//! than expected, typically a frame or aggregate held past its use.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use slab::Slab;
use tracing::{debug, trace, warn};

use super::block::{BlockSlice, BlockStorage, MemoryBlock, UNTRACKED};
use crate::error::{RespError, Result};

/// Smallest block handed out.
pub const MIN_BLOCK_SIZE: usize = 64;

/// Largest block handed out (512 MiB).
pub const MAX_BLOCK_SIZE: usize = 512 * 1024 * 1024;

const MIN_CLASS_SHIFT: u32 = MIN_BLOCK_SIZE.trailing_zeros();
const CLASS_COUNT: usize = (MAX_BLOCK_SIZE.trailing_zeros() - MIN_CLASS_SHIFT + 1) as usize;

/// Recycled segment lists longer than this are dropped instead of kept.
const MAX_RECYCLED_SEGMENTS: usize = 64;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// Index of the smallest size class that holds `size` bytes.
pub fn size_class(size: usize) -> Result<usize> {
    if size > MAX_BLOCK_SIZE {
        return Err(RespError::capacity(format!(
            "block size {size} exceeds the largest size class ({MAX_BLOCK_SIZE})"
        )));
    }
    let rounded = size.max(MIN_BLOCK_SIZE).next_power_of_two();
    Ok((rounded.trailing_zeros() - MIN_CLASS_SHIFT) as usize)
}

/// Capacity of blocks in size class `class`.
pub fn class_size(class: usize) -> usize {
    MIN_BLOCK_SIZE << class
}

/// Pool construction options.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Record every outstanding lease for [`BlockPool::scan_for_leaks`].
    pub track_leases: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            track_leases: cfg!(debug_assertions),
        }
    }
}

/// Lifecycle notifications delivered to pool observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// A fresh block was allocated because its class had none free.
    Created { size: usize },
    /// A block was taken from its free list.
    Reused { size: usize },
    /// An idle block was freed by [`BlockPool::trim`].
    Destroyed { size: usize },
    /// A lease has been outstanding for at least `age`.
    LeakSuspected { size: usize, age: Duration },
}

/// Registration returned by [`BlockPool::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(usize);

/// One long-lived lease found by a leak scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakReport {
    pub size: usize,
    pub age: Duration,
}

/// Counters since the pool was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub returned: u64,
    pub destroyed: u64,
}

type Observer = Arc<dyn Fn(&PoolEvent) + Send + Sync>;

struct LeaseRecord {
    size: usize,
    since: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct PoolShared {
    id: usize,
    classes: Vec<SegQueue<Arc<BlockStorage>>>,
    observers: Mutex<Slab<Observer>>,
    observer_count: AtomicUsize,
    tracker: Option<Mutex<Slab<LeaseRecord>>>,
    segment_lists: SegQueue<Vec<BlockSlice>>,
    created: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    destroyed: AtomicU64,
}

impl PoolShared {
    /// Put a block whose lease count just reached zero back on its free list.
    pub(crate) fn give_back(&self, storage: Arc<BlockStorage>) {
        self.untrack(&storage);
        // Every block was allocated at a class size.
        let class = match size_class(storage.capacity()) {
            Ok(class) => class,
            Err(e) => {
                warn!(error = %e, "dropping block with foreign capacity");
                return;
            }
        };
        trace!(size = storage.capacity(), "block returned");
        self.returned.fetch_add(1, Ordering::Relaxed);
        self.classes[class].push(storage);
    }

    fn track(&self, storage: &BlockStorage) {
        if let Some(tracker) = &self.tracker {
            let key = lock(tracker).insert(LeaseRecord {
                size: storage.capacity(),
                since: Instant::now(),
            });
            storage.lease_key.store(key, Ordering::Relaxed);
        }
    }

    fn untrack(&self, storage: &BlockStorage) {
        let key = storage.lease_key.swap(UNTRACKED, Ordering::Relaxed);
        if key == UNTRACKED {
            return;
        }
        if let Some(tracker) = &self.tracker {
            lock(tracker).try_remove(key);
        }
    }

    fn emit(&self, event: PoolEvent) {
        if self.observer_count.load(Ordering::Acquire) == 0 {
            return;
        }
        let observers: Vec<Observer> = lock(&self.observers).iter().map(|(_, o)| Arc::clone(o)).collect();
        for observer in observers {
            observer(&event);
        }
    }
}

/// Shared handle onto a block pool. Cloning is cheap.
#[derive(Clone)]
pub struct BlockPool {
    shared: Arc<PoolShared>,
}

impl BlockPool {
    /// Create an isolated pool.
    pub fn new(options: PoolOptions) -> Self {
        let classes = (0..CLASS_COUNT).map(|_| SegQueue::new()).collect();
        Self {
            shared: Arc::new(PoolShared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                classes,
                observers: Mutex::new(Slab::new()),
                observer_count: AtomicUsize::new(0),
                tracker: options.track_leases.then(|| Mutex::new(Slab::new())),
                segment_lists: SegQueue::new(),
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                returned: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
            }),
        }
    }

    /// The process-wide default pool.
    pub fn shared() -> BlockPool {
        static SHARED: OnceLock<BlockPool> = OnceLock::new();
        SHARED
            .get_or_init(|| BlockPool::new(PoolOptions::default()))
            .clone()
    }

    pub(crate) fn id(&self) -> usize {
        self.shared.id
    }

    /// Lease a block of at least `size` bytes.
    ///
    /// Returns the writer handle and whether the block was freshly allocated.
    pub fn lease(&self, size: usize) -> Result<(MemoryBlock, bool)> {
        let class = size_class(size)?;
        let (storage, is_new) = match self.shared.classes[class].pop() {
            Some(storage) => (storage, false),
            None => {
                let storage = BlockStorage::allocate(class_size(class), Arc::downgrade(&self.shared));
                (Arc::new(storage), true)
            }
        };

        storage.checkout();
        self.shared.track(&storage);

        if is_new {
            self.shared.created.fetch_add(1, Ordering::Relaxed);
            debug!(size = storage.capacity(), "allocated block");
            self.shared.emit(PoolEvent::Created {
                size: storage.capacity(),
            });
        } else {
            self.shared.reused.fetch_add(1, Ordering::Relaxed);
            self.shared.emit(PoolEvent::Reused {
                size: storage.capacity(),
            });
        }

        Ok((MemoryBlock::from_storage(storage), is_new))
    }

    /// Lease a block of at least `size` bytes.
    pub fn lease_block(&self, size: usize) -> Result<MemoryBlock> {
        self.lease(size).map(|(block, _)| block)
    }

    /// Give up a writer handle explicitly.
    ///
    /// The block reaches the free list once every slice of it is gone too.
    pub fn return_block(&self, block: MemoryBlock) -> Result<()> {
        if !block.storage().belongs_to(&self.shared) {
            return Err(RespError::capacity(format!(
                "block of {} bytes does not belong to this pool",
                block.capacity()
            )));
        }
        drop(block);
        Ok(())
    }

    /// Number of idle blocks in the class that serves `size`.
    pub fn available(&self, size: usize) -> usize {
        size_class(size)
            .map(|class| self.shared.classes[class].len())
            .unwrap_or(0)
    }

    /// Free every idle block. Returns the number of blocks freed.
    pub fn trim(&self) -> usize {
        let mut freed = 0;
        for queue in &self.shared.classes {
            while let Some(storage) = queue.pop() {
                let size = storage.capacity();
                drop(storage);
                freed += 1;
                self.shared.emit(PoolEvent::Destroyed { size });
            }
        }
        self.shared
            .destroyed
            .fetch_add(freed as u64, Ordering::Relaxed);
        if freed > 0 {
            debug!(freed, "trimmed idle blocks");
        }
        freed
    }

    /// Register an observer for pool events.
    pub fn subscribe<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        let key = lock(&self.shared.observers).insert(Arc::new(observer));
        self.shared.observer_count.fetch_add(1, Ordering::Release);
        ObserverHandle(key)
    }

    /// Remove an observer. Returns `false` if the handle was not registered.
    pub fn unsubscribe(&self, handle: ObserverHandle) -> bool {
        let removed = lock(&self.shared.observers).try_remove(handle.0).is_some();
        if removed {
            self.shared.observer_count.fetch_sub(1, Ordering::Release);
        }
        removed
    }

    /// Whether outstanding leases are being recorded.
    pub fn tracks_leases(&self) -> bool {
        self.shared.tracker.is_some()
    }

    /// Number of recorded outstanding leases. Always zero without tracking.
    pub fn outstanding(&self) -> usize {
        self.shared
            .tracker
            .as_ref()
            .map(|tracker| lock(tracker).len())
            .unwrap_or(0)
    }

    /// Report leases that have been outstanding for at least `older_than`.
    ///
    /// Each report is also delivered to observers as
    /// [`PoolEvent::LeakSuspected`].
    pub fn scan_for_leaks(&self, older_than: Duration) -> Vec<LeakReport> {
        let Some(tracker) = &self.shared.tracker else {
            return Vec::new();
        };

        let reports: Vec<LeakReport> = lock(tracker)
            .iter()
            .map(|(_, record)| LeakReport {
                size: record.size,
                age: record.since.elapsed(),
            })
            .filter(|report| report.age >= older_than)
            .collect();

        for report in &reports {
            debug!(size = report.size, age_ms = report.age.as_millis() as u64, "block lease outstanding");
            self.shared.emit(PoolEvent::LeakSuspected {
                size: report.size,
                age: report.age,
            });
        }
        reports
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.shared.created.load(Ordering::Relaxed),
            reused: self.shared.reused.load(Ordering::Relaxed),
            returned: self.shared.returned.load(Ordering::Relaxed),
            destroyed: self.shared.destroyed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn take_segment_list(&self) -> Vec<BlockSlice> {
        self.shared.segment_lists.pop().unwrap_or_default()
    }

    pub(crate) fn recycle_segment_list(&self, mut segments: Vec<BlockSlice>) {
        segments.clear();
        if segments.capacity() > 0 && segments.capacity() <= MAX_RECYCLED_SEGMENTS {
            self.shared.segment_lists.push(segments);
        }
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new(PoolOptions::default())
    }
}

impl fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPool")
            .field("id", &self.shared.id)
            .field("stats", &self.stats())
            .field("tracks_leases", &self.tracks_leases())
            .finish()
    }
}

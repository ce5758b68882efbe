//! Leased memory blocks and the handles that share them.
//!
//! A block is a fixed-capacity byte region owned by a [`BlockPool`]. Every
//! handle onto a block holds one lease:
//!
//! - [`MemoryBlock`] is the unique writer. It appends at the `written`
//!   cursor and hands out read-only slices of what it has written.
//! - [`BlockSlice`] is a cloneable, read-only view of a written range.
//!
//! When the last lease is released the block goes back to its pool's free
//! list. Bytes covered by a slice are sealed: the writer may keep appending
//! past them but never rewrites them.
//!
//! [`BlockPool`]: super::BlockPool

use std::cell::Cell;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tracing::error;

use super::pool::PoolShared;
use crate::error::{RespError, Result};

/// Marker for a block that has no lease record in the tracker.
pub(crate) const UNTRACKED: usize = usize::MAX;

/// Backing storage shared by every handle onto one block.
pub(crate) struct BlockStorage {
    ptr: NonNull<u8>,
    capacity: usize,
    leases: AtomicUsize,
    pool: Weak<PoolShared>,
    /// Key into the pool's lease tracker while the block is checked out.
    pub(crate) lease_key: AtomicUsize,
}

// The raw region is only reached through handles that enforce the
// single-writer and sealed-range rules.
unsafe impl Send for BlockStorage {}
unsafe impl Sync for BlockStorage {}

impl BlockStorage {
    pub(crate) fn allocate(capacity: usize, pool: Weak<PoolShared>) -> Self {
        let region: &mut [u8] = Box::leak(vec![0u8; capacity].into_boxed_slice());
        Self {
            ptr: NonNull::from(region).cast::<u8>(),
            capacity,
            leases: AtomicUsize::new(0),
            pool,
            lease_key: AtomicUsize::new(UNTRACKED),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolShared>) -> bool {
        std::ptr::eq(self.pool.as_ptr(), Arc::as_ptr(pool))
    }

    /// Reset the lease count for a block coming out of a free list.
    pub(crate) fn checkout(&self) {
        self.leases.store(1, Ordering::Release);
    }

    fn acquire(&self) {
        self.leases.fetch_add(1, Ordering::Relaxed);
    }

    /// Release one lease. The last release hands the block back to its pool.
    fn release(self: &Arc<Self>) -> Result<()> {
        let previous = self
            .leases
            .fetch_update(Ordering::Release, Ordering::Relaxed, |n| n.checked_sub(1))
            .map_err(|_| RespError::Ownership("block lease released more often than taken"))?;

        if previous == 1 {
            fence(Ordering::Acquire);
            if let Some(pool) = self.pool.upgrade() {
                pool.give_back(Arc::clone(self));
            }
        }
        Ok(())
    }

    /// # Safety
    /// `start..start + len` must be within capacity and not concurrently
    /// written through another handle.
    unsafe fn bytes(&self, start: usize, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr().add(start), len)
    }

    /// # Safety
    /// Caller must be the unique writer of `start..start + len`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(&self, start: usize, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(start), len)
    }
}

impl Drop for BlockStorage {
    fn drop(&mut self) {
        let region = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.capacity);
        // Allocated by `Box::leak` in `allocate`.
        unsafe { drop(Box::from_raw(region)) };
    }
}

fn release_or_log(storage: &Arc<BlockStorage>) {
    if let Err(e) = storage.release() {
        error!(capacity = storage.capacity(), error = %e, "lease bookkeeping violated");
        debug_assert!(false, "{e}");
    }
}

/// Writer handle onto a leased block.
///
/// There is exactly one writer per lease cycle. It is `Send` but not `Sync`:
/// the write cursor and the sealed mark live in the handle.
pub struct MemoryBlock {
    storage: Arc<BlockStorage>,
    written: usize,
    /// Everything below this offset is visible through a `BlockSlice`.
    sealed: Cell<usize>,
}

impl MemoryBlock {
    /// Wrap storage that was just checked out with a lease count of one.
    pub(crate) fn from_storage(storage: Arc<BlockStorage>) -> Self {
        Self {
            storage,
            written: 0,
            sealed: Cell::new(0),
        }
    }

    pub(crate) fn storage(&self) -> &Arc<BlockStorage> {
        &self.storage
    }

    /// Total size of the block.
    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    /// Bytes written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Free space after the write cursor.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.written
    }

    /// Current number of leases (this writer plus any live slices).
    pub fn leases(&self) -> usize {
        self.storage.leases()
    }

    /// The written prefix of the block.
    pub fn written_bytes(&self) -> &[u8] {
        // The writer owns `0..written`; slices only read it.
        unsafe { self.storage.bytes(0, self.written) }
    }

    /// Free space to read into. Call [`advance`](Self::advance) afterwards.
    pub fn writable(&mut self) -> &mut [u8] {
        let remaining = self.remaining();
        // Past `written` nothing is sealed and only this handle writes.
        unsafe { self.storage.bytes_mut(self.written, remaining) }
    }

    /// Move the write cursor forward after filling part of [`writable`](Self::writable).
    ///
    /// # Panics
    /// Panics if `count` exceeds the remaining capacity.
    pub fn advance(&mut self, count: usize) {
        assert!(
            count <= self.remaining(),
            "advance({count}) past block capacity ({} remaining)",
            self.remaining()
        );
        self.written += count;
    }

    /// Copy as much of `src` as fits and return the number of bytes copied.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.remaining());
        self.writable()[..count].copy_from_slice(&src[..count]);
        self.written += count;
        count
    }

    /// Share `start..start + len` of the written bytes as a new lease.
    ///
    /// # Panics
    /// Panics if the range is not fully written.
    pub fn slice(&self, start: usize, len: usize) -> BlockSlice {
        assert!(
            start + len <= self.written,
            "slice {start}..{} beyond written bytes ({})",
            start + len,
            self.written
        );
        self.sealed.set(self.sealed.get().max(start + len));
        self.storage.acquire();
        BlockSlice {
            storage: Arc::clone(&self.storage),
            start,
            len,
        }
    }

    /// Mutable access to already written bytes that no slice has sealed yet.
    pub(crate) fn patch(&mut self, start: usize, len: usize) -> Result<&mut [u8]> {
        if start < self.sealed.get() {
            return Err(RespError::Ownership("patching bytes already shared"));
        }
        if start + len > self.written {
            return Err(RespError::capacity(format!(
                "patch {start}..{} beyond written bytes ({})",
                start + len,
                self.written
            )));
        }
        Ok(unsafe { self.storage.bytes_mut(start, len) })
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        release_or_log(&self.storage);
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("capacity", &self.capacity())
            .field("written", &self.written)
            .field("sealed", &self.sealed.get())
            .field("leases", &self.leases())
            .finish()
    }
}

/// Read-only, reference-counted view of part of a block.
pub struct BlockSlice {
    storage: Arc<BlockStorage>,
    start: usize,
    len: usize,
}

impl BlockSlice {
    pub fn as_bytes(&self) -> &[u8] {
        // Sealed range: the writer will not touch it again.
        unsafe { self.storage.bytes(self.start, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Leases currently held on the underlying block.
    pub fn leases(&self) -> usize {
        self.storage.leases()
    }

    /// A narrower view sharing the same block.
    ///
    /// # Panics
    /// Panics if the range falls outside this slice.
    pub fn subslice(&self, start: usize, len: usize) -> BlockSlice {
        assert!(start + len <= self.len, "subslice out of range");
        self.storage.acquire();
        BlockSlice {
            storage: Arc::clone(&self.storage),
            start: self.start + start,
            len,
        }
    }
}

impl Clone for BlockSlice {
    fn clone(&self) -> Self {
        self.storage.acquire();
        Self {
            storage: Arc::clone(&self.storage),
            start: self.start,
            len: self.len,
        }
    }
}

impl Drop for BlockSlice {
    fn drop(&mut self) {
        release_or_log(&self.storage);
    }
}

impl Deref for BlockSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl AsRef<[u8]> for BlockSlice {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl PartialEq for BlockSlice {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for BlockSlice {}

impl fmt::Debug for BlockSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockSlice({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BlockPool, PoolOptions};

    fn pool() -> BlockPool {
        BlockPool::new(PoolOptions::default())
    }

    #[test]
    fn test_write_and_slice() {
        let pool = pool();
        let mut block = pool.lease_block(64).unwrap();
        assert_eq!(block.capacity(), 64);
        assert_eq!(block.write(b"hello world"), 11);
        assert_eq!(block.written_bytes(), b"hello world");

        let hello = block.slice(0, 5);
        let world = block.slice(6, 5);
        assert_eq!(&*hello, b"hello");
        assert_eq!(&*world, b"world");
        assert_eq!(block.leases(), 3);
    }

    #[test]
    fn test_write_truncates_at_capacity() {
        let pool = pool();
        let mut block = pool.lease_block(64).unwrap();
        assert_eq!(block.write(&[1u8; 100]), 64);
        assert_eq!(block.remaining(), 0);
        assert_eq!(block.write(b"x"), 0);
    }

    #[test]
    fn test_writable_then_advance() {
        let pool = pool();
        let mut block = pool.lease_block(64).unwrap();
        block.writable()[..3].copy_from_slice(b"abc");
        block.advance(3);
        assert_eq!(block.written_bytes(), b"abc");
    }

    #[test]
    #[should_panic(expected = "past block capacity")]
    fn test_advance_past_capacity_panics() {
        let pool = pool();
        let mut block = pool.lease_block(64).unwrap();
        block.advance(65);
    }

    #[test]
    fn test_slices_keep_block_alive() {
        let pool = pool();
        let mut block = pool.lease_block(64).unwrap();
        block.write(b"payload");
        let slice = block.slice(0, 7);
        let copy = slice.clone();
        drop(block);

        assert_eq!(slice.leases(), 2);
        assert_eq!(pool.available(64), 0);
        drop(slice);
        assert_eq!(copy.leases(), 1);
        assert_eq!(&*copy, b"payload");
        drop(copy);
        assert_eq!(pool.available(64), 1);
    }

    #[test]
    fn test_subslice() {
        let pool = pool();
        let mut block = pool.lease_block(64).unwrap();
        block.write(b"$5\r\nhello\r\n");
        let frame = block.slice(0, 11);
        let payload = frame.subslice(4, 5);
        assert_eq!(&*payload, b"hello");
        assert_eq!(payload.leases(), 3);
    }

    #[test]
    fn test_patch_respects_sealed_range() {
        let pool = pool();
        let mut block = pool.lease_block(64).unwrap();
        block.write(b"................");
        let _shared = block.slice(0, 4);

        assert!(matches!(block.patch(2, 2), Err(RespError::Ownership(_))));
        block.patch(4, 4).unwrap().copy_from_slice(b"*12\r");
        assert_eq!(&block.written_bytes()[4..8], b"*12\r");
        assert!(matches!(block.patch(14, 4), Err(RespError::Capacity(_))));
    }

    #[test]
    fn test_release_underflow_is_an_error() {
        let pool = pool();
        let block = pool.lease_block(64).unwrap();
        let storage = Arc::clone(block.storage());
        drop(block);
        assert_eq!(storage.leases(), 0);
        assert!(matches!(storage.release(), Err(RespError::Ownership(_))));
        assert_eq!(storage.leases(), 0);
    }
}

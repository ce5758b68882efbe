//! Outgoing command buffers.
//!
//! An [`OutgoingBuffer`] encodes one command into a chain of pooled blocks.
//! Small commands on the same thread share a thread-local staging block,
//! so steady-state encoding leases nothing: each buffer starts where the
//! previous one on that thread ended, and a full staging block is swapped
//! for a fresh one.
//!
//! A buffer may reserve a prefix region up front for a header that is only
//! known once all arguments are written (the `*argc\r\n` of a command).
//! [`OutgoingBuffer::commit_prefix`] patches it in place inside the first
//! segment, and unused prefix bytes are skipped when the buffer is sliced.
//!
//! Committing turns the buffer into a [`CommittedBuffer`]: an immutable,
//! shareable segment list for the transport.

use std::cell::RefCell;
use std::fmt;
use std::io::IoSlice;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::trace;

use super::block::{BlockSlice, MemoryBlock};
use super::pool::BlockPool;
use crate::error::{RespError, Result};

/// Largest prefix a buffer may reserve.
pub const MAX_PREFIX_SIZE: usize = 32;

struct StagingSlot {
    pool_id: usize,
    block: Option<MemoryBlock>,
    checked_out: bool,
}

thread_local! {
    static STAGING: RefCell<Vec<StagingSlot>> = const { RefCell::new(Vec::new()) };
}

/// Take this thread's staging block for `pool`, swapping it for a fresh one
/// when it has less than `min_free` bytes left.
fn checkout_staging(pool: &BlockPool, min_free: usize, block_size: usize) -> Result<MemoryBlock> {
    STAGING.with(|cell| {
        let mut slots = cell.borrow_mut();
        let index = match slots.iter().position(|slot| slot.pool_id == pool.id()) {
            Some(index) => index,
            None => {
                slots.push(StagingSlot {
                    pool_id: pool.id(),
                    block: None,
                    checked_out: false,
                });
                slots.len() - 1
            }
        };

        let slot = &mut slots[index];
        if slot.checked_out {
            return Err(RespError::Ownership(
                "staging block is held by an uncommitted buffer on this thread",
            ));
        }

        let block = match slot.block.take() {
            Some(block) if block.remaining() >= min_free => block,
            _ => pool.lease_block(block_size)?,
        };
        slot.checked_out = true;
        Ok(block)
    })
}

fn checkin_staging(pool_id: usize, block: MemoryBlock) {
    let _ = STAGING.try_with(|cell| {
        if let Ok(mut slots) = cell.try_borrow_mut() {
            if let Some(slot) = slots.iter_mut().find(|slot| slot.pool_id == pool_id) {
                slot.checked_out = false;
                slot.block = Some(block);
            }
        }
    });
}

/// Single-writer encoder for one command.
///
/// Not `Send`: the staging block it holds belongs to the current thread
/// until the buffer is committed or dropped.
pub struct OutgoingBuffer {
    pool: BlockPool,
    block_size: usize,
    max_prefix: usize,
    prefix_len: Option<usize>,
    /// First block, kept as a writer after an extension so the prefix can
    /// still be patched.
    head: Option<(MemoryBlock, usize)>,
    segments: Vec<BlockSlice>,
    current: Option<MemoryBlock>,
    current_offset: usize,
    len: usize,
    _thread_bound: PhantomData<*const ()>,
}

impl OutgoingBuffer {
    /// Start a buffer backed by `pool`.
    ///
    /// # Arguments
    /// * `needs_prefix` - Reserve `max_prefix` bytes for [`commit_prefix`](Self::commit_prefix)
    /// * `max_prefix` - Size of the reserved region
    /// * `block_size` - Size of blocks leased when the buffer grows
    pub fn new(pool: &BlockPool, needs_prefix: bool, max_prefix: usize, block_size: usize) -> Result<Self> {
        let reserve = if needs_prefix { max_prefix } else { 0 };
        if reserve > MAX_PREFIX_SIZE || reserve > block_size {
            return Err(RespError::capacity(format!(
                "prefix of {reserve} bytes does not fit (max {MAX_PREFIX_SIZE}, block {block_size})"
            )));
        }

        let mut block = checkout_staging(pool, reserve.max(1), block_size)?;
        let offset = block.written();
        block.advance(reserve);

        Ok(Self {
            pool: pool.clone(),
            block_size,
            max_prefix: reserve,
            prefix_len: None,
            head: None,
            segments: pool.take_segment_list(),
            current: Some(block),
            current_offset: offset,
            len: 0,
            _thread_bound: PhantomData,
        })
    }

    /// Drop this thread's staging block for `pool` so its lease ends once
    /// every committed buffer carved from it is gone. Returns `false` if
    /// there was none, or an uncommitted buffer still holds it.
    pub fn release_staging(pool: &BlockPool) -> bool {
        STAGING
            .try_with(|cell| {
                let mut slots = cell.borrow_mut();
                let Some(index) = slots.iter().position(|slot| slot.pool_id == pool.id()) else {
                    return false;
                };
                if slots[index].checked_out {
                    return false;
                }
                let released = slots.swap_remove(index).block.is_some();
                if released {
                    trace!("released staging block");
                }
                released
            })
            .unwrap_or(false)
    }

    /// Payload bytes written so far, not counting the prefix.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of completed segments so far (blocks already filled).
    pub fn segment_count(&self) -> usize {
        self.segments.len() + usize::from(self.head.is_some())
    }

    fn current_mut(&mut self) -> Result<&mut MemoryBlock> {
        self.current
            .as_mut()
            .ok_or(RespError::Ownership("buffer already committed"))
    }

    /// Move to a fresh block, completing the segment in the current one.
    fn extend(&mut self) -> Result<()> {
        let next = self.pool.lease_block(self.block_size)?;
        let previous = self
            .current
            .replace(next)
            .ok_or(RespError::Ownership("buffer already committed"))?;
        let start = std::mem::replace(&mut self.current_offset, 0);

        let is_first = self.head.is_none() && self.segments.is_empty();
        if is_first && self.max_prefix > 0 {
            self.head = Some((previous, start));
        } else if previous.written() > start {
            self.segments
                .push(previous.slice(start, previous.written() - start));
        }
        trace!(segments = self.segment_count(), "outgoing buffer extended");
        Ok(())
    }

    /// Append raw bytes, growing into new blocks as needed.
    pub fn write(&mut self, mut src: &[u8]) -> Result<()> {
        self.len += src.len();
        loop {
            let copied = self.current_mut()?.write(src);
            src = &src[copied..];
            if src.is_empty() {
                return Ok(());
            }
            self.extend()?;
        }
    }

    pub fn write_crlf(&mut self) -> Result<()> {
        self.write(b"\r\n")
    }

    /// Patch `length` bytes of the reserved prefix, right-aligned so the
    /// header sits directly before the payload.
    pub fn commit_prefix(&mut self, length: usize) -> Result<&mut [u8]> {
        if self.current.is_none() {
            return Err(RespError::Ownership("buffer already committed"));
        }
        if self.max_prefix == 0 {
            return Err(RespError::Ownership("buffer has no reserved prefix"));
        }
        if length > self.max_prefix {
            return Err(RespError::capacity(format!(
                "prefix of {length} bytes exceeds the reserved {}",
                self.max_prefix
            )));
        }

        self.prefix_len = Some(length);
        let skip = self.max_prefix - length;
        let (block, start) = match &mut self.head {
            Some((block, start)) => (block, *start),
            None => match self.current.as_mut() {
                Some(block) => (block, self.current_offset),
                None => return Err(RespError::Ownership("buffer already committed")),
            },
        };
        block.patch(start + skip, length)
    }

    /// Seal the buffer into a shareable segment list and hand the staging
    /// block back to the thread.
    pub fn commit(mut self) -> Result<CommittedBuffer> {
        let skip = match (self.max_prefix, self.prefix_len) {
            (0, _) => 0,
            (max, Some(len)) => max - len,
            (_, None) => return Err(RespError::format("prefix reserved but never committed")),
        };
        let current = self
            .current
            .take()
            .ok_or(RespError::Ownership("buffer already committed"))?;

        let mut segments = self.pool.take_segment_list();
        let current_start = match self.head.take() {
            Some((head, start)) => {
                let from = start + skip;
                if head.written() > from {
                    segments.push(head.slice(from, head.written() - from));
                }
                segments.append(&mut self.segments);
                self.current_offset
            }
            None => {
                segments.append(&mut self.segments);
                self.current_offset + skip
            }
        };
        if current.written() > current_start {
            segments.push(current.slice(current_start, current.written() - current_start));
        }
        checkin_staging(self.pool.id(), current);

        let len = segments.iter().map(|segment| segment.len()).sum();
        Ok(CommittedBuffer {
            inner: Arc::new(Committed {
                pool: self.pool.clone(),
                segments,
                len,
            }),
        })
    }
}

impl Drop for OutgoingBuffer {
    fn drop(&mut self) {
        if let Some(block) = self.current.take() {
            checkin_staging(self.pool.id(), block);
        }
        let segments = std::mem::take(&mut self.segments);
        self.pool.recycle_segment_list(segments);
    }
}

impl fmt::Debug for OutgoingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingBuffer")
            .field("len", &self.len)
            .field("segments", &self.segment_count())
            .field("max_prefix", &self.max_prefix)
            .field("committed", &self.current.is_none())
            .finish()
    }
}

struct Committed {
    pool: BlockPool,
    segments: Vec<BlockSlice>,
    len: usize,
}

impl Drop for Committed {
    fn drop(&mut self) {
        let segments = std::mem::take(&mut self.segments);
        self.pool.recycle_segment_list(segments);
    }
}

/// Immutable, encoded command ready for the transport.
///
/// Cloning shares the segments. The blocks go back to the pool once the
/// command owner and the delivery pipeline have both let go.
#[derive(Clone)]
pub struct CommittedBuffer {
    inner: Arc<Committed>,
}

impl CommittedBuffer {
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn segments(&self) -> &[BlockSlice] {
        &self.inner.segments
    }

    /// Scatter-gather list for vectored writes.
    pub fn as_segment_list(&self) -> Vec<IoSlice<'_>> {
        self.inner
            .segments
            .iter()
            .map(|segment| IoSlice::new(segment.as_bytes()))
            .collect()
    }

    /// Append every segment to `dst`.
    pub fn copy_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.len());
        for segment in &self.inner.segments {
            dst.extend_from_slice(segment.as_bytes());
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for segment in &self.inner.segments {
            out.extend_from_slice(segment.as_bytes());
        }
        out
    }

    /// Handles currently sharing this buffer.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Release the command owner's hold.
    pub fn free_by_owner(self) {
        drop(self);
    }

    /// Release the transport's hold after the bytes were written.
    pub fn free_by_delivery_pipeline(self) {
        trace!(len = self.len(), "outgoing buffer delivered");
        drop(self);
    }
}

impl fmt::Debug for CommittedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommittedBuffer({:?})", String::from_utf8_lossy(&self.to_vec()))
    }
}

//! The incremental framer.
//!
//! Single-threaded: one receive path drives `receiving_block` and `feed`
//! in turn.

use std::fmt;

use tracing::{debug, trace};

use super::frame::{Frame, ReadyFrames};
use super::{Decision, FrameScanner, WindowSize};
use crate::error::{RespError, Result};
use crate::memory::{BlockPool, BlockSlice, MemoryBlock};

const DISPOSED: RespError = RespError::Ownership("framer disposed");

/// Where the framer is with respect to the frame in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerState {
    /// Between frames.
    Idle,
    /// Scanning a frame whose end is not known yet.
    Accumulating,
    /// The frame's length is known; waiting for the rest of its bytes.
    AwaitingMoreData,
}

struct PendingFrame<C> {
    context: C,
    /// Offset of the frame in the current block (meaningful while the tail is empty).
    start: usize,
    /// Frame bytes accounted for so far.
    length: usize,
}

/// Turns an append-only byte stream into frames.
pub struct Framer<S: FrameScanner> {
    scanner: S,
    window: WindowSize,
    pool: BlockPool,
    block_size: usize,
    current: Option<MemoryBlock>,
    /// Bytes of `current` already scanned.
    consumed: usize,
    /// Bytes still owed to a frame of known length.
    to_skip: usize,
    awaiting_more_data: bool,
    pending: Option<PendingFrame<S::Context>>,
    /// Earlier parts of a frame that spans blocks.
    tail: Vec<BlockSlice>,
    spare: Vec<Frame<S::Context>>,
}

impl<S: FrameScanner> Framer<S> {
    /// Create a framer that reads into blocks of `block_size` bytes.
    pub fn new(scanner: S, pool: &BlockPool, block_size: usize) -> Result<Self> {
        let window = scanner.window();
        if window.min == 0 || window.min > window.max {
            return Err(RespError::capacity(format!(
                "invalid scan window {}..={}",
                window.min, window.max
            )));
        }
        let block = pool.lease_block(block_size)?;
        if block.capacity() < window.min {
            return Err(RespError::capacity(format!(
                "receive block of {} bytes is smaller than the scan window",
                block.capacity()
            )));
        }

        Ok(Self {
            scanner,
            window,
            pool: pool.clone(),
            block_size,
            current: Some(block),
            consumed: 0,
            to_skip: 0,
            awaiting_more_data: false,
            pending: None,
            tail: Vec::new(),
            spare: Vec::new(),
        })
    }

    pub fn state(&self) -> FramerState {
        match (&self.pending, self.awaiting_more_data) {
            (None, _) => FramerState::Idle,
            (Some(_), false) => FramerState::Accumulating,
            (Some(_), true) => FramerState::AwaitingMoreData,
        }
    }

    pub fn scanner(&self) -> &S {
        &self.scanner
    }

    /// A block with at least `window.min` bytes of free space to read into.
    ///
    /// After writing into it, call [`feed`](Self::feed).
    pub fn receiving_block(&mut self) -> Result<&mut MemoryBlock> {
        let needs_rotation = match &self.current {
            Some(block) => block.remaining() < self.window.min,
            None => return Err(DISPOSED),
        };
        if needs_rotation {
            self.rotate()?;
        }
        self.current.as_mut().ok_or(DISPOSED)
    }

    /// Swap the full current block for a fresh one, keeping the scanned part
    /// of a frame in flight in the tail and carrying unscanned bytes over.
    fn rotate(&mut self) -> Result<()> {
        let mut next = self.pool.lease_block(self.block_size)?;
        let current = self.current.as_ref().ok_or(DISPOSED)?;

        if let Some(pending) = self.pending.as_mut() {
            let start = if self.tail.is_empty() { pending.start } else { 0 };
            if self.consumed > start {
                self.tail.push(current.slice(start, self.consumed - start));
            }
            pending.start = 0;
        }
        if current.written() > self.consumed {
            next.write(&current.written_bytes()[self.consumed..]);
        }

        trace!(
            tail = self.tail.len(),
            carried = next.written(),
            "rotated receive block"
        );
        self.current = Some(next);
        self.consumed = 0;
        Ok(())
    }

    /// Scan bytes written since the last call and return completed frames.
    pub fn feed(&mut self) -> Result<ReadyFrames<S::Context>> {
        let current = self.current.as_ref().ok_or(DISPOSED)?;
        let bytes = current.written_bytes();
        let written = bytes.len();
        let effective = written - self.consumed;

        if self.to_skip > effective {
            self.to_skip -= effective;
            self.consumed = written;
            return Ok(ReadyFrames::empty());
        }

        let mut frames = std::mem::take(&mut self.spare);
        self.consumed += self.to_skip;
        self.to_skip = 0;
        let mut i = self.consumed;

        if self.awaiting_more_data {
            self.awaiting_more_data = false;
            if let Some(pending) = self.pending.take() {
                frames.push(assemble(&self.pool, &mut self.tail, current, pending)?);
            }
        }

        while i + self.window.min <= written {
            let mut pending = match self.pending.take() {
                Some(pending) => pending,
                None => PendingFrame {
                    context: self.scanner.begin(),
                    start: i,
                    length: 0,
                },
            };

            let window = self.window.slice(bytes, i);
            match self.scanner.advance(&mut pending.context, window)? {
                Decision::Continue => {
                    pending.length += window.len();
                    i += window.len();
                    self.consumed = i;
                    self.pending = Some(pending);
                }
                Decision::MarkBoundary(offset) => {
                    if offset >= window.len() {
                        return Err(RespError::format("frame boundary outside the scan window"));
                    }
                    pending.length += offset + 1;
                    i += offset + 1;
                    self.consumed = i;
                    frames.push(assemble(&self.pool, &mut self.tail, current, pending)?);
                }
                Decision::PredefinedLength {
                    examined,
                    remaining,
                } => {
                    if examined > window.len() {
                        return Err(RespError::format("scanner examined past its window"));
                    }
                    pending.length += examined + remaining;
                    if pending.length == 0 {
                        return Err(RespError::format("empty frame"));
                    }

                    let available = written - i - examined;
                    if available >= remaining {
                        i += examined + remaining;
                        self.consumed = i;
                        frames.push(assemble(&self.pool, &mut self.tail, current, pending)?);
                    } else {
                        self.consumed = written;
                        self.to_skip = remaining - available;
                        self.awaiting_more_data = true;
                        self.pending = Some(pending);
                        break;
                    }
                }
            }
        }

        Ok(ReadyFrames { frames })
    }

    /// Return a drained [`ReadyFrames`] so its allocation is reused.
    pub fn recycle(&mut self, ready: ReadyFrames<S::Context>) {
        let mut frames = ready.frames;
        frames.clear();
        if frames.capacity() > self.spare.capacity() {
            self.spare = frames;
        }
    }

    /// Copy `data` through the framer and collect every completed frame.
    pub fn push(&mut self, mut data: &[u8]) -> Result<Vec<Frame<S::Context>>> {
        let mut out = Vec::new();
        while !data.is_empty() {
            let block = self.receiving_block()?;
            let copied = block.write(data);
            data = &data[copied..];

            let mut ready = self.feed()?;
            out.extend(ready.drain());
            self.recycle(ready);
        }
        Ok(out)
    }

    /// Forget all partial state, e.g. before reusing the framer on a new
    /// connection. A block with stale bytes is replaced, never reused.
    pub fn reset(&mut self) -> Result<()> {
        self.pending = None;
        self.awaiting_more_data = false;
        self.consumed = 0;
        self.to_skip = 0;
        self.tail.clear();
        self.scanner.reset();

        let dirty = match &self.current {
            Some(block) => block.written() > 0,
            None => return Err(DISPOSED),
        };
        if dirty {
            self.current = Some(self.pool.lease_block(self.block_size)?);
        }
        debug!("framer reset");
        Ok(())
    }

    /// Release the receive block. Calling it again does nothing.
    pub fn dispose(&mut self) {
        if self.current.take().is_some() {
            self.pending = None;
            self.tail.clear();
            self.spare = Vec::new();
            debug!("framer disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.current.is_none()
    }
}

/// Build the frame for `pending`: a slice of `current` when the frame lives
/// in one block, otherwise a pooled copy of the tail plus the rest.
fn assemble<C>(
    pool: &BlockPool,
    tail: &mut Vec<BlockSlice>,
    current: &MemoryBlock,
    pending: PendingFrame<C>,
) -> Result<Frame<C>> {
    if tail.is_empty() {
        return Ok(Frame::new(
            pending.context,
            current.slice(pending.start, pending.length),
        ));
    }

    let mut block = pool.lease_block(pending.length)?;
    for part in tail.drain(..) {
        block.write(&part);
    }
    let rest = pending
        .length
        .checked_sub(block.written())
        .ok_or_else(|| RespError::format("frame shorter than its buffered parts"))?;
    block.write(&current.written_bytes()[..rest]);
    trace!(length = pending.length, "frame spans blocks, copied");

    Ok(Frame::new(pending.context, block.slice(0, pending.length)))
}

impl<S: FrameScanner> fmt::Debug for Framer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framer")
            .field("state", &self.state())
            .field("consumed", &self.consumed)
            .field("to_skip", &self.to_skip)
            .field("tail", &self.tail.len())
            .field("current", &self.current)
            .finish()
    }
}

//! Emitted frames.

use std::fmt;

use crate::memory::BlockSlice;

/// One complete unit of wire data plus the scanner's context for it.
///
/// Holds a lease on the bytes; dropping the frame releases it.
#[derive(Clone)]
pub struct Frame<C> {
    context: C,
    data: BlockSlice,
}

impl<C> Frame<C> {
    pub fn new(context: C, data: BlockSlice) -> Self {
        Self { context, data }
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    /// The full frame, type tag and terminators included.
    pub fn bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &BlockSlice {
        &self.data
    }

    pub fn into_parts(self) -> (C, BlockSlice) {
        (self.context, self.data)
    }
}

impl<C: fmt::Debug> fmt::Debug for Frame<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("context", &self.context)
            .field("bytes", &String::from_utf8_lossy(self.bytes()))
            .finish()
    }
}

/// Frames completed by one `feed` call, in wire order.
///
/// Hand it back with [`Framer::recycle`](super::Framer::recycle) to reuse
/// the allocation.
pub struct ReadyFrames<C> {
    pub(super) frames: Vec<Frame<C>>,
}

impl<C> ReadyFrames<C> {
    pub(super) fn empty() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Frame<C>> {
        self.frames.iter()
    }

    /// Move the frames out, keeping the allocation.
    pub fn drain(&mut self) -> std::vec::Drain<'_, Frame<C>> {
        self.frames.drain(..)
    }
}

impl<C> IntoIterator for ReadyFrames<C> {
    type Item = Frame<C>;
    type IntoIter = std::vec::IntoIter<Frame<C>>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.into_iter()
    }
}

impl<C: fmt::Debug> fmt::Debug for ReadyFrames<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.frames.iter()).finish()
    }
}

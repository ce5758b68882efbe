//! Window-based incremental framing.
//!
//! A [`Framer`] owns the receive side of a byte stream: it hands out blocks
//! to read into, scans newly written bytes and emits complete [`Frame`]s.
//! What a frame *is* comes from a [`FrameScanner`], which inspects a small
//! lookahead window at a time and answers with a [`Decision`].
//!
//! Frames that fit in one receive block are zero-copy slices of it. Frames
//! spanning blocks are copied once into a pooled block when they complete.

mod frame;
mod framer;

pub use frame::{Frame, ReadyFrames};
pub use framer::{Framer, FramerState};

use std::fmt;

use crate::error::Result;

/// How many lookahead bytes a scanner wants per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    /// Scanning stops when fewer bytes than this are unscanned.
    pub min: usize,
    /// Windows are cut to at most this many bytes.
    pub max: usize,
}

impl WindowSize {
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    pub const fn fixed(size: usize) -> Self {
        Self {
            min: size,
            max: size,
        }
    }

    /// The window starting at `position`, shortened at the end of `bytes`.
    pub fn slice<'a>(&self, bytes: &'a [u8], position: usize) -> &'a [u8] {
        let end = position.saturating_add(self.max).min(bytes.len());
        &bytes[position..end]
    }
}

/// A scanner's verdict for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The whole window belongs to the current frame; keep going.
    Continue,
    /// The frame ends at this offset into the window (inclusive).
    MarkBoundary(usize),
    /// `examined` bytes of the window were read and exactly `remaining`
    /// more bytes complete the frame, starting right after them.
    PredefinedLength { examined: usize, remaining: usize },
}

/// Protocol-specific half of a [`Framer`].
pub trait FrameScanner {
    /// Per-frame state carried alongside the emitted bytes.
    type Context: Clone + fmt::Debug;

    fn window(&self) -> WindowSize;

    /// Called when a new frame starts.
    fn begin(&mut self) -> Self::Context;

    /// Inspect the next window of the frame in progress.
    fn advance(&mut self, context: &mut Self::Context, window: &[u8]) -> Result<Decision>;

    /// Drop any partial state.
    fn reset(&mut self) {}
}

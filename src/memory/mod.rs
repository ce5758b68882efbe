//! Pooled, reference-counted memory shared by the incoming and outgoing paths.
//!
//! - `pool`: size-classed block pool with lock-free free lists
//! - `block`: writer and reader handles onto leased blocks
//! - `outgoing`: command encoding buffers backed by the pool

mod block;
mod outgoing;
mod pool;

pub use block::{BlockSlice, MemoryBlock};
pub use outgoing::{CommittedBuffer, OutgoingBuffer, MAX_PREFIX_SIZE};
pub use pool::{
    class_size, size_class, BlockPool, LeakReport, ObserverHandle, PoolEvent, PoolOptions,
    PoolStats, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};

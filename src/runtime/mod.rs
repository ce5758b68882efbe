//! Client runtime on tokio.
//!
//! - `command`: command building, encoding and key slots
//! - `completion`: FIFO of commands waiting for replies
//! - `protocol`: routes aggregated replies and pushes
//! - `connection`: the socket, its tasks and the public `Client`

pub mod command;
mod completion;
mod connection;
mod protocol;

pub use command::{hash_slot, Command, EncodedCommand, DEFAULT_OUTGOING_BLOCK_SIZE, SLOT_COUNT};
pub use connection::{Client, ClientOptions};

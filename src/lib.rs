//! respwire: a RESP3 client core.
//!
//! Replies are read into pooled, reference-counted blocks, cut into frames
//! by a window scanner and folded into nested values without copying the
//! payload bytes. Commands are encoded into the same pooled blocks and
//! written by a single send loop per connection.
//!
//! ```no_run
//! use respwire::{Client, ClientOptions};
//!
//! # async fn run() -> Result<(), respwire::ClientError> {
//! let client = Client::connect(ClientOptions::new("127.0.0.1:6379")).await?;
//! let command = client.command("SET").key("greeting").arg("hello");
//! client.execute::<()>(command).await?;
//! let value: String = client.execute(client.command("GET").key("greeting")).await?;
//! assert_eq!(value, "hello");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod framing;
pub mod memory;
pub mod protocols;
pub mod runtime;

pub use error::{ClientError, RespError};
pub use memory::{BlockPool, PoolOptions};
pub use protocols::resp::{FromResponse, RespPush, RespResponse, Value};
pub use runtime::{Client, ClientOptions, Command, EncodedCommand};

//! Protocol implementations.
//!
//! - `resp`: RESP3 (and RESP2) replies and command encoding

pub mod resp;

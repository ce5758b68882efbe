//! RESP3 wire protocol: frame scanning, aggregation, typed replies and
//! command encoding.
//!
//! RESP2 replies are a subset and go through the same path.

pub mod aggregate;
pub mod parser;
pub mod response;
pub mod types;
pub mod writer;

pub use aggregate::{Aggregate, AggregatesPool, AggregationStrategy, RespFrame, RespValueVariant};
pub use parser::RespScanner;
pub use response::{
    FromResponse, RespArray, RespBigNumber, RespBoolean, RespDouble, RespMap, RespNumber, RespPush,
    RespResponse, RespSet, RespString, RespSubscriptionAck, RespVoid, ResponseType, TypedResponse,
    Value,
};
pub use types::{DeclaredLength, RespContext, RespType};
pub use writer::ProtocolWriter;

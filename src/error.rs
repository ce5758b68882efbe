//! Error types shared by the memory, framing and connection layers.
//!
//! `RespError` covers everything that can go wrong below the connection:
//! malformed input, a corrupted byte stream, size-class violations and
//! lease bookkeeping mistakes. Wire errors are never retried; the
//! connection layer turns them into a reconnect.

use thiserror::Error;

use crate::protocols::resp::response::ResponseType;
use crate::protocols::resp::types::RespType;

/// Core error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RespError {
    /// Malformed length digits, unknown type tags, bad nesting.
    #[error("malformed frame: {0}")]
    Format(String),

    /// The CRLF scanner saw a byte that does not fit its current state.
    #[error("unexpected byte {byte:#04x} while {state}")]
    ProtocolState { byte: u8, state: &'static str },

    /// Block size outside the supported classes, or a hard size cap was hit.
    #[error("capacity error: {0}")]
    Capacity(String),

    /// A lease was released more often than it was taken, or a handle was
    /// used after it gave up its block.
    #[error("ownership violation: {0}")]
    Ownership(&'static str),
}

impl RespError {
    pub(crate) fn format(message: impl Into<String>) -> Self {
        RespError::Format(message.into())
    }

    pub(crate) fn capacity(message: impl Into<String>) -> Self {
        RespError::Capacity(message.into())
    }

    /// Whether the error means the byte stream can no longer be trusted.
    pub fn is_fatal_to_stream(&self) -> bool {
        matches!(self, RespError::Format(_) | RespError::ProtocolState { .. })
    }
}

/// Errors surfaced to callers of [`crate::Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Resp(#[from] RespError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server answered with a simple or bulk error.
    #[error("server error: {0}")]
    Server(String),

    #[error("expected a {expected:?} response, got {actual:?}")]
    UnexpectedResponse {
        expected: ResponseType,
        actual: RespType,
    },

    #[error("command timed out")]
    Timeout,

    #[error("command was cancelled before it was sent")]
    Cancelled,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("not connected")]
    NotConnected,

    #[error("client closed")]
    Closed,

    /// The command cannot run over the negotiated protocol.
    #[error("{command} requires RESP3")]
    RequiresResp3 { command: String },
}

pub type Result<T, E = RespError> = std::result::Result<T, E>;

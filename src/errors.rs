//! Transport error taxonomy
//!
//! One flat enum shared by the protocol codecs, the stream layer and both
//! connection surfaces. Variants are stable identifiers: callers match on
//! the variant, the payload string is for humans and logs only.

use std::io;

/// Errors produced by the Bolt transport.
///
/// `NetworkError` (which includes timeouts and partial transfers) always
/// leaves the connection defunct. Server-reported failures are classified
/// onto `NetworkError`, `HandshakeFailed`, `InvalidArgument` or
/// `UnknownError` depending on the failure code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoltError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("deserialization error: {0}")]
    DeserializationError(String),

    #[error("invalid message format: {0}")]
    InvalidMessageFormat(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("server accepted none of the proposed protocol versions")]
    HandshakeNoCommonVersion,

    #[error("handshake magic mismatch")]
    HandshakeMagicMismatch,

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("chunk exceeds maximum size: {0} bytes")]
    ChunkTooLarge(usize),

    #[error("chunk encoding error: {0}")]
    ChunkEncodingError(String),

    #[error("chunk decoding error: {0}")]
    ChunkDecodingError(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("recursion depth exceeded while decoding")]
    RecursionDepthExceeded,

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("unknown error: {0}")]
    UnknownError(String),
}

impl BoltError {
    /// Maps an I/O failure onto the taxonomy. Timeouts are logged at the
    /// call site and surfaced as `NetworkError` like every other I/O fault.
    pub(crate) fn from_io(context: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::OutOfMemory => BoltError::OutOfMemory(format!("{context}: {err}")),
            io::ErrorKind::InvalidInput => BoltError::InvalidArgument(format!("{context}: {err}")),
            _ => BoltError::NetworkError(format!("{context}: {err}")),
        }
    }

    /// True when the I/O layer saw a timeout rather than a hard fault.
    pub(crate) fn io_is_timeout(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        )
    }

    /// Retryable errors leave the connection in FAILED_SERVER_REPORTED and
    /// can be cleared by a RESET; everything else is fatal to the connection.
    pub fn is_retryable_server_failure(&self) -> bool {
        matches!(self, BoltError::NetworkError(msg) if msg.starts_with("server error"))
    }
}

pub type Result<T> = std::result::Result<T, BoltError>;

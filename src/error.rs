use crate::types::StoreId;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Ways the remote peer can break the wire contract.
///
/// Any of these means the channel is in an unknown state; the client
/// disposes it rather than returning it to the pool.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(
        "protocol version mismatch: expected internal {expected_internal}/application \
         {expected_application}, peer sent {actual_internal}/{actual_application}"
    )]
    VersionMismatch {
        expected_internal: u8,
        expected_application: u8,
        actual_internal: u8,
        actual_application: u8,
    },

    #[error("inbound frame of {length} bytes exceeds the configured frame length of {max}")]
    OversizedFrame { length: u32, max: u32 },

    #[error("zero-length frame")]
    ZeroLengthFrame,

    /// A frame too short to carry its handshake and continuation flag.
    #[error("truncated chunk of {length} bytes")]
    TruncatedChunk { length: usize },

    #[error("invalid chunk continuation flag {0:#04x}")]
    BadChunkFlag(u8),

    #[error("empty logical message")]
    EmptyMessage,

    /// The message ended before a consumer-requested read could complete.
    #[error("insufficient data: requested {requested} bytes, message holds {available} more")]
    InsufficientData { requested: usize, available: usize },

    /// Read attempted after the last chunk was fully consumed.
    #[error("read past the end of the message")]
    EndOfMessage,

    #[error("datasource index {index} outside the {count}-entry stream header")]
    BadDatasourceIndex { index: u8, count: usize },

    #[error("malformed UTF-8 in {field}")]
    Utf8 {
        field: &'static str,
        #[source]
        source: std::string::FromUtf8Error,
    },
}

/// Unified communication error surfaced by every client operation.
///
/// All failures during a request dispose the channel they happened on, so a
/// subsequent request starts from a fresh connection. The variants carry the
/// underlying kind so callers can distinguish, say, a store mismatch from a
/// dead master without string matching.
#[derive(Debug, Error)]
pub enum WireError {
    /// A new channel could not be established, or the pool is shut down.
    #[error("connect failed: {0}")]
    Connect(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No frame arrived within the per-request read timeout.
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("store mismatch: expected {expected}, response carried {actual}")]
    StoreMismatch { expected: StoreId, actual: StoreId },

    /// Socket failure mid-message.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Internal bug, e.g. unbalanced acquire/release.
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}

/// Result type used throughout the crate.
pub type WireResult<T> = Result<T, WireError>;

//! Error types for wire decoding.

use thiserror::Error;

/// Wire decode error type.
///
/// These never cross the event-queue boundary: a malformed record is logged
/// and skipped, and decoder-level failures degrade to an empty result.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A chunk-size line was not valid hex.
    #[error("bad chunk size line: {0:?}")]
    BadChunkSize(String),

    /// Decompression failed.
    #[error("decompression error: {0}")]
    Inflate(#[from] std::io::Error),

    /// A scanned record was not valid JSON.
    #[error("malformed record JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A record parsed but did not match the expected shape.
    #[error("unexpected record shape: {0}")]
    Shape(String),

    /// An unknown positional type tag in function arguments.
    #[error("unknown argument type tag: {0}")]
    UnknownTag(u64),

    /// A tagged argument had the wrong arity.
    #[error("bad argument arity for tag {tag}: {detail}")]
    BadArity { tag: u64, detail: String },
}

/// Result type for wire decoding.
pub type Result<T> = std::result::Result<T, DecodeError>;

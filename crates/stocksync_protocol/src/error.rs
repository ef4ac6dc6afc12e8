//! Error types for encoding and decoding.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while converting values to or from CBOR.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Serialization failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// The input is not a valid encoding of the requested type.
    #[error("decode error: {0}")]
    Decode(String),
}

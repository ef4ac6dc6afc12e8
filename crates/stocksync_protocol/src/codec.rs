//! CBOR encoding for persisted engine state.
//!
//! Everything the engine writes to disk (the pending queue and the
//! watermark table) goes through these two functions.

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value to CBOR bytes.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the value cannot be serialized.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buffer)
}

/// Decodes a value from CBOR bytes.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if the bytes are truncated, malformed or
/// do not match the shape of `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

//! Serialization and deserialization for the `TaskSync` wire protocol.
//!
//! Every relay frame and every direct-link payload is encoded with postcard.
//! Stream transports additionally wrap payloads in a 4-byte little-endian
//! length prefix via [`frame`].

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Length of the little-endian `u32` prefix written by [`frame`].
pub const FRAME_HEADER_LEN: usize = 4;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame is incomplete or has an invalid length prefix.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Encodes a wire value into a byte vector using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a wire value from a byte slice using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Wraps an already-encoded payload with a 4-byte little-endian length prefix.
///
/// Wire format: `[u32 length (LE)][payload bytes]`
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if the payload exceeds `u32::MAX` bytes.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        CodecError::InvalidFrame(format!(
            "payload too large for framing: {} bytes",
            payload.len()
        ))
    })?;
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Splits one length-prefixed frame off the front of `bytes`.
///
/// Returns the payload slice and the total number of bytes consumed
/// (including the prefix).
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if the input is shorter than the prefix
/// or than the length the prefix announces.
pub fn unframe(bytes: &[u8]) -> Result<(&[u8], usize), CodecError> {
    let Some(header) = bytes.get(..FRAME_HEADER_LEN) else {
        return Err(CodecError::InvalidFrame(format!(
            "need at least {FRAME_HEADER_LEN} bytes for length prefix, got {}",
            bytes.len()
        )));
    };
    let len_bytes: [u8; FRAME_HEADER_LEN] = header
        .try_into()
        .map_err(|_| CodecError::InvalidFrame("failed to read length prefix".into()))?;
    let payload_len = u32::from_le_bytes(len_bytes) as usize;
    let total = FRAME_HEADER_LEN + payload_len;
    let payload = bytes.get(FRAME_HEADER_LEN..total).ok_or_else(|| {
        CodecError::InvalidFrame(format!(
            "frame indicates {payload_len} bytes but only {} available",
            bytes.len() - FRAME_HEADER_LEN
        ))
    })?;
    Ok((payload, total))
}

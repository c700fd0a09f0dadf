//! CBOR framing for stream messages.
//!
//! Bus implementations own delivery; this module owns the byte form a
//! message takes in flight. CBOR keeps binary patch payloads compact
//! and round-trips `serde_json::Value` trees without loss.

use crate::error::{Result, WireError};
use crate::messages::StreamMessage;

/// Encode a message to CBOR bytes.
pub fn encode(message: &StreamMessage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(message, &mut bytes)
        .map_err(|e| WireError::EncodingError(e.to_string()))?;
    Ok(bytes)
}

/// Decode a message from CBOR bytes.
pub fn decode(bytes: &[u8]) -> Result<StreamMessage> {
    ciborium::from_reader(bytes).map_err(|e| WireError::DecodingError(e.to_string()))
}

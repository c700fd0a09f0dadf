//! Error types for the wire module.

use thiserror::Error;

use statesync_core::StreamId;

/// Errors that can occur at the wire layer.
#[derive(Debug, Error)]
pub enum WireError {
    /// Bus-level delivery failed.
    #[error("bus error: {0}")]
    BusError(String),

    /// Message encoding failed.
    #[error("encoding error: {0}")]
    EncodingError(String),

    /// Message decoding failed.
    #[error("decoding error: {0}")]
    DecodingError(String),

    /// A message violated structural rules or size limits.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// No session or mirror exists for this stream id.
    #[error("unknown stream {0:?}")]
    UnknownStream(StreamId),

    /// Timeout waiting for a message.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The underlying synchronization stream rejected an operation.
    #[error(transparent)]
    Stream(#[from] statesync_reactive::StreamError),

    /// Type registry or tree validation failure.
    #[error(transparent)]
    Core(#[from] statesync_core::CoreError),

    /// A patch could not be applied.
    #[error(transparent)]
    Patch(#[from] statesync_core::PatchError),
}

/// Result type for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;

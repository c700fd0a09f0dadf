//! Error types for statesync core.

use thiserror::Error;

use crate::pointer::Pointer;

/// Errors from the type registry and tree/typed conversion boundary.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown type discriminator: {0}")]
    UnknownType(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("node is not a {expected}: {detail}")]
    MalformedNode { expected: &'static str, detail: String },

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Errors from applying a patch to a snapshot.
///
/// Application is all-or-nothing: when any operation fails, the input
/// snapshot is left unchanged.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("path not found: {0}")]
    PathNotFound(Pointer),

    #[error("parent of {0} is not a container")]
    NotAContainer(Pointer),

    #[error("invalid array index {index} at {path}")]
    InvalidIndex { path: Pointer, index: String },

    #[error("array index {index} out of bounds (len {len}) at {path}")]
    IndexOutOfBounds { path: Pointer, index: usize, len: usize },

    #[error("add at existing key {0}")]
    KeyExists(Pointer),

    #[error("test failed at {0}")]
    TestFailed(Pointer),

    #[error("move/copy requires a `from` pointer")]
    MissingFrom,

    #[error("cannot move {from} into its own child {path}")]
    MoveIntoSelf { from: Pointer, path: Pointer },

    #[error("malformed pointer: {0}")]
    MalformedPointer(String),
}

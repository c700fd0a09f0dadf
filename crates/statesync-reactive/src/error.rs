//! Error types for the reactive module.

use thiserror::Error;

use statesync_core::ReferenceShape;

/// Errors from operating a synchronization stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// `initialize` was called on a stream that already has a value.
    #[error("stream already initialized")]
    AlreadyInitialized,

    /// An update was submitted to a manual-mode stream before
    /// `initialize`.
    #[error("stream not initialized")]
    NotInitialized,

    /// The stream has been disposed; this is a distinct failure so that
    /// use-after-dispose never masquerades as a no-op.
    #[error("stream disposed")]
    Disposed,

    /// Reducer resolution or backfeed failed.
    #[error(transparent)]
    Reduce(#[from] ReduceError),
}

/// Errors from the reducer registry.
#[derive(Debug, Error)]
pub enum ReduceError {
    /// No reducer is registered for this reference shape (or it was
    /// registered with a different reduced type). Raised lazily at
    /// first use, not at registration time.
    #[error("no reducer registered for reference shape {shape:?}")]
    MissingReducer { shape: ReferenceShape },

    /// The backfeed could not fold a reduced-side change into the full
    /// state.
    #[error("backfeed failed: {0}")]
    Backfeed(String),
}

/// Result type for reactive operations.
pub type Result<T> = std::result::Result<T, StreamError>;

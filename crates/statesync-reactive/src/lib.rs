//! # Statesync Reactive
//!
//! The reactive state container for statesync: [`SynchronizationStream`]
//! and the reducer registry [`ReduceManager`].
//!
//! ## Model
//!
//! Each stream is backed by one dedicated tokio task with an inbound
//! command channel. All mutation requests are messages on that channel,
//! processed strictly in order, so no two update functions for the same
//! stream ever run concurrently and each sees the result of the
//! previous one. Submitting an update never blocks; results are
//! observed through the broadcast side ([`Subscription`]), not a return
//! value. The wire layer, which needs to correlate failures, awaits an
//! [`UpdateOutcome`] instead.
//!
//! ## Reduction
//!
//! [`SynchronizationStream::reduce`] spawns a derived stream for a
//! sub-reference: updates flow down through the registered reducer and
//! writes flow back up through its backfeed. Derived streams are cached
//! by structurally-equal reference, so two requests for "the same
//! thing" share one stream.

pub mod error;
pub mod reduce;
pub mod stream;

pub use error::{ReduceError, Result, StreamError};
pub use reduce::{store_reducers, FnReducer, ReduceManager, Reducer};
pub use stream::{
    InitializationMode, Subscription, SynchronizationStream, UpdateOutcome,
};

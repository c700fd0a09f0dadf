//! # Statesync Core
//!
//! Pure primitives for the statesync system: stream references, entity
//! stores, patches, and change items.
//!
//! This crate contains no I/O, no async, no networking. It is pure
//! computation over immutable value types.
//!
//! ## Key Types
//!
//! - [`StreamReference`] - Structural descriptor of which slice of state a stream tracks
//! - [`EntityStore`] - Generic nested-map representation of domain state
//! - [`Patch`] - Ordered list of path-addressed operations between two snapshots
//! - [`ChangeItem`] - One immutable revision record of a stream's value
//! - [`TypeRegistry`] - Tagged-variant registry for the wire tree boundary
//!
//! ## Diffing
//!
//! Snapshots are diffed over their generic tree projection
//! (`serde_json::Value`). See the [`diff`] module for the round-trip law:
//! `apply(diff(p, n), p) == n`.

pub mod change;
pub mod diff;
pub mod error;
pub mod pointer;
pub mod patch;
pub mod reference;
pub mod registry;
pub mod store;
pub mod types;

pub use change::{ChangeItem, ChangeType, LazyPatch};
pub use diff::{diff, diff_store, updates_to_patch};
pub use error::{CoreError, PatchError};
pub use patch::{OpKind, Patch, PatchOp};
pub use pointer::Pointer;
pub use reference::{CompositeValue, ReferenceShape, StreamReference};
pub use registry::{TypeRegistry, TYPE_FIELD};
pub use store::{EntityStore, EntityUpdate, InstanceCollection, UpdateKind};
pub use types::{Address, StreamId};

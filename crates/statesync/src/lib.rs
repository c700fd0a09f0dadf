//! # Statesync
//!
//! The unified API for statesync - reactive state containers whose
//! revisions replicate between peers as full snapshots and patches.
//!
//! ## Overview
//!
//! Statesync keeps one authoritative copy of an entity store on a host
//! and any number of live mirrors on subscribers:
//!
//! - **ChangeItem**: One revision of a referenced object, carrying a
//!   full value or a lazily computed patch against its predecessor
//! - **SynchronizationStream**: A reactive container serializing all
//!   updates to one object and broadcasting each accepted revision
//! - **Reducers**: Projections from the full store to narrower views
//!   (a collection, one entity), with write-back
//! - **Wire protocol**: Subscribe/event/change-request messages over a
//!   pluggable message bus, with version tracking and resync
//!
//! ## Key invariants
//!
//! - Versions per stream are strictly increasing and gapless.
//! - A patch applies only to the exact revision it was computed
//!   against; a subscriber seeing a gap resyncs with a fresh snapshot.
//! - Equal values produce no traffic.
//! - A change is never echoed back to the peer that caused it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use statesync::core::{Address, EntityStore, StreamReference, TypeRegistry};
//! use statesync::wire::{MemoryHub, StreamClient, StreamHost};
//!
//! async fn example() {
//!     let hub = MemoryHub::new();
//!     let registry = Arc::new(TypeRegistry::new());
//!
//!     let host_bus = Arc::new(hub.endpoint(Address::new("host")).await);
//!     let host = StreamHost::start(host_bus, EntityStore::new(), Arc::clone(&registry))
//!         .await
//!         .unwrap();
//!     tokio::spawn(Arc::clone(&host).run());
//!
//!     let client_bus = Arc::new(hub.endpoint(Address::new("client")).await);
//!     let client = StreamClient::new(
//!         client_bus,
//!         Address::new("host"),
//!         StreamReference::collection("people"),
//!         registry,
//!     );
//!     tokio::spawn(Arc::clone(&client).run());
//!     client.subscribe().await.unwrap();
//! }
//! ```

// Re-export component crates
pub use statesync_core as core;
pub use statesync_reactive as reactive;
pub use statesync_wire as wire;

// Re-export commonly used types for convenience
pub use statesync_core::{
    diff, Address, ChangeItem, ChangeType, EntityStore, EntityUpdate, Patch, PatchOp, Pointer,
    StreamId, StreamReference, TypeRegistry,
};
pub use statesync_reactive::{
    InitializationMode, ReduceManager, Subscription, SynchronizationStream, UpdateOutcome,
};
pub use statesync_wire::{MessageBus, StreamClient, StreamHost, StreamMessage};

//! # Statesync Wire
//!
//! Wire protocol for serving synchronization streams over a message
//! bus: the [`StreamMessage`] vocabulary, the [`MessageBus`]
//! abstraction, and the two protocol endpoints, [`StreamHost`] (owner
//! side) and [`StreamClient`] (subscriber side).
//!
//! ## Message flow
//!
//! ```text
//! Subscriber                          Host
//!   |-------- SubscribeRequest ------->|
//!   |<------- DataChangedEvent (full)--|
//!   |<------- DataChangedEvent (patch)-|        host-side change
//!   |-------- PatchDataChangeRequest ->|        subscriber write
//!   |<------- DataChangedEvent (patch)-|        (fans out to others)
//!   |<------- DeliveryFailure ---------|        only when apply fails
//!   |-------- UnsubscribeRequest ----->|
//! ```
//!
//! Patches are valid only against the exact previous revision; a
//! subscriber that observes a version gap discards the event and
//! re-subscribes for a fresh snapshot. [`digest`] provides blake3 state
//! digests so both sides can verify convergence cheaply.

pub mod bus;
pub mod client;
pub mod codec;
pub mod digest;
pub mod error;
pub mod host;
pub mod messages;

pub use bus::{memory::MemoryBus, memory::MemoryHub, MessageBus};
pub use client::{FailureRecord, StreamClient};
pub use digest::{state_digest, verify_mirror, StateDigest};
pub use error::{Result, WireError};
pub use host::StreamHost;
pub use messages::{
    limits, ChangeContent, EntityKey, EntityRecord, MessageKind, StreamMessage,
};

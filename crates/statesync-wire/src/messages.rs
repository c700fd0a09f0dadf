//! Wire protocol message types.
//!
//! These messages are exchanged between a stream host and its
//! subscribers over a message bus. Every variant carries the
//! `stream_id` that scopes it to one host/subscriber relationship, so
//! a single bus endpoint can multiplex any number of streams.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use statesync_core::{Address, ChangeType, Patch, StreamId, StreamReference};

/// Message size limits.
pub mod limits {
    /// Max ops in a single patch payload.
    pub const MAX_PATCH_OPS: usize = 1000;
    /// Max entity changes (creations + deletions + updates) in one
    /// DataChangeRequest.
    pub const MAX_ENTITY_CHANGES: usize = 100;
    /// Max collection names in a Collections reference.
    pub const MAX_REFERENCE_COLLECTIONS: usize = 100;
    /// Max bytes in a DeliveryFailure reason.
    pub const MAX_FAILURE_REASON: usize = 1024;
}

/// A new or replacement entity body, addressed by collection and id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Collection the entity lives in.
    pub collection: String,
    /// Entity id within the collection.
    pub id: String,
    /// The `$type`-tagged entity tree.
    pub body: Value,
}

/// An entity address without a body, used for deletions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityKey {
    /// Collection the entity lives in.
    pub collection: String,
    /// Entity id within the collection.
    pub id: String,
}

/// Payload of a [`StreamMessage::DataChangedEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChangeContent {
    /// A complete snapshot of the referenced object. An absent tree
    /// means the referenced object no longer exists.
    Full {
        /// The `$type`-tagged tree, if the object exists.
        tree: Option<Value>,
    },
    /// An ordered op list relative to the previous revision.
    Patch {
        /// The ops to apply.
        ops: Patch,
    },
}

/// Fieldless tag naming a message variant, used to correlate a
/// [`StreamMessage::DeliveryFailure`] with what failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    SubscribeRequest,
    UnsubscribeRequest,
    DataChangedEvent,
    DataChangeRequest,
    PatchDataChangeRequest,
    DeliveryFailure,
}

/// Stream protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamMessage {
    /// Ask the host to start (or restart) serving a reference.
    ///
    /// A second request for a live `stream_id` is the subscriber-driven
    /// resync path: the host answers with a fresh full snapshot instead
    /// of an error.
    SubscribeRequest {
        /// Correlation id chosen by the subscriber.
        stream_id: StreamId,
        /// Which slice of state to serve.
        reference: StreamReference,
        /// Where to deliver events.
        subscriber: Address,
    },

    /// Tear down a subscription.
    UnsubscribeRequest {
        /// The subscription to end.
        stream_id: StreamId,
    },

    /// A revision flowing from host to subscriber.
    DataChangedEvent {
        /// The subscription this revision belongs to.
        stream_id: StreamId,
        /// Revision number, strictly increasing per subscription.
        version: u64,
        /// Full, patch, or (never on the wire) no-update.
        change_type: ChangeType,
        /// Snapshot tree or op list.
        content: ChangeContent,
        /// Which peer caused the change.
        changed_by: Address,
    },

    /// Entity-level change request flowing from subscriber to host.
    DataChangeRequest {
        /// The subscription this request belongs to.
        stream_id: StreamId,
        /// The requesting peer.
        changed_by: Address,
        /// Entities to create.
        creations: Vec<EntityRecord>,
        /// Entities to delete.
        deletions: Vec<EntityKey>,
        /// Entities to replace.
        updates: Vec<EntityRecord>,
    },

    /// Patch-level change request flowing from subscriber to host,
    /// expressed in the coordinates of the subscribed reference.
    PatchDataChangeRequest {
        /// The subscription this request belongs to.
        stream_id: StreamId,
        /// The requesting peer.
        changed_by: Address,
        /// The ops to fold into the host state.
        change: Patch,
    },

    /// A request could not be applied; the host state is unchanged.
    DeliveryFailure {
        /// The subscription the failed request belonged to.
        stream_id: StreamId,
        /// Which message kind failed.
        original: MessageKind,
        /// Human-readable description.
        reason: String,
    },
}

impl StreamMessage {
    /// The stream this message is scoped to.
    pub fn stream_id(&self) -> &StreamId {
        match self {
            StreamMessage::SubscribeRequest { stream_id, .. }
            | StreamMessage::UnsubscribeRequest { stream_id }
            | StreamMessage::DataChangedEvent { stream_id, .. }
            | StreamMessage::DataChangeRequest { stream_id, .. }
            | StreamMessage::PatchDataChangeRequest { stream_id, .. }
            | StreamMessage::DeliveryFailure { stream_id, .. } => stream_id,
        }
    }

    /// The fieldless tag for this variant.
    pub fn kind(&self) -> MessageKind {
        match self {
            StreamMessage::SubscribeRequest { .. } => MessageKind::SubscribeRequest,
            StreamMessage::UnsubscribeRequest { .. } => MessageKind::UnsubscribeRequest,
            StreamMessage::DataChangedEvent { .. } => MessageKind::DataChangedEvent,
            StreamMessage::DataChangeRequest { .. } => MessageKind::DataChangeRequest,
            StreamMessage::PatchDataChangeRequest { .. } => MessageKind::PatchDataChangeRequest,
            StreamMessage::DeliveryFailure { .. } => MessageKind::DeliveryFailure,
        }
    }

    /// Check that this message respects size limits.
    pub fn validate_limits(&self) -> Result<(), &'static str> {
        match self {
            StreamMessage::SubscribeRequest { reference, .. } => {
                if let StreamReference::Collections { names } = reference {
                    if names.len() > limits::MAX_REFERENCE_COLLECTIONS {
                        return Err("too many collections in reference");
                    }
                }
            }
            StreamMessage::DataChangedEvent { content, .. } => {
                if let ChangeContent::Patch { ops } = content {
                    if ops.len() > limits::MAX_PATCH_OPS {
                        return Err("too many patch ops");
                    }
                }
            }
            StreamMessage::DataChangeRequest {
                creations,
                deletions,
                updates,
                ..
            } => {
                if creations.len() + deletions.len() + updates.len() > limits::MAX_ENTITY_CHANGES {
                    return Err("too many entity changes");
                }
            }
            StreamMessage::PatchDataChangeRequest { change, .. } => {
                if change.len() > limits::MAX_PATCH_OPS {
                    return Err("too many patch ops");
                }
            }
            StreamMessage::DeliveryFailure { reason, .. } => {
                if reason.len() > limits::MAX_FAILURE_REASON {
                    return Err("failure reason too long");
                }
            }
            StreamMessage::UnsubscribeRequest { .. } => {}
        }
        Ok(())
    }
}

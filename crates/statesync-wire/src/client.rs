//! Subscriber-side protocol endpoint.
//!
//! A [`StreamClient`] keeps a local mirror of one hosted reference.
//! Inbound full snapshots seed or replace the mirror; inbound patches
//! must target exactly the next version. A patch that does not, or
//! that fails to apply, is never guessed at: the client discards it
//! and asks the host for a fresh snapshot.
//!
//! Writes are optimistic: the client folds its own change into the
//! mirror at submit time, which is why the host never echoes a
//! subscriber's change back to it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;

use statesync_core::{Address, ChangeItem, Patch, StreamId, StreamReference, TypeRegistry};
use statesync_reactive::{InitializationMode, ReduceManager, SynchronizationStream};

use crate::bus::MessageBus;
use crate::error::{Result, WireError};
use crate::messages::{ChangeContent, EntityKey, EntityRecord, MessageKind, StreamMessage};

/// A recorded [`StreamMessage::DeliveryFailure`].
#[derive(Debug, Clone)]
pub struct FailureRecord {
    /// Which of our requests failed.
    pub original: MessageKind,
    /// The host's description.
    pub reason: String,
}

/// The subscriber-side endpoint mirroring one hosted reference.
pub struct StreamClient<B: MessageBus> {
    bus: Arc<B>,
    host: Address,
    stream_id: StreamId,
    reference: StreamReference,
    registry: Arc<TypeRegistry>,
    mirror: SynchronizationStream<Value>,
    latest: Mutex<Option<Value>>,
    last_version: AtomicU64,
    primed: AtomicBool,
    failures: Mutex<Vec<FailureRecord>>,
}

impl<B: MessageBus + 'static> StreamClient<B> {
    /// Create a client for one reference served by `host`.
    pub fn new(
        bus: Arc<B>,
        host: Address,
        reference: StreamReference,
        registry: Arc<TypeRegistry>,
    ) -> Arc<Self> {
        let mirror = SynchronizationStream::new(
            host.clone(),
            reference.clone(),
            InitializationMode::Manual,
            Arc::new(ReduceManager::new()),
        );
        Arc::new(Self {
            bus,
            host,
            stream_id: StreamId::random(),
            reference,
            registry,
            mirror,
            latest: Mutex::new(None),
            last_version: AtomicU64::new(0),
            primed: AtomicBool::new(false),
            failures: Mutex::new(Vec::new()),
        })
    }

    /// The correlation id this client subscribes under.
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// The mirrored reference.
    pub fn reference(&self) -> &StreamReference {
        &self.reference
    }

    /// The local reactive mirror. Observers subscribe here.
    pub fn mirror(&self) -> &SynchronizationStream<Value> {
        &self.mirror
    }

    /// Latest mirrored tree, if any revision has arrived.
    pub fn current_tree(&self) -> Option<Value> {
        self.latest.lock().unwrap().clone()
    }

    /// Version of the latest mirrored revision.
    pub fn version(&self) -> u64 {
        self.last_version.load(Ordering::SeqCst)
    }

    /// Delivery failures recorded so far.
    pub fn failures(&self) -> Vec<FailureRecord> {
        self.failures.lock().unwrap().clone()
    }

    fn local_address(&self) -> Address {
        self.bus.local_address()
    }

    /// Ask the host to start serving our reference.
    pub async fn subscribe(&self) -> Result<()> {
        self.bus
            .post(
                &self.host,
                StreamMessage::SubscribeRequest {
                    stream_id: self.stream_id.clone(),
                    reference: self.reference.clone(),
                    subscriber: self.local_address(),
                },
            )
            .await
    }

    /// Request a fresh snapshot for the existing subscription.
    pub async fn resync(&self) -> Result<()> {
        tracing::debug!(stream_id = ?self.stream_id, "requesting resync");
        self.subscribe().await
    }

    /// Tear down the subscription at the host.
    pub async fn unsubscribe(&self) -> Result<()> {
        self.bus
            .post(
                &self.host,
                StreamMessage::UnsubscribeRequest {
                    stream_id: self.stream_id.clone(),
                },
            )
            .await
    }

    /// Process inbound messages until the bus shuts down.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            match self.bus.recv().await {
                Ok((from, message)) => {
                    if let Err(error) = self.handle_message(from, message).await {
                        tracing::warn!(%error, "client failed to handle message");
                    }
                }
                Err(WireError::BusError(_)) => return Ok(()),
                Err(error) => {
                    tracing::warn!(%error, "client discarded undecodable message");
                }
            }
        }
    }

    /// Dispatch one inbound message.
    pub async fn handle_message(&self, _from: Address, message: StreamMessage) -> Result<()> {
        if message.stream_id() != &self.stream_id {
            tracing::trace!(got = ?message.stream_id(), "message for another stream ignored");
            return Ok(());
        }
        match message {
            StreamMessage::DataChangedEvent {
                version,
                content,
                changed_by,
                ..
            } => self.handle_event(version, content, changed_by).await,
            StreamMessage::DeliveryFailure {
                original, reason, ..
            } => {
                tracing::warn!(?original, %reason, "change request rejected by host");
                self.failures.lock().unwrap().push(FailureRecord {
                    original,
                    reason,
                });
                // The optimistic local apply may now be ahead of the
                // host; fall back to a snapshot.
                self.resync().await
            }
            other => {
                tracing::warn!(kind = ?other.kind(), "client ignored unexpected message");
                Ok(())
            }
        }
    }

    async fn handle_event(
        &self,
        version: u64,
        content: ChangeContent,
        changed_by: Address,
    ) -> Result<()> {
        if changed_by == self.local_address() {
            // Already applied at submit time; keep the version in step.
            self.last_version.store(version, Ordering::SeqCst);
            return Ok(());
        }

        match content {
            ChangeContent::Full { tree } => {
                *self.latest.lock().unwrap() = tree.clone();
                self.last_version.store(version, Ordering::SeqCst);
                self.push_mirror(tree, changed_by, version).await
            }
            ChangeContent::Patch { ops } => {
                let expected = self.last_version.load(Ordering::SeqCst) + 1;
                if version != expected {
                    tracing::warn!(version, expected, "version gap, requesting resync");
                    return self.resync().await;
                }
                let base = match self.current_tree() {
                    Some(base) => base,
                    None => {
                        tracing::warn!("patch for an empty mirror, requesting resync");
                        return self.resync().await;
                    }
                };
                match ops.apply(&base) {
                    Ok(next) => {
                        *self.latest.lock().unwrap() = Some(next.clone());
                        self.last_version.store(version, Ordering::SeqCst);
                        self.push_mirror(Some(next), changed_by, version).await
                    }
                    Err(error) => {
                        tracing::warn!(%error, "patch failed to apply, requesting resync");
                        self.resync().await
                    }
                }
            }
        }
    }

    async fn push_mirror(
        &self,
        tree: Option<Value>,
        changed_by: Address,
        version: u64,
    ) -> Result<()> {
        if !self.primed.swap(true, Ordering::SeqCst) {
            self.mirror
                .initialize(ChangeItem::full(
                    self.host.clone(),
                    self.reference.clone(),
                    tree,
                    changed_by,
                    version.max(1),
                ))
                .await?;
            return Ok(());
        }
        self.mirror
            .request_update(move |current| {
                let current = current.ok_or_else(|| "mirror not initialized".to_string())?;
                let item = ChangeItem::compute(current, tree, changed_by).with_version(version);
                Ok(Some(item))
            })
            .await?;
        Ok(())
    }

    /// Submit a patch in the coordinates of the subscribed reference.
    ///
    /// The change is applied to the local mirror immediately and posted
    /// to the host; if the host rejects it a [`FailureRecord`] is
    /// captured and the mirror resyncs.
    pub async fn submit_patch(&self, patch: Patch) -> Result<()> {
        let base = self
            .current_tree()
            .ok_or_else(|| WireError::InvalidMessage("mirror has no value".into()))?;
        let next = patch.apply(&base)?;

        let version = self.last_version.fetch_add(1, Ordering::SeqCst) + 1;
        *self.latest.lock().unwrap() = Some(next.clone());
        self.push_mirror(Some(next), self.local_address(), version)
            .await?;

        self.bus
            .post(
                &self.host,
                StreamMessage::PatchDataChangeRequest {
                    stream_id: self.stream_id.clone(),
                    changed_by: self.local_address(),
                    change: patch,
                },
            )
            .await
    }

    /// Submit entity-level creations, deletions, and updates.
    ///
    /// For store- and collection-shaped references the change is folded
    /// into the mirror optimistically; other shapes post the request
    /// and resync afterwards.
    pub async fn submit_change(
        &self,
        creations: Vec<EntityRecord>,
        deletions: Vec<EntityKey>,
        updates: Vec<EntityRecord>,
    ) -> Result<()> {
        let optimistic = self
            .current_tree()
            .and_then(|base| self.project_entities(&base, &creations, &deletions, &updates));

        self.bus
            .post(
                &self.host,
                StreamMessage::DataChangeRequest {
                    stream_id: self.stream_id.clone(),
                    changed_by: self.local_address(),
                    creations,
                    deletions,
                    updates,
                },
            )
            .await?;

        match optimistic {
            Some(next) => {
                let version = self.last_version.fetch_add(1, Ordering::SeqCst) + 1;
                *self.latest.lock().unwrap() = Some(next.clone());
                self.push_mirror(Some(next), self.local_address(), version)
                    .await
            }
            // Shapes we cannot project locally converge via snapshot.
            None => self.resync().await,
        }
    }

    /// Fold entity ops into the mirror tree for references whose
    /// coordinates we can compute locally. Returns None for other
    /// shapes, or when the ops leave the tree unchanged.
    fn project_entities(
        &self,
        base: &Value,
        creations: &[EntityRecord],
        deletions: &[EntityKey],
        updates: &[EntityRecord],
    ) -> Option<Value> {
        let mut next = base.clone();
        match &self.reference {
            StreamReference::Store => {
                for record in creations.iter().chain(updates) {
                    let collection = self.registry.canonical_collection(&record.collection);
                    let map = next.as_object_mut()?;
                    let entry = map
                        .entry(collection.to_string())
                        .or_insert_with(|| Value::Object(Default::default()));
                    entry
                        .as_object_mut()?
                        .insert(record.id.clone(), record.body.clone());
                }
                for key in deletions {
                    let collection = self.registry.canonical_collection(&key.collection);
                    if let Some(entry) = next.get_mut(collection) {
                        entry.as_object_mut()?.remove(&key.id);
                    }
                }
            }
            StreamReference::Collection { name } => {
                for record in creations.iter().chain(updates) {
                    if self.registry.canonical_collection(&record.collection) != name.as_str() {
                        continue;
                    }
                    next.as_object_mut()?
                        .insert(record.id.clone(), record.body.clone());
                }
                for key in deletions {
                    if self.registry.canonical_collection(&key.collection) != name.as_str() {
                        continue;
                    }
                    next.as_object_mut()?.remove(&key.id);
                }
            }
            _ => return None,
        }
        if &next == base {
            return None;
        }
        Some(next)
    }

    /// Decode an entity from the mirror through the type registry.
    ///
    /// Addressing follows the reference shape: a store mirror indexes
    /// by collection then id, a collection mirror by id.
    pub fn read_instance<T>(&self, collection: &str, id: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + 'static,
    {
        let tree = match self.current_tree() {
            Some(tree) => tree,
            None => return Ok(None),
        };
        let node = match &self.reference {
            StreamReference::Store => {
                let collection = self.registry.canonical_collection(collection);
                tree.get(collection).and_then(|c| c.get(id)).cloned()
            }
            StreamReference::Collection { .. } => tree.get(id).cloned(),
            StreamReference::Instance { .. } => Some(tree),
            _ => None,
        };
        match node {
            Some(node) => Ok(Some(self.registry.decode_typed(&node)?)),
            None => Ok(None),
        }
    }
}

//! Owner-side protocol endpoint.
//!
//! A [`StreamHost`] owns the authoritative [`EntityStore`] stream and
//! serves any number of subscriptions over a [`MessageBus`]. Each
//! subscription gets its own pump task that watches the reduced stream
//! for its reference and turns revisions into wire events: the first
//! emission is a full snapshot, later ones are diffs against the last
//! tree that subscriber was sent. Events caused by the subscriber
//! itself are not echoed back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::task::JoinHandle;

use statesync_core::{
    diff, Address, ChangeItem, ChangeType, EntityUpdate, EntityStore, Patch, StreamId,
    StreamReference, TypeRegistry,
};
use statesync_reactive::{
    store_reducers, InitializationMode, SynchronizationStream, UpdateOutcome,
};

use crate::bus::MessageBus;
use crate::error::{Result, WireError};
use crate::messages::{
    limits, ChangeContent, EntityKey, EntityRecord, MessageKind, StreamMessage,
};

struct Session {
    subscriber: Address,
    reference: StreamReference,
    reduced: SynchronizationStream<Value>,
    /// Latest tree observed by the pump, the base for inbound patches.
    latest_tree: Arc<Mutex<Option<Value>>>,
    pump: JoinHandle<()>,
}

/// The owner-side endpoint serving one entity store over a bus.
pub struct StreamHost<B: MessageBus> {
    bus: Arc<B>,
    stream: SynchronizationStream<EntityStore>,
    registry: Arc<TypeRegistry>,
    sessions: Mutex<HashMap<StreamId, Session>>,
}

impl<B: MessageBus + 'static> StreamHost<B> {
    /// Create the host and seed its authoritative stream.
    pub async fn start(
        bus: Arc<B>,
        initial: EntityStore,
        registry: Arc<TypeRegistry>,
    ) -> Result<Arc<Self>> {
        let owner = bus.local_address();
        let stream = SynchronizationStream::new(
            owner.clone(),
            StreamReference::Store,
            InitializationMode::Manual,
            Arc::new(store_reducers()),
        );
        stream
            .initialize(ChangeItem::full(
                owner.clone(),
                StreamReference::Store,
                Some(initial),
                owner,
                1,
            ))
            .await?;

        Ok(Arc::new(Self {
            bus,
            stream,
            registry,
            sessions: Mutex::new(HashMap::new()),
        }))
    }

    /// The authoritative store stream. Local writers update state here;
    /// every session observes the result.
    pub fn stream(&self) -> &SynchronizationStream<EntityStore> {
        &self.stream
    }

    /// The host's bus address.
    pub fn address(&self) -> Address {
        self.bus.local_address()
    }

    /// Serve inbound messages until the bus shuts down.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            match self.bus.recv().await {
                Ok((from, message)) => {
                    if let Err(error) = self.handle_message(from, message).await {
                        tracing::warn!(%error, "host failed to handle message");
                    }
                }
                Err(WireError::BusError(_)) => return Ok(()),
                Err(error) => {
                    tracing::warn!(%error, "host discarded undecodable message");
                }
            }
        }
    }

    /// Dispatch one inbound message.
    pub async fn handle_message(&self, from: Address, message: StreamMessage) -> Result<()> {
        match message {
            StreamMessage::SubscribeRequest {
                stream_id,
                reference,
                subscriber,
            } => {
                if let Err(error) = self.attach(stream_id.clone(), reference, subscriber) {
                    self.post_failure(&from, stream_id, MessageKind::SubscribeRequest, &error)
                        .await?;
                }
                Ok(())
            }
            StreamMessage::UnsubscribeRequest { stream_id } => {
                self.detach(&stream_id);
                Ok(())
            }
            StreamMessage::PatchDataChangeRequest {
                stream_id,
                changed_by,
                change,
            } => {
                if let Err(error) = self
                    .apply_patch_request(&stream_id, changed_by, change)
                    .await
                {
                    self.post_failure(
                        &from,
                        stream_id,
                        MessageKind::PatchDataChangeRequest,
                        &error,
                    )
                    .await?;
                }
                Ok(())
            }
            StreamMessage::DataChangeRequest {
                stream_id,
                changed_by,
                creations,
                deletions,
                updates,
            } => {
                if let Err(error) = self
                    .apply_change_request(changed_by, creations, deletions, updates)
                    .await
                {
                    self.post_failure(&from, stream_id, MessageKind::DataChangeRequest, &error)
                        .await?;
                }
                Ok(())
            }
            other => {
                tracing::warn!(kind = ?other.kind(), "host ignored unexpected message");
                Ok(())
            }
        }
    }

    /// Tear down every session and dispose the store stream.
    pub fn shutdown(&self) {
        let ids: Vec<StreamId> = self.sessions.lock().unwrap().keys().cloned().collect();
        for id in ids {
            self.detach(&id);
        }
        self.stream.dispose();
    }

    fn attach(
        &self,
        stream_id: StreamId,
        reference: StreamReference,
        subscriber: Address,
    ) -> Result<()> {
        // A repeated subscribe for a live stream id is a resync: the
        // replacement pump opens with a fresh full snapshot.
        self.detach(&stream_id);

        let reduced: SynchronizationStream<Value> = self.stream.reduce(reference.clone())?;
        let mut subscription = reduced.subscribe()?;
        let latest_tree = Arc::new(Mutex::new(None));

        let bus = Arc::clone(&self.bus);
        let pump_id = stream_id.clone();
        let pump_subscriber = subscriber.clone();
        let pump_latest = Arc::clone(&latest_tree);
        let pump = tokio::spawn(async move {
            let mut primed = false;
            let mut last_tree: Option<Value> = None;
            while let Some(item) = subscription.recv().await {
                let tree = item.value().cloned();
                *pump_latest.lock().unwrap() = tree.clone();

                let content = if !primed {
                    ChangeContent::Full { tree: tree.clone() }
                } else {
                    match (&last_tree, &tree) {
                        (Some(prev), Some(next)) => {
                            let ops = diff(prev, next);
                            if ops.is_empty() {
                                last_tree = tree;
                                continue;
                            }
                            ChangeContent::Patch { ops }
                        }
                        (None, None) => {
                            last_tree = tree;
                            continue;
                        }
                        _ => ChangeContent::Full { tree: tree.clone() },
                    }
                };
                let change_type = match &content {
                    ChangeContent::Full { .. } => ChangeType::Full,
                    ChangeContent::Patch { .. } => ChangeType::Patch,
                };

                // Echo avoidance: the originator already holds this
                // revision. The opening snapshot is always sent.
                let suppress = primed && item.changed_by() == &pump_subscriber;
                primed = true;
                last_tree = tree;
                if suppress {
                    continue;
                }

                let event = StreamMessage::DataChangedEvent {
                    stream_id: pump_id.clone(),
                    version: item.version(),
                    change_type,
                    content,
                    changed_by: item.changed_by().clone(),
                };
                if let Err(error) = bus.post(&pump_subscriber, event).await {
                    tracing::warn!(%error, subscriber = %pump_subscriber, "event delivery failed");
                    break;
                }
            }
        });

        self.sessions.lock().unwrap().insert(
            stream_id,
            Session {
                subscriber,
                reference,
                reduced,
                latest_tree,
                pump,
            },
        );
        Ok(())
    }

    fn detach(&self, stream_id: &StreamId) {
        if let Some(session) = self.sessions.lock().unwrap().remove(stream_id) {
            session.pump.abort();
            tracing::debug!(?stream_id, subscriber = %session.subscriber, "session closed");
        }
    }

    async fn apply_patch_request(
        &self,
        stream_id: &StreamId,
        changed_by: Address,
        change: Patch,
    ) -> Result<()> {
        let (reduced, latest, reference) = {
            let sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get(stream_id)
                .ok_or_else(|| WireError::UnknownStream(stream_id.clone()))?;
            (
                session.reduced.clone(),
                Arc::clone(&session.latest_tree),
                session.reference.clone(),
            )
        };

        let base = latest
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| WireError::InvalidMessage("stream has no value".into()))?;
        let next = change.apply(&base)?;

        let item = ChangeItem::full(self.address(), reference, Some(next), changed_by, 0);
        match reduced.request_change(item).await? {
            UpdateOutcome::Failed { reason } => Err(WireError::InvalidMessage(reason)),
            _ => Ok(()),
        }
    }

    async fn apply_change_request(
        &self,
        changed_by: Address,
        creations: Vec<EntityRecord>,
        deletions: Vec<EntityKey>,
        updates: Vec<EntityRecord>,
    ) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let outcome = self
            .stream
            .request_update(move |current| {
                let current = current.ok_or_else(|| "stream not initialized".to_string())?;
                let store = current
                    .value()
                    .ok_or_else(|| "store is absent".to_string())?;

                let mut entity_updates = Vec::new();
                for record in &creations {
                    let body = registry.decode_node(&record.body).map_err(|e| e.to_string())?;
                    let collection = registry.canonical_collection(&record.collection).to_string();
                    entity_updates.push(EntityUpdate::creation(collection, &record.id, body));
                }
                for key in &deletions {
                    let collection = registry.canonical_collection(&key.collection).to_string();
                    // Deleting what is already gone is a no-op.
                    if let Some(old) = store.instance(&collection, &key.id) {
                        entity_updates.push(EntityUpdate::deletion(collection, &key.id, old.clone()));
                    }
                }
                for record in &updates {
                    let body = registry.decode_node(&record.body).map_err(|e| e.to_string())?;
                    let collection = registry.canonical_collection(&record.collection).to_string();
                    match store.instance(&collection, &record.id) {
                        Some(old) => entity_updates.push(EntityUpdate::update(
                            collection,
                            &record.id,
                            old.clone(),
                            body,
                        )),
                        None => {
                            entity_updates.push(EntityUpdate::creation(collection, &record.id, body))
                        }
                    }
                }

                let next = store.apply_updates(&entity_updates);
                Ok(Some(ChangeItem::compute(current, Some(next), changed_by)))
            })
            .await?;

        match outcome {
            UpdateOutcome::Failed { reason } => Err(WireError::InvalidMessage(reason)),
            _ => Ok(()),
        }
    }

    async fn post_failure(
        &self,
        target: &Address,
        stream_id: StreamId,
        original: MessageKind,
        error: &WireError,
    ) -> Result<()> {
        tracing::warn!(%error, ?stream_id, ?original, "request failed");
        let mut reason = error.to_string();
        reason.truncate(limits::MAX_FAILURE_REASON);
        self.bus
            .post(
                target,
                StreamMessage::DeliveryFailure {
                    stream_id,
                    original,
                    reason,
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::{MemoryBus, MemoryHub};
    use serde_json::json;
    use statesync_core::{PatchOp, Pointer};

    fn people_store() -> EntityStore {
        EntityStore::new()
            .with_instance("people", "1", json!({"name": "Ann"}))
            .with_instance("people", "2", json!({"name": "Bob"}))
    }

    async fn harness() -> (Arc<StreamHost<MemoryBus>>, MemoryBus, Address) {
        let hub = MemoryHub::new();
        let host_bus = Arc::new(hub.endpoint(Address::new("host")).await);
        let client_bus = hub.endpoint(Address::new("client")).await;
        let host = StreamHost::start(host_bus, people_store(), Arc::new(TypeRegistry::new()))
            .await
            .unwrap();
        tokio::spawn(Arc::clone(&host).run());
        (host, client_bus, Address::new("host"))
    }

    async fn expect_event(bus: &MemoryBus) -> (u64, ChangeType, ChangeContent) {
        loop {
            let (_, message) = bus.recv().await.unwrap();
            if let StreamMessage::DataChangedEvent {
                version,
                change_type,
                content,
                ..
            } = message
            {
                return (version, change_type, content);
            }
        }
    }

    #[tokio::test]
    async fn test_subscribe_sends_full_snapshot() {
        let (_host, client_bus, host_addr) = harness().await;

        let subscribe = StreamMessage::SubscribeRequest {
            stream_id: StreamId::new("s1"),
            reference: StreamReference::collection("people"),
            subscriber: Address::new("client"),
        };
        client_bus.post(&host_addr, subscribe).await.unwrap();

        let (_, change_type, content) = expect_event(&client_bus).await;
        assert_eq!(change_type, ChangeType::Full);
        match content {
            ChangeContent::Full { tree: Some(tree) } => {
                assert_eq!(tree["1"], json!({"name": "Ann"}));
            }
            other => panic!("expected full content, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_owner_update_fans_out_as_patch() {
        let (host, client_bus, host_addr) = harness().await;

        client_bus
            .post(
                &host_addr,
                StreamMessage::SubscribeRequest {
                    stream_id: StreamId::new("s1"),
                    reference: StreamReference::collection("people"),
                    subscriber: Address::new("client"),
                },
            )
            .await
            .unwrap();
        let (first_version, _, _) = expect_event(&client_bus).await;

        host.stream()
            .request_update(|current| {
                let current = current.unwrap();
                let store = current
                    .value()
                    .unwrap()
                    .with_instance("people", "1", json!({"name": "Anna"}));
                Ok(Some(ChangeItem::compute(
                    current,
                    Some(store),
                    Address::new("host"),
                )))
            })
            .await
            .unwrap();

        let (version, change_type, content) = expect_event(&client_bus).await;
        assert_eq!(version, first_version + 1);
        assert_eq!(change_type, ChangeType::Patch);
        match content {
            ChangeContent::Patch { ops } => {
                assert_eq!(ops.len(), 1);
                assert_eq!(ops.ops()[0].path, Pointer::parse("/1/name").unwrap());
            }
            other => panic!("expected patch content, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_patch_request_updates_store_and_suppresses_echo() {
        let (host, client_bus, host_addr) = harness().await;
        let hub_stream = StreamId::new("s1");

        client_bus
            .post(
                &host_addr,
                StreamMessage::SubscribeRequest {
                    stream_id: hub_stream.clone(),
                    reference: StreamReference::collection("people"),
                    subscriber: Address::new("client"),
                },
            )
            .await
            .unwrap();
        let _ = expect_event(&client_bus).await;

        let patch = Patch::from_ops(vec![PatchOp::replace(
            Pointer::parse("/1/name").unwrap(),
            json!("Anna"),
        )]);
        client_bus
            .post(
                &host_addr,
                StreamMessage::PatchDataChangeRequest {
                    stream_id: hub_stream,
                    changed_by: Address::new("client"),
                    change: patch,
                },
            )
            .await
            .unwrap();

        // The owner store converges on the requested value.
        let mut owner_sub = host.stream().subscribe().unwrap();
        let converged = loop {
            let item = owner_sub.recv().await.unwrap();
            let store = item.value().unwrap().clone();
            if store.instance("people", "1") == Some(&json!({"name": "Anna"})) {
                break item;
            }
        };
        assert_eq!(converged.changed_by(), &Address::new("client"));

        // No echo back to the originator.
        let echoed = client_bus
            .recv_timeout(std::time::Duration::from_millis(50))
            .await
            .unwrap();
        assert!(echoed.is_none(), "originator received its own change: {echoed:?}");
    }

    #[tokio::test]
    async fn test_invalid_patch_yields_delivery_failure() {
        let (host, client_bus, host_addr) = harness().await;
        let stream_id = StreamId::new("s1");

        client_bus
            .post(
                &host_addr,
                StreamMessage::SubscribeRequest {
                    stream_id: stream_id.clone(),
                    reference: StreamReference::collection("people"),
                    subscriber: Address::new("client"),
                },
            )
            .await
            .unwrap();
        let _ = expect_event(&client_bus).await;

        let bad = Patch::from_ops(vec![PatchOp::replace(
            Pointer::parse("/404/name").unwrap(),
            json!("x"),
        )]);
        client_bus
            .post(
                &host_addr,
                StreamMessage::PatchDataChangeRequest {
                    stream_id,
                    changed_by: Address::new("client"),
                    change: bad,
                },
            )
            .await
            .unwrap();

        let (_, message) = client_bus.recv().await.unwrap();
        match message {
            StreamMessage::DeliveryFailure { original, .. } => {
                assert_eq!(original, MessageKind::PatchDataChangeRequest);
            }
            other => panic!("expected DeliveryFailure, got {other:?}"),
        }

        // Owner state unchanged.
        let mut owner_sub = host.stream().subscribe().unwrap();
        let item = owner_sub.recv().await.unwrap();
        assert_eq!(
            item.value().unwrap().instance("people", "1"),
            Some(&json!({"name": "Ann"}))
        );
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_resends_full() {
        let (_host, client_bus, host_addr) = harness().await;
        let stream_id = StreamId::new("s1");

        for _ in 0..2 {
            client_bus
                .post(
                    &host_addr,
                    StreamMessage::SubscribeRequest {
                        stream_id: stream_id.clone(),
                        reference: StreamReference::collection("people"),
                        subscriber: Address::new("client"),
                    },
                )
                .await
                .unwrap();
            let (_, change_type, _) = expect_event(&client_bus).await;
            assert_eq!(change_type, ChangeType::Full);
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_events() {
        let (host, client_bus, host_addr) = harness().await;
        let stream_id = StreamId::new("s1");

        client_bus
            .post(
                &host_addr,
                StreamMessage::SubscribeRequest {
                    stream_id: stream_id.clone(),
                    reference: StreamReference::collection("people"),
                    subscriber: Address::new("client"),
                },
            )
            .await
            .unwrap();
        let _ = expect_event(&client_bus).await;

        client_bus
            .post(&host_addr, StreamMessage::UnsubscribeRequest { stream_id })
            .await
            .unwrap();
        // Give the host time to tear the session down.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        host.stream()
            .request_update(|current| {
                let current = current.unwrap();
                let store = current
                    .value()
                    .unwrap()
                    .with_instance("people", "3", json!({"name": "Cyd"}));
                Ok(Some(ChangeItem::compute(
                    current,
                    Some(store),
                    Address::new("host"),
                )))
            })
            .await
            .unwrap();

        let quiet = client_bus
            .recv_timeout(std::time::Duration::from_millis(50))
            .await
            .unwrap();
        assert!(quiet.is_none(), "unsubscribed client still receives: {quiet:?}");
    }
}

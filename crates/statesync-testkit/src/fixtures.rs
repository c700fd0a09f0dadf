//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: a small people/pets store,
//! a registry that knows its types, and fully wired host/client pairs
//! over an in-memory bus.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use statesync_core::{Address, EntityStore, StreamReference, TypeRegistry};
use statesync_wire::{EntityKey, EntityRecord, MemoryBus, MemoryHub, StreamClient, StreamHost};

/// The entity type used throughout the fixtures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
}

/// A store with two people and one pet.
pub fn people_store() -> EntityStore {
    EntityStore::new()
        .with_instance("people", "1", json!({"name": "Ann"}))
        .with_instance("people", "2", json!({"name": "Bob"}))
        .with_instance("pets", "1", json!({"name": "Rex"}))
}

/// A registry knowing the fixture types, with a legacy alias for the
/// people collection.
pub fn people_registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry.register::<Person>("person");
    registry.alias("persons", "people");
    registry
}

/// Shorthand for an [`EntityRecord`].
pub fn record(collection: &str, id: &str, body: serde_json::Value) -> EntityRecord {
    EntityRecord {
        collection: collection.into(),
        id: id.into(),
        body,
    }
}

/// Shorthand for an [`EntityKey`].
pub fn key(collection: &str, id: &str) -> EntityKey {
    EntityKey {
        collection: collection.into(),
        id: id.into(),
    }
}

/// Install a test subscriber for tracing output. Safe to call from
/// every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A host and its subscribed clients, wired over one memory hub with
/// their message loops running.
pub struct WiredHost {
    pub hub: Arc<MemoryHub>,
    pub host: Arc<StreamHost<MemoryBus>>,
    pub clients: Vec<Arc<StreamClient<MemoryBus>>>,
}

/// Wire a host serving [`people_store`] and `client_count` subscribed
/// clients for `reference`. Every client has received its opening
/// snapshot when this returns.
pub async fn wired_host(reference: StreamReference, client_count: usize) -> WiredHost {
    init_tracing();
    let hub = MemoryHub::new();
    let registry = Arc::new(people_registry());

    let host_bus = Arc::new(hub.endpoint(Address::new("host")).await);
    let host = StreamHost::start(host_bus, people_store(), Arc::clone(&registry))
        .await
        .expect("host start");
    tokio::spawn(Arc::clone(&host).run());

    let mut clients = Vec::with_capacity(client_count);
    for i in 0..client_count {
        let address = Address::new(format!("client-{i}"));
        let bus = Arc::new(hub.endpoint(address).await);
        let client = StreamClient::new(
            bus,
            Address::new("host"),
            reference.clone(),
            Arc::clone(&registry),
        );
        tokio::spawn(Arc::clone(&client).run());
        client.subscribe().await.expect("subscribe");
        client.mirror().wait_initialized().await.expect("snapshot");
        clients.push(client);
    }

    WiredHost { hub, host, clients }
}

/// Convenience for the common one-subscriber case.
pub async fn wired_pair(
    reference: StreamReference,
) -> (Arc<StreamHost<MemoryBus>>, Arc<StreamClient<MemoryBus>>) {
    let wired = wired_host(reference, 1).await;
    let client = wired.clients.into_iter().next().expect("one client");
    (wired.host, client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_people_store_contents() {
        let store = people_store();
        assert_eq!(store.instance("people", "1"), Some(&json!({"name": "Ann"})));
        assert_eq!(store.collection("pets").map(|c| c.len()), Some(1));
    }

    #[test]
    fn test_registry_alias() {
        let registry = people_registry();
        assert_eq!(registry.canonical_collection("persons"), "people");
        assert!(registry.knows_type("person"));
    }

    #[tokio::test]
    async fn test_wired_pair_delivers_snapshot() {
        let (_host, client) = wired_pair(StreamReference::collection("people")).await;
        let tree: Value = client.current_tree().expect("snapshot tree");
        assert_eq!(tree["1"], json!({"name": "Ann"}));
    }
}

//! Entity store: the default generic nested-map representation of
//! domain state.
//!
//! Stores and collections are immutable value types. Every mutator
//! returns a new instance, so diffing an old snapshot against a new one
//! is safe from torn reads without explicit locking.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::CoreError;

/// A typed mapping-of-mappings over arbitrary domain state.
///
/// `BTreeMap` keeps iteration order deterministic, which in turn makes
/// tree projections and state digests deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityStore {
    collections: BTreeMap<String, InstanceCollection>,
}

/// One collection of entities, keyed by a stable unique id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceCollection {
    instances: BTreeMap<String, Value>,
}

impl InstanceCollection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a collection from (id, value) pairs.
    pub fn from_instances(instances: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            instances: instances.into_iter().collect(),
        }
    }

    /// Look up an entity by id.
    pub fn get(&self, id: &str) -> Option<&Value> {
        self.instances.get(id)
    }

    /// Whether the collection holds an entity with this id.
    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Iterate entities in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.instances.iter()
    }

    /// A new collection with this entity inserted or replaced.
    pub fn with(&self, id: impl Into<String>, value: Value) -> Self {
        let mut instances = self.instances.clone();
        instances.insert(id.into(), value);
        Self { instances }
    }

    /// A new collection with this entity removed (no-op if absent).
    pub fn without(&self, id: &str) -> Self {
        let mut instances = self.instances.clone();
        instances.remove(id);
        Self { instances }
    }

    /// Project to the generic tree representation.
    pub fn to_tree(&self) -> Value {
        Value::Object(
            self.instances
                .iter()
                .map(|(id, v)| (id.clone(), v.clone()))
                .collect(),
        )
    }

    /// Rebuild from a tree node. Fails unless the node is an object.
    pub fn from_tree(tree: &Value) -> Result<Self, CoreError> {
        match tree {
            Value::Object(map) => Ok(Self {
                instances: map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            }),
            other => Err(CoreError::MalformedNode {
                expected: "object",
                detail: format!("got {}", node_kind(other)),
            }),
        }
    }
}

impl EntityStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from (name, collection) pairs.
    pub fn from_collections(
        collections: impl IntoIterator<Item = (String, InstanceCollection)>,
    ) -> Self {
        Self {
            collections: collections.into_iter().collect(),
        }
    }

    /// Look up a collection by name.
    pub fn collection(&self, name: &str) -> Option<&InstanceCollection> {
        self.collections.get(name)
    }

    /// Look up a single entity.
    pub fn instance(&self, collection: &str, id: &str) -> Option<&Value> {
        self.collections.get(collection).and_then(|c| c.get(id))
    }

    /// Collection names in sorted order.
    pub fn collection_names(&self) -> impl Iterator<Item = &String> {
        self.collections.keys()
    }

    /// Iterate collections in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &InstanceCollection)> {
        self.collections.iter()
    }

    /// Whether the store holds no collections.
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// A new store with this entity inserted or replaced. The collection
    /// is created if it does not exist yet.
    pub fn with_instance(
        &self,
        collection: impl Into<String>,
        id: impl Into<String>,
        value: Value,
    ) -> Self {
        let collection = collection.into();
        let mut collections = self.collections.clone();
        let updated = collections
            .get(&collection)
            .cloned()
            .unwrap_or_default()
            .with(id, value);
        collections.insert(collection, updated);
        Self { collections }
    }

    /// A new store with this entity removed. Empty collections are kept;
    /// an explicitly empty collection and an absent one diff differently.
    pub fn without_instance(&self, collection: &str, id: &str) -> Self {
        let mut collections = self.collections.clone();
        if let Some(existing) = collections.get(collection) {
            collections.insert(collection.to_string(), existing.without(id));
        }
        Self { collections }
    }

    /// A new store with this collection inserted or replaced.
    pub fn with_collection(
        &self,
        name: impl Into<String>,
        collection: InstanceCollection,
    ) -> Self {
        let mut collections = self.collections.clone();
        collections.insert(name.into(), collection);
        Self { collections }
    }

    /// A new store with this collection removed entirely.
    pub fn without_collection(&self, name: &str) -> Self {
        let mut collections = self.collections.clone();
        collections.remove(name);
        Self { collections }
    }

    /// Apply one entity update, returning the new store.
    pub fn apply_update(&self, update: &EntityUpdate) -> Self {
        match &update.new {
            Some(value) => self.with_instance(&update.collection, &update.id, value.clone()),
            None => self.without_instance(&update.collection, &update.id),
        }
    }

    /// Fold a batch of entity updates, returning the new store.
    pub fn apply_updates<'a>(&self, updates: impl IntoIterator<Item = &'a EntityUpdate>) -> Self {
        updates
            .into_iter()
            .fold(self.clone(), |store, update| store.apply_update(update))
    }

    /// Project to the generic tree representation.
    pub fn to_tree(&self) -> Value {
        Value::Object(
            self.collections
                .iter()
                .map(|(name, c)| (name.clone(), c.to_tree()))
                .collect(),
        )
    }

    /// Rebuild from a tree node. Fails unless the node is an object of
    /// objects.
    pub fn from_tree(tree: &Value) -> Result<Self, CoreError> {
        match tree {
            Value::Object(map) => {
                let mut collections = BTreeMap::new();
                for (name, node) in map {
                    collections.insert(name.clone(), InstanceCollection::from_tree(node)?);
                }
                Ok(Self { collections })
            }
            other => Err(CoreError::MalformedNode {
                expected: "object",
                detail: format!("got {}", node_kind(other)),
            }),
        }
    }
}

/// Kind of an entity update, derived from which sides are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// No old value, new value present.
    Creation,
    /// Old value present, no new value.
    Deletion,
    /// Both sides present.
    Update,
    /// Neither side present. Legal but produces no operations.
    NoOp,
}

/// A domain-level change to one entity: collection, id, old value, new
/// value. The wire layer translates batches of these into patches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    /// Collection name (possibly an alias; canonicalized at diff time).
    pub collection: String,
    /// Entity id.
    pub id: String,
    /// Value before the change, if the entity existed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    /// Value after the change, if the entity still exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
}

impl EntityUpdate {
    /// A creation: no prior value.
    pub fn creation(collection: impl Into<String>, id: impl Into<String>, value: Value) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            old: None,
            new: Some(value),
        }
    }

    /// A deletion: no new value.
    pub fn deletion(collection: impl Into<String>, id: impl Into<String>, old: Value) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            old: Some(old),
            new: None,
        }
    }

    /// A value change.
    pub fn update(
        collection: impl Into<String>,
        id: impl Into<String>,
        old: Value,
        new: Value,
    ) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            old: Some(old),
            new: Some(new),
        }
    }

    /// Classify this update.
    pub fn kind(&self) -> UpdateKind {
        match (&self.old, &self.new) {
            (None, Some(_)) => UpdateKind::Creation,
            (Some(_), None) => UpdateKind::Deletion,
            (Some(_), Some(_)) => UpdateKind::Update,
            (None, None) => UpdateKind::NoOp,
        }
    }
}

fn node_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn people_store() -> EntityStore {
        EntityStore::new().with_instance("people", "1", json!({"name": "Ann"}))
    }

    #[test]
    fn test_with_instance_does_not_mutate_original() {
        let store = people_store();
        let updated = store.with_instance("people", "1", json!({"name": "Anna"}));

        assert_eq!(store.instance("people", "1"), Some(&json!({"name": "Ann"})));
        assert_eq!(
            updated.instance("people", "1"),
            Some(&json!({"name": "Anna"}))
        );
    }

    #[test]
    fn test_without_instance_keeps_empty_collection() {
        let store = people_store().without_instance("people", "1");
        assert!(store.collection("people").is_some());
        assert!(store.collection("people").unwrap().is_empty());
    }

    #[test]
    fn test_apply_updates_in_order() {
        let store = EntityStore::new();
        let updates = vec![
            EntityUpdate::creation("people", "1", json!({"name": "Ann"})),
            EntityUpdate::update("people", "1", json!({"name": "Ann"}), json!({"name": "Anna"})),
            EntityUpdate::creation("people", "2", json!({"name": "Bo"})),
        ];
        let result = store.apply_updates(&updates);

        assert_eq!(
            result.instance("people", "1"),
            Some(&json!({"name": "Anna"}))
        );
        assert_eq!(result.instance("people", "2"), Some(&json!({"name": "Bo"})));
    }

    #[test]
    fn test_tree_roundtrip() {
        let store = people_store().with_instance("tags", "a", json!("alpha"));
        let tree = store.to_tree();
        let back = EntityStore::from_tree(&tree).unwrap();
        assert_eq!(store, back);
    }

    #[test]
    fn test_from_tree_rejects_non_object() {
        assert!(EntityStore::from_tree(&json!([1, 2])).is_err());
        assert!(EntityStore::from_tree(&json!({"people": 3})).is_err());
    }

    #[test]
    fn test_update_kind() {
        assert_eq!(
            EntityUpdate::creation("c", "1", json!(1)).kind(),
            UpdateKind::Creation
        );
        assert_eq!(
            EntityUpdate::deletion("c", "1", json!(1)).kind(),
            UpdateKind::Deletion
        );
        assert_eq!(
            EntityUpdate::update("c", "1", json!(1), json!(2)).kind(),
            UpdateKind::Update
        );
    }
}

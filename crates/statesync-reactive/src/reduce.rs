//! Reducer registry: projections from full state to narrower views,
//! paired with backfeeds that fold view-side changes back in.
//!
//! The registry replaces runtime reflection with an explicit typed
//! mapping: one entry per [`ReferenceShape`], stored as a trait object
//! and resolved (with its reduced type checked) at first use.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use statesync_core::{
    ChangeItem, EntityStore, InstanceCollection, ReferenceShape, StreamReference,
};

use crate::error::ReduceError;

/// A pure projection `T -> R` with its inverse backfeed.
///
/// Reducers hold no hidden state: both directions are functions of
/// their arguments only.
pub trait Reducer<T, R>: Send + Sync {
    /// Project the full state into the reduced view for `reference`.
    /// `None` means the referenced slice is absent.
    fn reduce(&self, state: &T, reference: &StreamReference) -> Option<R>;

    /// Fold a change made to the reduced view back into the full state.
    fn backfeed(
        &self,
        state: &T,
        reference: &StreamReference,
        change: &ChangeItem<R>,
    ) -> Result<T, ReduceError>;
}

/// Adapter turning a pair of closures into a [`Reducer`].
pub struct FnReducer<T, R, F, B> {
    reduce: F,
    backfeed: B,
    _marker: PhantomData<fn(&T) -> Option<R>>,
}

impl<T, R, F, B> FnReducer<T, R, F, B>
where
    F: Fn(&T, &StreamReference) -> Option<R> + Send + Sync,
    B: Fn(&T, &StreamReference, &ChangeItem<R>) -> Result<T, ReduceError> + Send + Sync,
{
    /// Pair a projection closure with its backfeed.
    pub fn new(reduce: F, backfeed: B) -> Self {
        Self {
            reduce,
            backfeed,
            _marker: PhantomData,
        }
    }
}

impl<T, R, F, B> Reducer<T, R> for FnReducer<T, R, F, B>
where
    T: Send + Sync,
    R: Send + Sync,
    F: Fn(&T, &StreamReference) -> Option<R> + Send + Sync,
    B: Fn(&T, &StreamReference, &ChangeItem<R>) -> Result<T, ReduceError> + Send + Sync,
{
    fn reduce(&self, state: &T, reference: &StreamReference) -> Option<R> {
        (self.reduce)(state, reference)
    }

    fn backfeed(
        &self,
        state: &T,
        reference: &StreamReference,
        change: &ChangeItem<R>,
    ) -> Result<T, ReduceError> {
        (self.backfeed)(state, reference, change)
    }
}

/// Registry of reducers for a full-state type `T`, keyed by reference
/// shape.
pub struct ReduceManager<T> {
    entries: RwLock<HashMap<ReferenceShape, Box<dyn Any + Send + Sync>>>,
    _marker: PhantomData<fn(&T)>,
}

impl<T: 'static> ReduceManager<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            _marker: PhantomData,
        }
    }

    /// Register a reducer for a reference shape, replacing any previous
    /// registration for that shape.
    pub fn register<R: 'static>(
        &self,
        shape: ReferenceShape,
        reducer: impl Reducer<T, R> + 'static,
    ) {
        let entry: Arc<dyn Reducer<T, R>> = Arc::new(reducer);
        self.entries
            .write()
            .unwrap()
            .insert(shape, Box::new(entry));
    }

    /// Register a closure pair for a reference shape.
    pub fn register_fn<R: 'static>(
        &self,
        shape: ReferenceShape,
        reduce: impl Fn(&T, &StreamReference) -> Option<R> + Send + Sync + 'static,
        backfeed: impl Fn(&T, &StreamReference, &ChangeItem<R>) -> Result<T, ReduceError>
            + Send
            + Sync
            + 'static,
    ) where
        T: Send + Sync,
        R: Send + Sync,
    {
        self.register(shape, FnReducer::new(reduce, backfeed));
    }

    /// Resolve the reducer for a shape.
    ///
    /// Fails with [`ReduceError::MissingReducer`] when nothing is
    /// registered for the shape, or when the registration's reduced
    /// type differs from `R` (a configuration mistake, surfaced at the
    /// first request rather than swallowed).
    pub fn resolve<R: 'static>(
        &self,
        shape: ReferenceShape,
    ) -> Result<Arc<dyn Reducer<T, R>>, ReduceError> {
        self.entries
            .read()
            .unwrap()
            .get(&shape)
            .and_then(|entry| entry.downcast_ref::<Arc<dyn Reducer<T, R>>>())
            .cloned()
            .ok_or(ReduceError::MissingReducer { shape })
    }

    /// Whether a reducer is registered for this shape (type unchecked).
    pub fn has_shape(&self, shape: ReferenceShape) -> bool {
        self.entries.read().unwrap().contains_key(&shape)
    }
}

impl<T: 'static> Default for ReduceManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ReduceManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shapes: Vec<ReferenceShape> =
            self.entries.read().unwrap().keys().copied().collect();
        f.debug_struct("ReduceManager").field("shapes", &shapes).finish()
    }
}

/// The built-in reducers over [`EntityStore`], all projecting into the
/// generic tree representation:
///
/// - `Store` — the whole store as a tree
/// - `Collection` — one collection's instance map
/// - `Instance` — a single entity (absent entity reduces to `None`)
/// - `Collections` — an object holding the named collections
///
/// Each comes with a backfeed folding the tree-level change back into
/// the store. Composite references are application-defined and have no
/// built-in.
pub fn store_reducers() -> ReduceManager<EntityStore> {
    let manager: ReduceManager<EntityStore> = ReduceManager::new();

    manager.register_fn::<Value>(
        ReferenceShape::Store,
        |store, _| Some(store.to_tree()),
        |_, _, change| {
            let tree = change
                .value()
                .ok_or_else(|| ReduceError::Backfeed("store change carries no value".into()))?;
            EntityStore::from_tree(tree).map_err(|e| ReduceError::Backfeed(e.to_string()))
        },
    );

    manager.register_fn::<Value>(
        ReferenceShape::Collection,
        |store, reference| match reference {
            StreamReference::Collection { name } => {
                store.collection(name).map(InstanceCollection::to_tree)
            }
            _ => None,
        },
        |store, reference, change| {
            let StreamReference::Collection { name } = reference else {
                return Err(ReduceError::Backfeed(format!(
                    "collection reducer fed a {reference} reference"
                )));
            };
            match change.value() {
                Some(tree) => {
                    let collection = InstanceCollection::from_tree(tree)
                        .map_err(|e| ReduceError::Backfeed(e.to_string()))?;
                    Ok(store.with_collection(name.clone(), collection))
                }
                None => Ok(store.without_collection(name)),
            }
        },
    );

    manager.register_fn::<Value>(
        ReferenceShape::Instance,
        |store, reference| match reference {
            StreamReference::Instance { collection, id } => {
                store.instance(collection, id).cloned()
            }
            _ => None,
        },
        |store, reference, change| {
            let StreamReference::Instance { collection, id } = reference else {
                return Err(ReduceError::Backfeed(format!(
                    "instance reducer fed a {reference} reference"
                )));
            };
            match change.value() {
                Some(value) => Ok(store.with_instance(collection.clone(), id.clone(), value.clone())),
                None => Ok(store.without_instance(collection, id)),
            }
        },
    );

    manager.register_fn::<Value>(
        ReferenceShape::Collections,
        |store, reference| match reference {
            StreamReference::Collections { names } => {
                let mut map = serde_json::Map::new();
                for name in names {
                    if let Some(collection) = store.collection(name) {
                        map.insert(name.clone(), collection.to_tree());
                    }
                }
                Some(Value::Object(map))
            }
            _ => None,
        },
        |store, reference, change| {
            let StreamReference::Collections { names } = reference else {
                return Err(ReduceError::Backfeed(format!(
                    "collections reducer fed a {reference} reference"
                )));
            };
            let tree = change
                .value()
                .and_then(Value::as_object)
                .ok_or_else(|| ReduceError::Backfeed("collections change is not an object".into()))?;
            let mut next = store.clone();
            for name in names {
                match tree.get(name) {
                    Some(node) => {
                        let collection = InstanceCollection::from_tree(node)
                            .map_err(|e| ReduceError::Backfeed(e.to_string()))?;
                        next = next.with_collection(name.clone(), collection);
                    }
                    None => next = next.without_collection(name),
                }
            }
            Ok(next)
        },
    );

    manager
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use statesync_core::Address;

    fn people_store() -> EntityStore {
        EntityStore::new()
            .with_instance("people", "1", json!({"name": "Ann"}))
            .with_instance("pets", "9", json!({"name": "Rex"}))
    }

    fn tree_change(reference: StreamReference, value: Option<Value>) -> ChangeItem<Value> {
        ChangeItem::full(
            Address::new("owner"),
            reference,
            value,
            Address::new("client"),
            1,
        )
    }

    #[test]
    fn test_missing_reducer_surfaces_at_resolution() {
        let manager: ReduceManager<EntityStore> = ReduceManager::new();
        let err = manager.resolve::<Value>(ReferenceShape::Collection).err().unwrap();
        assert!(matches!(err, ReduceError::MissingReducer { .. }));
    }

    #[test]
    fn test_wrong_reduced_type_is_missing_reducer() {
        let manager = store_reducers();
        // Registered as Value, requested as String.
        assert!(manager.resolve::<String>(ReferenceShape::Store).is_err());
        assert!(manager.resolve::<Value>(ReferenceShape::Store).is_ok());
    }

    #[test]
    fn test_collection_reducer_roundtrip() {
        let manager = store_reducers();
        let reducer = manager.resolve::<Value>(ReferenceShape::Collection).unwrap();
        let store = people_store();
        let reference = StreamReference::collection("people");

        let view = reducer.reduce(&store, &reference).unwrap();
        assert_eq!(view, json!({"1": {"name": "Ann"}}));

        let change = tree_change(reference.clone(), Some(json!({"1": {"name": "Anna"}})));
        let next = reducer.backfeed(&store, &reference, &change).unwrap();
        assert_eq!(next.instance("people", "1"), Some(&json!({"name": "Anna"})));
        // Untouched collections survive the backfeed.
        assert_eq!(next.instance("pets", "9"), Some(&json!({"name": "Rex"})));
    }

    #[test]
    fn test_instance_reducer_absent_is_none() {
        let manager = store_reducers();
        let reducer = manager.resolve::<Value>(ReferenceShape::Instance).unwrap();
        let store = people_store();

        let reference = StreamReference::instance("people", "404");
        assert!(reducer.reduce(&store, &reference).is_none());

        let reference = StreamReference::instance("people", "1");
        assert_eq!(
            reducer.reduce(&store, &reference),
            Some(json!({"name": "Ann"}))
        );
    }

    #[test]
    fn test_instance_backfeed_deletion() {
        let manager = store_reducers();
        let reducer = manager.resolve::<Value>(ReferenceShape::Instance).unwrap();
        let store = people_store();
        let reference = StreamReference::instance("people", "1");

        let change = tree_change(reference.clone(), None);
        let next = reducer.backfeed(&store, &reference, &change).unwrap();
        assert!(next.instance("people", "1").is_none());
    }

    #[test]
    fn test_collections_reducer() {
        let manager = store_reducers();
        let reducer = manager.resolve::<Value>(ReferenceShape::Collections).unwrap();
        let store = people_store();
        let reference = StreamReference::Collections {
            names: vec!["people".into(), "pets".into()],
        };

        let view = reducer.reduce(&store, &reference).unwrap();
        assert_eq!(
            view,
            json!({"people": {"1": {"name": "Ann"}}, "pets": {"9": {"name": "Rex"}}})
        );
    }

    #[test]
    fn test_store_backfeed_rejects_malformed_tree() {
        let manager = store_reducers();
        let reducer = manager.resolve::<Value>(ReferenceShape::Store).unwrap();
        let store = people_store();
        let change = tree_change(StreamReference::Store, Some(json!([1, 2, 3])));
        assert!(reducer
            .backfeed(&store, &StreamReference::Store, &change)
            .is_err());
    }
}

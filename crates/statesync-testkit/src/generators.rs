//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::{Map, Value};

use statesync_core::EntityStore;

/// Generate a scalar JSON value.
pub fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
    ]
}

/// Generate an arbitrary JSON tree, a few levels deep.
pub fn tree() -> impl Strategy<Value = Value> {
    scalar().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(|entries| {
                Value::Object(entries.into_iter().collect::<Map<_, _>>())
            }),
        ]
    })
}

/// Generate a JSON object (the shape entity bodies take).
pub fn object_tree() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,6}", tree(), 0..4)
        .prop_map(|entries| Value::Object(entries.into_iter().collect::<Map<_, _>>()))
}

/// Generate an entity id.
pub fn entity_id() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,8}".prop_map(String::from)
}

/// Generate a collection name.
pub fn collection_name() -> impl Strategy<Value = String> {
    "[a-z]{1,8}".prop_map(String::from)
}

/// Generate an entity store with a few collections of a few entities.
pub fn entity_store() -> impl Strategy<Value = EntityStore> {
    prop::collection::btree_map(
        collection_name(),
        prop::collection::btree_map(entity_id(), object_tree(), 0..4),
        0..3,
    )
    .prop_map(|collections| {
        collections
            .into_iter()
            .fold(EntityStore::new(), |store, (name, instances)| {
                instances
                    .into_iter()
                    .fold(store, |store, (id, body)| store.with_instance(&name, id, body))
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use statesync_core::{diff, diff_store};

    proptest! {
        #[test]
        fn prop_diff_apply_roundtrip(old in tree(), new in tree()) {
            let patch = diff(&old, &new);
            prop_assert_eq!(patch.apply(&old).unwrap(), new);
        }

        #[test]
        fn prop_diff_identity_is_empty(tree in tree()) {
            prop_assert!(diff(&tree, &tree).is_empty());
        }

        #[test]
        fn prop_store_diff_roundtrip(old in entity_store(), new in entity_store()) {
            let patch = diff_store(&old, &new);
            prop_assert_eq!(patch.apply(&old.to_tree()).unwrap(), new.to_tree());
        }
    }
}

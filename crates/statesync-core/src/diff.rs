//! Structural diff between tree snapshots.
//!
//! `diff` produces the minimal patch under a simple recursive strategy:
//! objects are diffed by key, arrays per index with trailing adds or
//! removes, and everything else becomes a `replace`. The defining law,
//! exercised by property tests, is `apply(diff(p, n), p) == n`.

use serde_json::Value;

use crate::patch::{Patch, PatchOp};
use crate::pointer::Pointer;
use crate::registry::TypeRegistry;
use crate::store::{EntityStore, EntityUpdate, UpdateKind};

/// Compute the patch transforming `old` into `new`.
///
/// Equal snapshots produce an empty patch.
pub fn diff(old: &Value, new: &Value) -> Patch {
    let mut patch = Patch::empty();
    diff_at(&Pointer::root(), old, new, &mut patch);
    patch
}

fn diff_at(path: &Pointer, old: &Value, new: &Value, patch: &mut Patch) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    patch.push(PatchOp::remove(path.child(key.clone())));
                }
            }
            for (key, new_value) in new_map {
                match old_map.get(key) {
                    Some(old_value) => diff_at(&path.child(key.clone()), old_value, new_value, patch),
                    None => patch.push(PatchOp::add(path.child(key.clone()), new_value.clone())),
                }
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            let shared = old_items.len().min(new_items.len());
            for index in 0..shared {
                diff_at(
                    &path.child(index.to_string()),
                    &old_items[index],
                    &new_items[index],
                    patch,
                );
            }
            // Growth: explicit index adds.
            for (index, item) in new_items.iter().enumerate().skip(shared) {
                patch.push(PatchOp::add(path.child(index.to_string()), item.clone()));
            }
            // Shrinkage: remove from the end so indices stay valid.
            for index in (shared..old_items.len()).rev() {
                patch.push(PatchOp::remove(path.child(index.to_string())));
            }
        }
        _ => patch.push(PatchOp::replace(path.clone(), new.clone())),
    }
}

/// Diff two entity stores per collection, then per entity, so every
/// operation is scoped at `/collection/id` or below.
pub fn diff_store(old: &EntityStore, new: &EntityStore) -> Patch {
    diff(&old.to_tree(), &new.to_tree())
}

/// Translate a batch of domain-level entity updates into one patch.
///
/// Updates with the same `(collection, id)` key collapse into a single
/// operation using the first old value and the last new value observed
/// in the batch. Collection names are canonicalized through the
/// registry so patches apply across naming conventions.
pub fn updates_to_patch(updates: &[EntityUpdate], registry: &TypeRegistry) -> Patch {
    // Collapse while preserving first-seen order of keys.
    let mut order: Vec<(String, String)> = Vec::new();
    let mut collapsed: std::collections::HashMap<(String, String), EntityUpdate> =
        std::collections::HashMap::new();

    for update in updates {
        let collection = registry.canonical_collection(&update.collection).to_string();
        let key = (collection.clone(), update.id.clone());
        match collapsed.get_mut(&key) {
            Some(existing) => {
                existing.new = update.new.clone();
            }
            None => {
                order.push(key.clone());
                collapsed.insert(
                    key,
                    EntityUpdate {
                        collection,
                        id: update.id.clone(),
                        old: update.old.clone(),
                        new: update.new.clone(),
                    },
                );
            }
        }
    }

    let mut patch = Patch::empty();
    for key in &order {
        let update = &collapsed[key];
        let entity_path = Pointer::from_segments([update.collection.as_str(), update.id.as_str()]);
        match update.kind() {
            UpdateKind::Creation => {
                patch.push(PatchOp::add(
                    entity_path,
                    update.new.clone().unwrap_or(Value::Null),
                ));
            }
            UpdateKind::Deletion => {
                patch.push(PatchOp::remove(entity_path));
            }
            UpdateKind::Update => {
                let old = update.old.as_ref().unwrap_or(&Value::Null);
                let new = update.new.as_ref().unwrap_or(&Value::Null);
                let nested = diff(old, new).prefixed(&entity_path);
                for op in nested.ops() {
                    patch.push(op.clone());
                }
            }
            UpdateKind::NoOp => {}
        }
    }
    patch
}

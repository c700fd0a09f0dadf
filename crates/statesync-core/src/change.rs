//! Change items: immutable revision records of a stream's value.
//!
//! A [`ChangeItem`] records one state transition: who changed it, which
//! revision it produced, whether the wire needs a full snapshot or a
//! patch, and the patch itself, computed lazily so messages nobody
//! inspects never pay for a diff.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::diff::diff;
use crate::patch::Patch;
use crate::reference::StreamReference;
use crate::types::Address;

/// How a revision relates to its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeType {
    /// No predecessor is assumed; the entire value is authoritative.
    Full,
    /// The patch, applied to the predecessor, yields the value.
    Patch,
    /// Semantically unchanged; no wire traffic is required.
    NoUpdate,
}

type PatchThunk = Box<dyn Fn() -> Option<Patch> + Send + Sync>;

/// A memoized, at-most-once patch computation shared across clones.
#[derive(Clone)]
pub struct LazyPatch {
    inner: Arc<LazyPatchInner>,
}

struct LazyPatchInner {
    cell: OnceLock<Option<Patch>>,
    thunk: Option<PatchThunk>,
}

impl LazyPatch {
    /// No patch, and none will be computed.
    pub fn none() -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(None);
        Self {
            inner: Arc::new(LazyPatchInner { cell, thunk: None }),
        }
    }

    /// An already-computed patch.
    pub fn ready(patch: Patch) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Some(patch));
        Self {
            inner: Arc::new(LazyPatchInner { cell, thunk: None }),
        }
    }

    /// A deferred computation, evaluated at most once on first access.
    pub fn deferred(thunk: impl Fn() -> Option<Patch> + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(LazyPatchInner {
                cell: OnceLock::new(),
                thunk: Some(Box::new(thunk)),
            }),
        }
    }

    /// Force the computation and return the patch, if any.
    pub fn get(&self) -> Option<&Patch> {
        self.inner
            .cell
            .get_or_init(|| self.inner.thunk.as_ref().and_then(|t| t()))
            .as_ref()
    }

    /// Whether the patch has been computed yet (does not force it).
    pub fn is_forced(&self) -> bool {
        self.inner.cell.get().is_some()
    }
}

impl fmt::Debug for LazyPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.cell.get() {
            Some(Some(patch)) => write!(f, "LazyPatch({} ops)", patch.len()),
            Some(None) => write!(f, "LazyPatch(none)"),
            None => write!(f, "LazyPatch(deferred)"),
        }
    }
}

/// One immutable revision of a stream's value.
#[derive(Clone)]
pub struct ChangeItem<T> {
    owner: Address,
    reference: StreamReference,
    value: Option<T>,
    changed_by: Address,
    change_type: ChangeType,
    patch: LazyPatch,
    version: u64,
}

impl<T> ChangeItem<T> {
    /// An explicit full revision. `value: None` represents "the whole
    /// object is gone", which always ships as a full refresh since a
    /// patch cannot express root deletion unambiguously.
    pub fn full(
        owner: Address,
        reference: StreamReference,
        value: Option<T>,
        changed_by: Address,
        version: u64,
    ) -> Self {
        Self {
            owner,
            reference,
            value,
            changed_by,
            change_type: ChangeType::Full,
            patch: LazyPatch::none(),
            version,
        }
    }

    /// A revision that changed nothing. Carries the predecessor's value
    /// and version so observers holding it stay current, but
    /// [`requires_broadcast`](Self::requires_broadcast) is false.
    pub fn no_update(
        owner: Address,
        reference: StreamReference,
        value: Option<T>,
        changed_by: Address,
        version: u64,
    ) -> Self {
        Self {
            owner,
            reference,
            value,
            changed_by,
            change_type: ChangeType::NoUpdate,
            patch: LazyPatch::none(),
            version,
        }
    }

    /// The authoritative side of this stream.
    pub fn owner(&self) -> &Address {
        &self.owner
    }

    /// Which slice of state this revision is about.
    pub fn reference(&self) -> &StreamReference {
        &self.reference
    }

    /// The value at this revision, if present.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Consume the revision, taking ownership of its value.
    pub fn into_value(self) -> Option<T> {
        self.value
    }

    /// Who produced this revision.
    pub fn changed_by(&self) -> &Address {
        &self.changed_by
    }

    /// Relation to the predecessor.
    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    /// Monotonically increasing revision number.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether observers and the wire need to see this revision.
    pub fn requires_broadcast(&self) -> bool {
        self.change_type != ChangeType::NoUpdate
    }

    /// Force and return the patch relative to the predecessor, if this
    /// is a patch revision.
    pub fn patch(&self) -> Option<&Patch> {
        self.patch.get()
    }

    /// The same revision renumbered. Streams own version assignment, so
    /// an update function's candidate item is renumbered on acceptance.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// The same revision re-attributed to a different author.
    pub fn with_changed_by(mut self, changed_by: Address) -> Self {
        self.changed_by = changed_by;
        self
    }
}

impl<T> ChangeItem<T>
where
    T: Serialize + PartialEq + Clone + Send + Sync + 'static,
{
    /// Decide the change type for a candidate next value against its
    /// predecessor and build the revision record.
    ///
    /// - both absent: `NoUpdate` (version unchanged)
    /// - value disappeared: `Full` with absent value
    /// - value appeared: `Full`
    /// - equal values: `NoUpdate` (version unchanged)
    /// - otherwise: `Patch`, diffed lazily over the tree projections
    pub fn compute(prev: &ChangeItem<T>, next: Option<T>, changed_by: Address) -> ChangeItem<T> {
        let owner = prev.owner.clone();
        let reference = prev.reference.clone();

        match (&prev.value, next) {
            (None, None) => ChangeItem {
                owner,
                reference,
                value: None,
                changed_by,
                change_type: ChangeType::NoUpdate,
                patch: LazyPatch::none(),
                version: prev.version,
            },
            (Some(_), None) => ChangeItem {
                owner,
                reference,
                value: None,
                changed_by,
                change_type: ChangeType::Full,
                patch: LazyPatch::none(),
                version: prev.version + 1,
            },
            (None, Some(next)) => ChangeItem {
                owner,
                reference,
                value: Some(next),
                changed_by,
                change_type: ChangeType::Full,
                patch: LazyPatch::none(),
                version: prev.version + 1,
            },
            (Some(prev_value), Some(next)) if *prev_value == next => ChangeItem {
                owner,
                reference,
                value: Some(next),
                changed_by,
                change_type: ChangeType::NoUpdate,
                patch: LazyPatch::none(),
                version: prev.version,
            },
            (Some(prev_value), Some(next)) => {
                let old = prev_value.clone();
                let new = next.clone();
                let patch = LazyPatch::deferred(move || {
                    let old_tree = serde_json::to_value(&old).ok()?;
                    let new_tree = serde_json::to_value(&new).ok()?;
                    Some(diff(&old_tree, &new_tree))
                });
                ChangeItem {
                    owner,
                    reference,
                    value: Some(next),
                    changed_by,
                    change_type: ChangeType::Patch,
                    patch,
                    version: prev.version + 1,
                }
            }
        }
    }
}

impl<T: Serialize> ChangeItem<T> {
    /// Project the value to its generic tree representation.
    pub fn tree(&self) -> Option<Value> {
        self.value
            .as_ref()
            .and_then(|v| serde_json::to_value(v).ok())
    }
}

impl<T: fmt::Debug> fmt::Debug for ChangeItem<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeItem")
            .field("reference", &self.reference)
            .field("change_type", &self.change_type)
            .field("version", &self.version)
            .field("changed_by", &self.changed_by)
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn seed(store: EntityStore) -> ChangeItem<EntityStore> {
        ChangeItem::full(
            Address::new("owner"),
            StreamReference::Store,
            Some(store),
            Address::new("owner"),
            1,
        )
    }

    #[test]
    fn test_equal_values_are_no_update() {
        let store = EntityStore::new().with_instance("people", "1", json!({"name": "Ann"}));
        let prev = seed(store.clone());
        let next = ChangeItem::compute(&prev, Some(store), Address::new("owner"));

        assert_eq!(next.change_type(), ChangeType::NoUpdate);
        assert_eq!(next.version(), prev.version());
        assert!(!next.requires_broadcast());
        assert!(next.patch().is_none());
    }

    #[test]
    fn test_changed_value_is_patch_with_lazy_diff() {
        let store = EntityStore::new().with_instance("people", "1", json!({"name": "Ann"}));
        let prev = seed(store.clone());
        let updated = store.with_instance("people", "1", json!({"name": "Anna"}));
        let next = ChangeItem::compute(&prev, Some(updated), Address::new("owner"));

        assert_eq!(next.change_type(), ChangeType::Patch);
        assert_eq!(next.version(), 2);

        let patch = next.patch().expect("patch revision has a patch");
        assert_eq!(patch.len(), 1);
        assert_eq!(patch.ops()[0].path.to_string(), "/people/1/name");
    }

    #[test]
    fn test_patch_applied_to_predecessor_yields_value() {
        let store = EntityStore::new().with_instance("people", "1", json!({"name": "Ann"}));
        let prev = seed(store.clone());
        let updated = store
            .with_instance("people", "1", json!({"name": "Anna"}))
            .with_instance("people", "2", json!({"name": "Bo"}));
        let next = ChangeItem::compute(&prev, Some(updated.clone()), Address::new("owner"));

        let patched = next.patch().unwrap().apply(&store.to_tree()).unwrap();
        assert_eq!(patched, updated.to_tree());
    }

    #[test]
    fn test_value_disappearing_is_full_with_absent_value() {
        let store = EntityStore::new().with_instance("people", "1", json!({"name": "Ann"}));
        let prev = seed(store);
        let next = ChangeItem::compute(&prev, None, Address::new("owner"));

        assert_eq!(next.change_type(), ChangeType::Full);
        assert!(next.value().is_none());
        assert_eq!(next.version(), 2);
    }

    #[test]
    fn test_both_absent_is_no_update() {
        let prev: ChangeItem<EntityStore> = ChangeItem::full(
            Address::new("owner"),
            StreamReference::Store,
            None,
            Address::new("owner"),
            1,
        );
        let next = ChangeItem::compute(&prev, None, Address::new("owner"));
        assert_eq!(next.change_type(), ChangeType::NoUpdate);
    }

    #[test]
    fn test_lazy_patch_evaluated_at_most_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let lazy = LazyPatch::deferred(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(Patch::empty())
        });

        assert!(!lazy.is_forced());
        let clone = lazy.clone();
        let _ = lazy.get();
        let _ = clone.get();
        let _ = lazy.get();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clone.is_forced());
    }
}

//! Stream references: structural descriptors of which slice of state a
//! stream tracks.
//!
//! References form a small closed hierarchy. Structural equality is what
//! makes two requests for "the same thing" resolve to one shared stream,
//! so every variant derives `Eq` and `Hash`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Descriptor of a slice of synchronized state.
///
/// Internally tagged as `type` on the wire; `kind` is taken by the
/// `Composite` payload discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamReference {
    /// The whole entity store.
    Store,

    /// One named collection inside the store.
    Collection {
        /// Collection name (canonicalized through the type registry
        /// before it appears in patch paths).
        name: String,
    },

    /// One entity, addressed by collection and id.
    Instance {
        /// Collection name.
        collection: String,
        /// Entity id, stable and unique within its collection.
        id: String,
    },

    /// A set of named collections (collection-of-collections view).
    Collections {
        /// The collection names, in request order.
        names: Vec<String>,
    },

    /// Application-defined composite reference.
    ///
    /// `value` is an opaque tree; equality and hashing go through its
    /// canonical JSON text since `serde_json::Value` is not `Hash`.
    Composite {
        /// Application-chosen discriminator for the composite kind.
        kind: String,
        /// Opaque structural payload.
        #[serde(with = "composite_value")]
        value: CompositeValue,
    },
}

/// Wrapper storing a composite payload alongside its canonical text,
/// so `Eq`/`Hash` stay structural and cheap.
#[derive(Debug, Clone)]
pub struct CompositeValue {
    value: Value,
    canonical: String,
}

impl CompositeValue {
    /// Wrap a tree value.
    pub fn new(value: Value) -> Self {
        // Default serde_json maps are BTree-backed, so this is canonical.
        let canonical = value.to_string();
        Self { value, canonical }
    }

    /// The underlying tree.
    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl PartialEq for CompositeValue {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for CompositeValue {}

impl std::hash::Hash for CompositeValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

mod composite_value {
    use super::CompositeValue;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(cv: &CompositeValue, s: S) -> Result<S::Ok, S::Error> {
        cv.value().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<CompositeValue, D::Error> {
        Ok(CompositeValue::new(Value::deserialize(d)?))
    }
}

/// The runtime shape of a reference, used as the reducer registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceShape {
    /// Whole-store reference.
    Store,
    /// Single collection.
    Collection,
    /// Entity by id.
    Instance,
    /// Collection-of-collections.
    Collections,
    /// Application-defined composite.
    Composite,
}

impl StreamReference {
    /// The shape tag of this reference.
    pub fn shape(&self) -> ReferenceShape {
        match self {
            StreamReference::Store => ReferenceShape::Store,
            StreamReference::Collection { .. } => ReferenceShape::Collection,
            StreamReference::Instance { .. } => ReferenceShape::Instance,
            StreamReference::Collections { .. } => ReferenceShape::Collections,
            StreamReference::Composite { .. } => ReferenceShape::Composite,
        }
    }

    /// Convenience constructor for a collection reference.
    pub fn collection(name: impl Into<String>) -> Self {
        StreamReference::Collection { name: name.into() }
    }

    /// Convenience constructor for an entity reference.
    pub fn instance(collection: impl Into<String>, id: impl Into<String>) -> Self {
        StreamReference::Instance {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Convenience constructor for a composite reference.
    pub fn composite(kind: impl Into<String>, value: Value) -> Self {
        StreamReference::Composite {
            kind: kind.into(),
            value: CompositeValue::new(value),
        }
    }
}

impl fmt::Display for StreamReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamReference::Store => write!(f, "store"),
            StreamReference::Collection { name } => write!(f, "collection:{}", name),
            StreamReference::Instance { collection, id } => {
                write!(f, "instance:{}/{}", collection, id)
            }
            StreamReference::Collections { names } => {
                write!(f, "collections:{}", names.join(","))
            }
            StreamReference::Composite { kind, .. } => write!(f, "composite:{}", kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structural_equality() {
        assert_eq!(
            StreamReference::instance("people", "1"),
            StreamReference::instance("people", "1")
        );
        assert_ne!(
            StreamReference::instance("people", "1"),
            StreamReference::instance("people", "2")
        );
        assert_eq!(StreamReference::Store, StreamReference::Store);
    }

    #[test]
    fn test_composite_equality_is_structural() {
        let a = StreamReference::composite("view", json!({"a": 1, "b": 2}));
        let b = StreamReference::composite("view", json!({"b": 2, "a": 1}));
        // serde_json object keys are sorted, so key order does not matter.
        assert_eq!(a, b);

        let c = StreamReference::composite("view", json!({"a": 2}));
        assert_ne!(a, c);
    }

    #[test]
    fn test_shape() {
        assert_eq!(StreamReference::Store.shape(), ReferenceShape::Store);
        assert_eq!(
            StreamReference::collection("people").shape(),
            ReferenceShape::Collection
        );
        assert_eq!(
            StreamReference::instance("people", "1").shape(),
            ReferenceShape::Instance
        );
    }

    #[test]
    fn test_serde_roundtrip() {
        let reference = StreamReference::instance("people", "1");
        let text = serde_json::to_string(&reference).unwrap();
        let back: StreamReference = serde_json::from_str(&text).unwrap();
        assert_eq!(reference, back);
    }

    #[test]
    fn test_wire_shape_tags_variant_without_clobbering_kind() {
        let reference = StreamReference::composite("view", json!({"a": 1}));
        let tree = serde_json::to_value(&reference).unwrap();
        assert_eq!(tree["type"], json!("composite"));
        assert_eq!(tree["kind"], json!("view"));

        let back: StreamReference = serde_json::from_value(tree).unwrap();
        assert_eq!(reference, back);
    }

    #[test]
    fn test_hashable_as_map_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(StreamReference::collection("people"), 1);
        assert_eq!(map.get(&StreamReference::collection("people")), Some(&1));
    }
}

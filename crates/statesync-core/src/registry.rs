//! Type registry for the wire-tree boundary.
//!
//! Wire trees carry a `$type` discriminator on polymorphic nodes so the
//! receiving side can reconstruct the concrete type. Instead of
//! reflection, the registry is an explicit mapping from a logical type
//! name to a constructor that validates and canonicalizes the node, plus
//! a mapping from collection aliases to canonical collection names.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CoreError;

/// The discriminator field injected on tagged nodes.
pub const TYPE_FIELD: &str = "$type";

type Constructor = Arc<dyn Fn(&Value) -> Result<Value, CoreError> + Send + Sync>;

/// Registry of logical type names and collection aliases.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    constructors: HashMap<String, Constructor>,
    aliases: HashMap<String, String>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a concrete type under a logical name.
    ///
    /// The stored constructor round-trips the node through `T`, which
    /// both validates its shape and strips unknown structure according
    /// to `T`'s serde rules.
    pub fn register<T>(&mut self, logical_name: impl Into<String>)
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        let constructor: Constructor = Arc::new(|node: &Value| {
            let typed: T = serde_json::from_value(node.clone())
                .map_err(|e| CoreError::DecodingError(e.to_string()))?;
            serde_json::to_value(&typed).map_err(|e| CoreError::EncodingError(e.to_string()))
        });
        self.constructors.insert(logical_name.into(), constructor);
    }

    /// Register a collection alias. Patch paths generated under `alias`
    /// are rewritten to `canonical` before they hit the wire.
    pub fn alias(&mut self, alias: impl Into<String>, canonical: impl Into<String>) {
        self.aliases.insert(alias.into(), canonical.into());
    }

    /// Resolve a collection name through the alias table. Unknown names
    /// pass through unchanged (they are already canonical).
    pub fn canonical_collection<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Whether a logical type name has a registered constructor.
    pub fn knows_type(&self, logical_name: &str) -> bool {
        self.constructors.contains_key(logical_name)
    }

    /// Serialize a typed value to a tagged tree node.
    pub fn encode_node<T>(&self, logical_name: &str, value: &T) -> Result<Value, CoreError>
    where
        T: Serialize,
    {
        let mut node =
            serde_json::to_value(value).map_err(|e| CoreError::EncodingError(e.to_string()))?;
        if let Value::Object(map) = &mut node {
            map.insert(TYPE_FIELD.to_string(), Value::String(logical_name.to_string()));
        }
        Ok(node)
    }

    /// Reconstruct a node through its `$type` discriminator.
    ///
    /// Untagged nodes pass through unchanged; tagged nodes must name a
    /// registered type or decoding fails with [`CoreError::UnknownType`].
    pub fn decode_node(&self, node: &Value) -> Result<Value, CoreError> {
        let Some(tag) = node_tag(node) else {
            return Ok(node.clone());
        };
        let constructor = self
            .constructors
            .get(tag)
            .ok_or_else(|| CoreError::UnknownType(tag.to_string()))?;
        let mut stripped = node.clone();
        if let Value::Object(map) = &mut stripped {
            map.remove(TYPE_FIELD);
        }
        let mut rebuilt = constructor(&stripped)?;
        if let Value::Object(map) = &mut rebuilt {
            map.insert(TYPE_FIELD.to_string(), Value::String(tag.to_string()));
        }
        Ok(rebuilt)
    }

    /// Deserialize a tagged node into a concrete type, stripping the
    /// discriminator first.
    pub fn decode_typed<T>(&self, node: &Value) -> Result<T, CoreError>
    where
        T: DeserializeOwned,
    {
        if let Some(tag) = node_tag(node) {
            if !self.knows_type(tag) {
                return Err(CoreError::UnknownType(tag.to_string()));
            }
        }
        let mut stripped = node.clone();
        if let Value::Object(map) = &mut stripped {
            map.remove(TYPE_FIELD);
        }
        serde_json::from_value(stripped).map_err(|e| CoreError::DecodingError(e.to_string()))
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.constructors.keys().collect::<Vec<_>>())
            .field("aliases", &self.aliases)
            .finish()
    }
}

fn node_tag(node: &Value) -> Option<&str> {
    node.as_object()
        .and_then(|map| map.get(TYPE_FIELD))
        .and_then(Value::as_str)
}

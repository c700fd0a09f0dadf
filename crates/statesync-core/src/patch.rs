//! Patch operations and their application to tree snapshots.
//!
//! A [`Patch`] is an ordered list of path-addressed operations. Applying
//! a patch is all-or-nothing: if any operation fails, the caller's
//! snapshot is unchanged and an error describes the first failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::PatchError;
use crate::pointer::Pointer;

/// Operation kinds, lowercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Remove,
    Replace,
    Move,
    Copy,
    Test,
}

/// One patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    /// What to do.
    pub op: OpKind,
    /// Where to do it.
    pub path: Pointer,
    /// Payload for add/replace/test.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Source for move/copy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Pointer>,
}

impl PatchOp {
    /// Build an `add` op.
    pub fn add(path: Pointer, value: Value) -> Self {
        Self { op: OpKind::Add, path, value: Some(value), from: None }
    }

    /// Build a `remove` op.
    pub fn remove(path: Pointer) -> Self {
        Self { op: OpKind::Remove, path, value: None, from: None }
    }

    /// Build a `replace` op.
    pub fn replace(path: Pointer, value: Value) -> Self {
        Self { op: OpKind::Replace, path, value: Some(value), from: None }
    }

    /// Build a `move` op.
    pub fn move_from(from: Pointer, path: Pointer) -> Self {
        Self { op: OpKind::Move, path, value: None, from: Some(from) }
    }

    /// Build a `copy` op.
    pub fn copy_from(from: Pointer, path: Pointer) -> Self {
        Self { op: OpKind::Copy, path, value: None, from: Some(from) }
    }

    /// Build a `test` op.
    pub fn test(path: Pointer, value: Value) -> Self {
        Self { op: OpKind::Test, path, value: Some(value), from: None }
    }
}

/// An ordered list of patch operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch {
    ops: Vec<PatchOp>,
}

impl Patch {
    /// An empty patch (no wire traffic required).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from an op list.
    pub fn from_ops(ops: Vec<PatchOp>) -> Self {
        Self { ops }
    }

    /// The operations in application order.
    pub fn ops(&self) -> &[PatchOp] {
        &self.ops
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether this patch does nothing.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Append an operation.
    pub fn push(&mut self, op: PatchOp) {
        self.ops.push(op);
    }

    /// A new patch with every path (and `from`) prefixed by `base`.
    ///
    /// Used to lift an entity-scoped diff to a store-scoped one.
    pub fn prefixed(&self, base: &Pointer) -> Self {
        Self {
            ops: self
                .ops
                .iter()
                .map(|op| PatchOp {
                    op: op.op,
                    path: base.join(&op.path),
                    value: op.value.clone(),
                    from: op.from.as_ref().map(|f| base.join(f)),
                })
                .collect(),
        }
    }

    /// Apply this patch to a snapshot, producing the next snapshot.
    ///
    /// The input is never mutated; on error the first failing operation
    /// is reported and no partial result escapes.
    pub fn apply(&self, snapshot: &Value) -> Result<Value, PatchError> {
        let mut doc = snapshot.clone();
        for op in &self.ops {
            apply_op(&mut doc, op)?;
        }
        Ok(doc)
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Patch({} ops)", self.ops.len())
    }
}

fn apply_op(doc: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    match op.op {
        OpKind::Add => {
            let value = op.value.clone().unwrap_or(Value::Null);
            add(doc, &op.path, value)
        }
        OpKind::Remove => {
            remove(doc, &op.path)?;
            Ok(())
        }
        OpKind::Replace => {
            let value = op.value.clone().unwrap_or(Value::Null);
            let target = resolve_mut(doc, &op.path)?;
            *target = value;
            Ok(())
        }
        OpKind::Move => {
            let from = op.from.as_ref().ok_or(PatchError::MissingFrom)?;
            if from.is_prefix_of(&op.path) {
                return Err(PatchError::MoveIntoSelf {
                    from: from.clone(),
                    path: op.path.clone(),
                });
            }
            let value = remove(doc, from)?;
            add(doc, &op.path, value)
        }
        OpKind::Copy => {
            let from = op.from.as_ref().ok_or(PatchError::MissingFrom)?;
            let value = resolve(doc, from)?.clone();
            add(doc, &op.path, value)
        }
        OpKind::Test => {
            let expected = op.value.clone().unwrap_or(Value::Null);
            let actual = resolve(doc, &op.path)?;
            if *actual == expected {
                Ok(())
            } else {
                Err(PatchError::TestFailed(op.path.clone()))
            }
        }
    }
}

fn resolve<'a>(doc: &'a Value, path: &Pointer) -> Result<&'a Value, PatchError> {
    let mut current = doc;
    for segment in path.segments() {
        current = match current {
            Value::Object(map) => map
                .get(segment)
                .ok_or_else(|| PatchError::PathNotFound(path.clone()))?,
            Value::Array(items) => {
                let index = parse_index(segment, path)?;
                items
                    .get(index)
                    .ok_or_else(|| PatchError::PathNotFound(path.clone()))?
            }
            _ => return Err(PatchError::PathNotFound(path.clone())),
        };
    }
    Ok(current)
}

fn resolve_mut<'a>(doc: &'a mut Value, path: &Pointer) -> Result<&'a mut Value, PatchError> {
    let mut current = doc;
    for segment in path.segments() {
        current = match current {
            Value::Object(map) => map
                .get_mut(segment)
                .ok_or_else(|| PatchError::PathNotFound(path.clone()))?,
            Value::Array(items) => {
                let index = parse_index(segment, path)?;
                items
                    .get_mut(index)
                    .ok_or_else(|| PatchError::PathNotFound(path.clone()))?
            }
            _ => return Err(PatchError::PathNotFound(path.clone())),
        };
    }
    Ok(current)
}

fn add(doc: &mut Value, path: &Pointer, value: Value) -> Result<(), PatchError> {
    let Some((parent_segments, last)) = path.split_last() else {
        // Root add replaces the whole document.
        *doc = value;
        return Ok(());
    };
    let parent_path = Pointer::from_segments(parent_segments.iter().cloned());
    let parent = resolve_mut(doc, &parent_path)?;
    match parent {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
                return Ok(());
            }
            let index = parse_index(last, path)?;
            if index > items.len() {
                return Err(PatchError::IndexOutOfBounds {
                    path: path.clone(),
                    index,
                    len: items.len(),
                });
            }
            items.insert(index, value);
            Ok(())
        }
        _ => Err(PatchError::NotAContainer(path.clone())),
    }
}

fn remove(doc: &mut Value, path: &Pointer) -> Result<Value, PatchError> {
    let Some((parent_segments, last)) = path.split_last() else {
        return Err(PatchError::PathNotFound(path.clone()));
    };
    let parent_path = Pointer::from_segments(parent_segments.iter().cloned());
    let parent = resolve_mut(doc, &parent_path)?;
    match parent {
        Value::Object(map) => map
            .remove(last)
            .ok_or_else(|| PatchError::PathNotFound(path.clone())),
        Value::Array(items) => {
            let index = parse_index(last, path)?;
            if index >= items.len() {
                return Err(PatchError::IndexOutOfBounds {
                    path: path.clone(),
                    index,
                    len: items.len(),
                });
            }
            Ok(items.remove(index))
        }
        _ => Err(PatchError::NotAContainer(path.clone())),
    }
}

fn parse_index(segment: &str, path: &Pointer) -> Result<usize, PatchError> {
    // Leading zeros are not valid array indices in pointer syntax.
    if segment.len() > 1 && segment.starts_with('0') {
        return Err(PatchError::InvalidIndex {
            path: path.clone(),
            index: segment.to_string(),
        });
    }
    segment.parse().map_err(|_| PatchError::InvalidIndex {
        path: path.clone(),
        index: segment.to_string(),
    })
}

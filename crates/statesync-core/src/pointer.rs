//! JSON-pointer paths for patch operations.
//!
//! Segments are stored unescaped; `~0`/`~1` escaping applies only to the
//! textual form (`/a~1b` addresses the key `a/b`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::PatchError;

/// A parsed pointer: an ordered list of unescaped segments. The empty
/// pointer addresses the document root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Pointer(Vec<String>);

impl Pointer {
    /// The root pointer (`""`).
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a pointer from unescaped segments.
    pub fn from_segments(segments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parse the textual form. The empty string is the root; any other
    /// form must start with `/`.
    pub fn parse(text: &str) -> Result<Self, PatchError> {
        if text.is_empty() {
            return Ok(Self::root());
        }
        if !text.starts_with('/') {
            return Err(PatchError::MalformedPointer(text.to_string()));
        }
        let segments = text[1..]
            .split('/')
            .map(unescape)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| PatchError::MalformedPointer(text.to_string()))?;
        Ok(Self(segments))
    }

    /// The unescaped segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether this is the root pointer.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// A new pointer with one more segment appended.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// Split into (parent segments, last segment). Root has no last.
    pub fn split_last(&self) -> Option<(&[String], &str)> {
        self.0
            .split_last()
            .map(|(last, parent)| (parent, last.as_str()))
    }

    /// Whether `self` is a strict prefix of `other`.
    pub fn is_prefix_of(&self, other: &Pointer) -> bool {
        other.0.len() > self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// A new pointer with this one's segments prefixed onto `suffix`.
    pub fn join(&self, suffix: &Pointer) -> Self {
        let mut segments = self.0.clone();
        segments.extend(suffix.0.iter().cloned());
        Self(segments)
    }
}

fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn unescape(segment: &str) -> Result<String, ()> {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                _ => return Err(()),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            write!(f, "/{}", escape(segment))?;
        }
        Ok(())
    }
}

impl Serialize for Pointer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Pointer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Pointer::parse(&text).map_err(serde::de::Error::custom)
    }
}

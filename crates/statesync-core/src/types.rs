//! Strong type definitions for statesync.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bus address of a peer.
///
/// Used both for the `Owner` side of a stream identity and for the
/// `changed_by` attribution on a revision. Addresses are opaque to this
/// library; the message bus owns their interpretation.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Create an address from any string-like value.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Get the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Correlation identifier for one stream-to-subscriber relationship.
///
/// Minted by the subscriber when it opens a subscription; every wire
/// message for that relationship carries it so handlers can be scoped
/// per stream.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub String);

impl StreamId {
    /// Create from an explicit string (tests, deterministic setups).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random stream ID (16 random bytes, hex-encoded).
    pub fn random() -> Self {
        use rand::Rng;
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self(hex::encode(bytes))
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = if self.0.len() > 8 { &self.0[..8] } else { &self.0 };
        write!(f, "StreamId({})", short)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_equality() {
        assert_eq!(Address::new("owner"), Address::from("owner"));
        assert_ne!(Address::new("owner"), Address::new("subscriber"));
    }

    #[test]
    fn test_stream_id_random_unique() {
        let a = StreamId::random();
        let b = StreamId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_stream_id_debug_short() {
        let id = StreamId::new("abcdef0123456789");
        assert_eq!(format!("{:?}", id), "StreamId(abcdef01)");
    }
}

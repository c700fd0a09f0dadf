//! State digests for drift detection.
//!
//! A host and a subscriber can verify they hold the same tree without
//! exchanging it: both compute a blake3 digest over the canonical JSON
//! encoding. `serde_json` maps are BTreeMap-backed, so key order (and
//! therefore the encoding) is deterministic.

use serde_json::Value;

use crate::error::{Result, WireError};

/// Domain separator, bumped if the digest input ever changes.
const DIGEST_CONTEXT: &[u8] = b"statesync-digest-v0:";

/// A 32-byte blake3 digest of a state tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateDigest(pub [u8; 32]);

impl StateDigest {
    /// Render as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for StateDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StateDigest({}..)", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for StateDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Compute the digest of a state tree.
pub fn state_digest(tree: &Value) -> Result<StateDigest> {
    let encoded =
        serde_json::to_vec(tree).map_err(|e| WireError::EncodingError(e.to_string()))?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(DIGEST_CONTEXT);
    hasher.update(&encoded);
    Ok(StateDigest(*hasher.finalize().as_bytes()))
}

/// Check whether a local tree matches a remote digest.
pub fn verify_mirror(local_tree: &Value, remote: &StateDigest) -> Result<bool> {
    Ok(state_digest(local_tree)? == *remote)
}

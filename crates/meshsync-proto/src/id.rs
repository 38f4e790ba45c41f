//! Replica identifiers.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::fmt;

/// Stable identifier of a replica (one peer's copy of a document).
///
/// Doubles as the peer identity on the overlay and as the key of a
/// [`VectorClock`](crate::VectorClock) entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    /// Create a replica id from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a replica id from the bytes of a public key.
    ///
    /// Uses the trailing 8 bytes, URL-safe base64 encoded, so ids stay short
    /// inside clocks.
    #[must_use]
    pub fn from_key_bytes(key: &[u8]) -> Self {
        let tail = &key[key.len().saturating_sub(8)..];
        Self(URL_SAFE_NO_PAD.encode(tail))
    }

    /// Get the inner id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last three characters of the id, used when pretty-printing clocks.
    #[must_use]
    pub fn short(&self) -> &str {
        let start = self
            .0
            .char_indices()
            .rev()
            .nth(2)
            .map_or(0, |(i, _)| i);
        &self.0[start..]
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ReplicaId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_id_ordering() {
        let a = ReplicaId::new("a");
        let b = ReplicaId::new("b");
        assert!(a < b);
        assert_eq!(a, ReplicaId::from("a"));
    }

    #[test]
    fn test_from_key_bytes_uses_tail() {
        let key: Vec<u8> = (0u8..32).collect();
        let id = ReplicaId::from_key_bytes(&key);
        assert_eq!(id, ReplicaId::from_key_bytes(&key[24..]));
        assert_eq!(id.as_str().len(), 11);
    }

    #[test]
    fn test_short_name() {
        assert_eq!(ReplicaId::new("QmPeerXyz").short(), "Xyz");
        assert_eq!(ReplicaId::new("ab").short(), "ab");
    }
}

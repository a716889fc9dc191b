//! Stable identifiers used to correlate state across replicas, peers and
//! the heal journal.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Lowercase hex SHA-256 of a replica's connection tuple. Two replicas with
/// identical connection tuples produce identical ids; this is the identity
/// used in journal entries, since replica index alone is only stable within
/// one process's Mirror Binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn from_connection_tuple(
        endpoint: &str,
        bucket: &str,
        access_key: &str,
        secret_key: &str,
        session_token: Option<&str>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(endpoint.as_bytes());
        hasher.update(b"|");
        hasher.update(bucket.as_bytes());
        hasher.update(b"|");
        hasher.update(access_key.as_bytes());
        hasher.update(b"|");
        hasher.update(secret_key.as_bytes());
        hasher.update(b"|");
        hasher.update(session_token.unwrap_or("").as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Gateway-minted UUID correlating one logical write across both replicas.
/// Stored in user metadata under the `radio-tag` key.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RadioTag(String);

pub const RADIO_TAG_KEY: &str = "radio-tag";

impl RadioTag {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        Uuid::parse_str(&self.0).is_ok()
    }
}

impl Default for RadioTag {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for RadioTag {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for RadioTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Gateway-assigned logical multipart upload id, distinct from the two
/// backend-assigned upload ids it maps to in the Multipart Registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct UploadId(String);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_id_is_stable_for_identical_tuples() {
        let a = ReplicaId::from_connection_tuple("http://r0:9000", "b", "ak", "sk", None);
        let b = ReplicaId::from_connection_tuple("http://r0:9000", "b", "ak", "sk", None);
        assert_eq!(a, b);
    }

    #[test]
    fn replica_id_differs_on_endpoint() {
        let a = ReplicaId::from_connection_tuple("http://r0:9000", "b", "ak", "sk", None);
        let b = ReplicaId::from_connection_tuple("http://r1:9000", "b", "ak", "sk", None);
        assert_ne!(a, b);
    }

    #[test]
    fn radio_tag_round_trips_as_uuid() {
        let tag = RadioTag::new();
        assert!(tag.is_well_formed());
    }
}

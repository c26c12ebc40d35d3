//! Artifacts produced by pipeline stages.
//!
//! A record describes one named blob registered by a stage during a run.
//! The bytes themselves live in the artifact store; records only carry a
//! content digest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Metadata for an artifact registered by a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Run the artifact belongs to
    pub run_id: Uuid,

    /// Stage that produced the artifact
    pub producer_stage_id: String,

    /// Artifact name (workspace-relative path, `/`-separated)
    pub name: String,

    /// SHA-256 of the content, hex encoded
    pub content_ref: String,

    /// Size in bytes
    pub size_bytes: u64,

    /// When the artifact was registered
    pub created_at: DateTime<Utc>,
}

impl ArtifactRecord {
    /// Create a record for the given content
    pub fn new(run_id: Uuid, producer_stage_id: &str, name: &str, content: &[u8]) -> Self {
        Self {
            run_id,
            producer_stage_id: producer_stage_id.to_string(),
            name: name.to_string(),
            content_ref: content_digest(content),
            size_bytes: content.len() as u64,
            created_at: Utc::now(),
        }
    }
}

/// Hex-encoded SHA-256 digest of artifact content
pub fn content_digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_creation() {
        let run_id = Uuid::new_v4();
        let record = ArtifactRecord::new(run_id, "Build", "target/app.jar", b"jar bytes");

        assert_eq!(record.run_id, run_id);
        assert_eq!(record.producer_stage_id, "Build");
        assert_eq!(record.name, "target/app.jar");
        assert_eq!(record.size_bytes, 9);
        assert_eq!(record.content_ref.len(), 64);
    }

    #[test]
    fn test_digest_is_content_addressed() {
        assert_eq!(content_digest(b"same"), content_digest(b"same"));
        assert_ne!(content_digest(b"same"), content_digest(b"other"));
        assert_eq!(
            content_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

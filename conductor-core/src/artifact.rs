use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ArtifactError;
use crate::run::RunId;
use crate::step::StepId;

/// Lowercase hex SHA-256 of the content. Two uploads of identical bytes
/// resolve to the same artifact id.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// A content-addressed, immutable blob record. Referenced, never edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub hash: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub location: String,
    pub run_id: RunId,
    pub step_id: Option<StepId>,
    pub tool_name: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Context for a `put`: who produced (or reused) the bytes.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub mime_type: String,
    pub run_id: RunId,
    pub step_id: Option<StepId>,
    pub tool_name: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub parent_hashes: Vec<String>,
}

/// Append-only edge linking an artifact to the context that produced or
/// reused it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactProvenance {
    pub artifact_hash: String,
    pub run_id: RunId,
    pub step_id: Option<StepId>,
    pub tool_name: Option<String>,
    pub parent_hashes: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

/// External blob storage collaborator.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload bytes and return a locator.
    async fn upload(&self, path: &str, bytes: &[u8], mime_type: &str)
        -> Result<String, ArtifactError>;

    async fn download(&self, locator: &str) -> Result<Vec<u8>, ArtifactError>;

    async fn signed_url(&self, locator: &str, ttl: Duration) -> Result<String, ArtifactError>;

    async fn delete(&self, locator: &str) -> Result<(), ArtifactError>;
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use conductor_core::artifact::{
    content_hash, Artifact, ArtifactProvenance, BlobStore, NewArtifact,
};
use conductor_core::error::{ArtifactError, ConductorError, InfraError};
use sqlx::prelude::FromRow;
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::warn;

use crate::db::{db_err, json_err};
use crate::run_store::parse_ts;

/// Content-addressed artifact store: a metadata table keyed by SHA-256 plus
/// an external blob backend. Identical bytes share one blob; every `put`
/// records a provenance edge whether or not the bytes were new.
#[derive(Clone)]
pub struct ArtifactStore {
    pool: Arc<SqlitePool>,
    blobs: Arc<dyn BlobStore>,
}

/// Result of a `put`: the content hash and whether the bytes already existed.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub hash: String,
    pub deduplicated: bool,
}

#[derive(Debug, FromRow)]
struct ArtifactRow {
    hash: String,
    mime_type: String,
    size_bytes: i64,
    location: String,
    run_id: String,
    step_id: Option<String>,
    tool_name: Option<String>,
    metadata_json: Option<String>,
    created_at: String,
}

#[derive(Debug, FromRow)]
struct ProvenanceRow {
    artifact_hash: String,
    run_id: String,
    step_id: Option<String>,
    tool_name: Option<String>,
    parent_hashes_json: Option<String>,
    recorded_at: String,
}

impl ArtifactStore {
    pub fn new(pool: Arc<SqlitePool>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { pool, blobs }
    }

    /// Store bytes under their content hash. New content is uploaded to the
    /// blob backend before the metadata row is written; if the row insert
    /// then fails, the uploaded blob is removed so no orphan is left behind.
    pub async fn put(&self, bytes: &[u8], meta: NewArtifact) -> Result<PutOutcome, ConductorError> {
        let hash = content_hash(bytes);

        let existing: Option<i64> = sqlx::query_scalar("SELECT 1 FROM artifacts WHERE hash = ?")
            .bind(&hash)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(db_err)?;

        let deduplicated = existing.is_some();
        if !deduplicated {
            let location = self
                .blobs
                .upload(&format!("artifacts/{hash}"), bytes, &meta.mime_type)
                .await
                .map_err(|err| ArtifactError::UploadFailed {
                    hash: hash.clone(),
                    message: err.to_string(),
                })?;

            let metadata_json = meta
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(json_err)?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO artifacts
                    (hash, mime_type, size_bytes, location, run_id, step_id, tool_name, metadata_json, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&hash)
            .bind(&meta.mime_type)
            .bind(bytes.len() as i64)
            .bind(&location)
            .bind(meta.run_id.to_string())
            .bind(meta.step_id.map(|id| id.to_string()))
            .bind(meta.tool_name.as_deref())
            .bind(metadata_json)
            .bind(Utc::now().to_rfc3339())
            .execute(self.pool.as_ref())
            .await;

            if let Err(err) = inserted {
                if let Err(cleanup) = self.blobs.delete(&location).await {
                    warn!(%hash, error = %cleanup, "failed to remove blob after insert failure");
                }
                return Err(db_err(err));
            }
        }

        let parent_hashes_json = serde_json::to_string(&meta.parent_hashes).map_err(json_err)?;
        sqlx::query(
            r#"
            INSERT INTO artifact_provenance
                (artifact_hash, run_id, step_id, tool_name, parent_hashes_json, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&hash)
        .bind(meta.run_id.to_string())
        .bind(meta.step_id.map(|id| id.to_string()))
        .bind(meta.tool_name.as_deref())
        .bind(parent_hashes_json)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        Ok(PutOutcome { hash, deduplicated })
    }

    pub async fn get(&self, hash: &str) -> Result<Option<Artifact>, ConductorError> {
        let row = sqlx::query_as::<_, ArtifactRow>("SELECT * FROM artifacts WHERE hash = ?")
            .bind(hash)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        row.map(parse_artifact_row).transpose()
    }

    pub async fn download(&self, hash: &str) -> Result<Vec<u8>, ConductorError> {
        let artifact = self.get(hash).await?.ok_or_else(|| {
            ConductorError::Artifact(ArtifactError::NotFound { hash: hash.to_string() })
        })?;
        Ok(self.blobs.download(&artifact.location).await?)
    }

    pub async fn signed_url(&self, hash: &str, ttl: Duration) -> Result<String, ConductorError> {
        let artifact = self.get(hash).await?.ok_or_else(|| {
            ConductorError::Artifact(ArtifactError::NotFound { hash: hash.to_string() })
        })?;
        Ok(self.blobs.signed_url(&artifact.location, ttl).await?)
    }

    /// All provenance edges for an artifact, oldest first.
    pub async fn provenance(&self, hash: &str) -> Result<Vec<ArtifactProvenance>, ConductorError> {
        let rows = sqlx::query_as::<_, ProvenanceRow>(
            "SELECT artifact_hash, run_id, step_id, tool_name, parent_hashes_json, recorded_at
             FROM artifact_provenance WHERE artifact_hash = ? ORDER BY id ASC",
        )
        .bind(hash)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(parse_provenance_row).collect()
    }

    /// Delete artifacts whose NEWEST provenance edge is older than the
    /// retention window. A single recent reference keeps an artifact alive
    /// no matter how old the original upload is. Returns the number deleted.
    pub async fn garbage_collect(&self, retention: Duration) -> Result<u64, ConductorError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(30));
        let cutoff = cutoff.to_rfc3339();

        let candidates = sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT a.* FROM artifacts a
            WHERE COALESCE(
                (SELECT MAX(p.recorded_at) FROM artifact_provenance p WHERE p.artifact_hash = a.hash),
                a.created_at
            ) < ?
            "#,
        )
        .bind(&cutoff)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        let mut deleted = 0u64;
        for row in candidates {
            if let Err(err) = self.blobs.delete(&row.location).await {
                warn!(hash = %row.hash, error = %err, "blob delete failed; keeping metadata");
                continue;
            }
            sqlx::query("DELETE FROM artifact_provenance WHERE artifact_hash = ?")
                .bind(&row.hash)
                .execute(self.pool.as_ref())
                .await
                .map_err(db_err)?;
            sqlx::query("DELETE FROM artifacts WHERE hash = ?")
                .bind(&row.hash)
                .execute(self.pool.as_ref())
                .await
                .map_err(db_err)?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

fn parse_artifact_row(row: ArtifactRow) -> Result<Artifact, ConductorError> {
    let infra = |msg: String| ConductorError::Infra(InfraError::Database(msg));
    Ok(Artifact {
        hash: row.hash,
        mime_type: row.mime_type,
        size_bytes: row.size_bytes,
        location: row.location,
        run_id: row.run_id.parse().map_err(|e: uuid::Error| infra(e.to_string()))?,
        step_id: row
            .step_id
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|e: uuid::Error| infra(e.to_string()))?,
        tool_name: row.tool_name,
        metadata: row
            .metadata_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(json_err)?,
        created_at: parse_ts(&row.created_at)?,
    })
}

fn parse_provenance_row(row: ProvenanceRow) -> Result<ArtifactProvenance, ConductorError> {
    let infra = |msg: String| ConductorError::Infra(InfraError::Database(msg));
    Ok(ArtifactProvenance {
        artifact_hash: row.artifact_hash,
        run_id: row.run_id.parse().map_err(|e: uuid::Error| infra(e.to_string()))?,
        step_id: row
            .step_id
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|e: uuid::Error| infra(e.to_string()))?,
        tool_name: row.tool_name,
        parent_hashes: row
            .parent_hashes_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(json_err)?
            .unwrap_or_default(),
        recorded_at: parse_ts(&row.recorded_at)?,
    })
}

/// In-process blob backend. Backs tests and embedded deployments.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        _mime_type: &str,
    ) -> Result<String, ArtifactError> {
        self.blobs
            .write()
            .await
            .insert(path.to_string(), bytes.to_vec());
        Ok(format!("mem://{path}"))
    }

    async fn download(&self, locator: &str) -> Result<Vec<u8>, ArtifactError> {
        let key = locator.trim_start_matches("mem://");
        self.blobs
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ArtifactError::Blob(format!("missing blob {locator}")))
    }

    async fn signed_url(&self, locator: &str, _ttl: Duration) -> Result<String, ArtifactError> {
        Ok(format!("{locator}?signed"))
    }

    async fn delete(&self, locator: &str) -> Result<(), ArtifactError> {
        let key = locator.trim_start_matches("mem://");
        self.blobs.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use conductor_core::run::RunId;
    use conductor_core::step::StepId;

    use crate::db::in_memory_pool;

    async fn store() -> ArtifactStore {
        let pool = in_memory_pool().await.expect("pool");
        ArtifactStore::new(pool, Arc::new(MemoryBlobStore::new()))
    }

    fn meta(run_id: RunId) -> NewArtifact {
        NewArtifact {
            mime_type: "text/plain".into(),
            run_id,
            step_id: Some(StepId::new_v4()),
            tool_name: Some("report".into()),
            metadata: None,
            parent_hashes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn put_roundtrips_through_blob_backend() {
        let store = store().await;
        let run_id = RunId::new_v4();

        let outcome = store.put(b"final report", meta(run_id)).await.expect("put");
        assert!(!outcome.deduplicated);
        assert_eq!(outcome.hash, content_hash(b"final report"));

        let artifact = store
            .get(&outcome.hash)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(artifact.size_bytes, 12);
        assert_eq!(artifact.run_id, run_id);

        let bytes = store.download(&outcome.hash).await.expect("download");
        assert_eq!(bytes, b"final report");

        let url = store
            .signed_url(&outcome.hash, Duration::from_secs(60))
            .await
            .expect("signed url");
        assert!(url.contains(&outcome.hash));
    }

    #[tokio::test]
    async fn identical_bytes_dedup_to_one_artifact_with_two_edges() {
        let store = store().await;
        let first = store
            .put(b"shared bytes", meta(RunId::new_v4()))
            .await
            .expect("first put");
        let second = store
            .put(b"shared bytes", meta(RunId::new_v4()))
            .await
            .expect("second put");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.hash, second.hash);

        let edges = store.provenance(&first.hash).await.expect("provenance");
        assert_eq!(edges.len(), 2);
        assert_ne!(edges[0].run_id, edges[1].run_id);
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let store = store().await;
        let err = store
            .download(&content_hash(b"never stored"))
            .await
            .expect_err("missing");
        assert!(matches!(
            err,
            ConductorError::Artifact(ArtifactError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn gc_removes_only_stale_artifacts() {
        let store = store().await;
        let outcome = store.put(b"old bytes", meta(RunId::new_v4())).await.expect("put");

        // Edge recorded just now: a generous window keeps it.
        let deleted = store
            .garbage_collect(Duration::from_secs(86_400))
            .await
            .expect("gc");
        assert_eq!(deleted, 0);
        assert!(store.get(&outcome.hash).await.expect("get").is_some());

        // Zero retention: everything currently stored is past the cutoff.
        let deleted = store.garbage_collect(Duration::ZERO).await.expect("gc");
        assert_eq!(deleted, 1);
        assert!(store.get(&outcome.hash).await.expect("get").is_none());
        assert!(store
            .provenance(&outcome.hash)
            .await
            .expect("provenance")
            .is_empty());
    }

    #[tokio::test]
    async fn recent_reuse_keeps_old_artifact_alive() {
        let store = store().await;
        let pool = store.pool.clone();

        let outcome = store.put(b"kept bytes", meta(RunId::new_v4())).await.expect("put");

        // Age the upload and its original edge far past the cutoff.
        let old = (Utc::now() - chrono::Duration::days(60)).to_rfc3339();
        sqlx::query("UPDATE artifacts SET created_at = ? WHERE hash = ?")
            .bind(&old)
            .bind(&outcome.hash)
            .execute(pool.as_ref())
            .await
            .expect("age artifact");
        sqlx::query("UPDATE artifact_provenance SET recorded_at = ? WHERE artifact_hash = ?")
            .bind(&old)
            .bind(&outcome.hash)
            .execute(pool.as_ref())
            .await
            .expect("age edge");

        // A fresh reuse writes a new edge, which is what GC looks at.
        let reuse = store.put(b"kept bytes", meta(RunId::new_v4())).await.expect("reuse");
        assert!(reuse.deduplicated);

        let deleted = store
            .garbage_collect(Duration::from_secs(30 * 86_400))
            .await
            .expect("gc");
        assert_eq!(deleted, 0);
        assert!(store.get(&outcome.hash).await.expect("get").is_some());
    }
}

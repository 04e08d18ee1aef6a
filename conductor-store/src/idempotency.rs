use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use conductor_core::error::ConductorError;
use conductor_core::tool::ToolExecutionResult;
use sqlx::SqlitePool;

use crate::db::{db_err, json_err};
use crate::run_store::parse_ts;

// Fixed-width timestamps so SQL string comparison orders correctly.
fn format_expiry(ts: chrono::DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// TTL cache of tool execution results keyed by idempotency key. A hit
/// returns the recorded result without re-invoking the backend.
#[derive(Clone)]
pub struct IdempotencyCache {
    pool: Arc<SqlitePool>,
}

impl IdempotencyCache {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Look up a non-expired entry. An expired row is purged on read and
    /// reported as a miss.
    pub async fn get(&self, key: &str) -> Result<Option<ToolExecutionResult>, ConductorError> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT result_json, expires_at FROM idempotency_cache WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        let Some((result_json, expires_at)) = row else {
            return Ok(None);
        };

        if parse_ts(&expires_at)? <= Utc::now() {
            sqlx::query("DELETE FROM idempotency_cache WHERE key = ?")
                .bind(key)
                .execute(self.pool.as_ref())
                .await
                .map_err(db_err)?;
            return Ok(None);
        }

        let result = serde_json::from_str(&result_json).map_err(json_err)?;
        Ok(Some(result))
    }

    /// Record a result under `key` for `ttl`. Re-recording overwrites the
    /// previous entry and refreshes its expiry.
    pub async fn put(
        &self,
        key: &str,
        result: &ToolExecutionResult,
        ttl: Duration,
    ) -> Result<(), ConductorError> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(24));
        let result_json = serde_json::to_string(result).map_err(json_err)?;

        sqlx::query(
            r#"
            INSERT INTO idempotency_cache (key, result_json, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                result_json = excluded.result_json,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(result_json)
        .bind(format_expiry(expires_at))
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Remove every expired entry. Returns the number purged.
    pub async fn purge_expired(&self) -> Result<u64, ConductorError> {
        let result = sqlx::query("DELETE FROM idempotency_cache WHERE expires_at <= ?")
            .bind(format_expiry(Utc::now()))
            .execute(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

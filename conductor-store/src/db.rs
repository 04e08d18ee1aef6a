use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use conductor_core::error::{ConductorError, InfraError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

pub(crate) fn db_err(err: sqlx::Error) -> ConductorError {
    ConductorError::Infra(InfraError::Database(err.to_string()))
}

pub(crate) fn json_err(err: serde_json::Error) -> ConductorError {
    ConductorError::Infra(InfraError::Database(err.to_string()))
}

/// Open (creating if missing) the engine database at `path` and run the
/// schema migration.
pub async fn open_pool(path: &Path) -> Result<Arc<SqlitePool>, ConductorError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| ConductorError::Infra(InfraError::Io(err)))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .map_err(|err| {
            ConductorError::Infra(InfraError::Config(format!("invalid sqlite options: {err}")))
        })?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(db_err)?;
    let pool = Arc::new(pool);
    migrate(&pool).await?;
    Ok(pool)
}

/// Shared-cache in-memory database; used by tests and embedded callers.
pub async fn in_memory_pool() -> Result<Arc<SqlitePool>, ConductorError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .map_err(db_err)?;
    let pool = Arc::new(pool);
    migrate(&pool).await?;
    Ok(pool)
}

/// Idempotent schema migration for every table the engine persists.
pub async fn migrate(pool: &SqlitePool) -> Result<(), ConductorError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            prompt TEXT NOT NULL,
            status TEXT NOT NULL,
            current_phase INTEGER NOT NULL DEFAULT 0,
            plan_json TEXT,
            credits_consumed INTEGER NOT NULL DEFAULT 0,
            error_kind TEXT,
            error_message TEXT,
            started_at TEXT,
            completed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)")
        .execute(pool)
        .await
        .map_err(db_err)?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_tenant ON runs(tenant_id, created_at)")
        .execute(pool)
        .await
        .map_err(db_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_transitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            from_status TEXT NOT NULL,
            to_status TEXT NOT NULL,
            triggered_by TEXT NOT NULL,
            metadata_json TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_run_transitions_run ON run_transitions(run_id, id)",
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS steps (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            phase_index INTEGER NOT NULL,
            tool_name TEXT NOT NULL,
            input_json TEXT NOT NULL,
            status TEXT NOT NULL,
            output_json TEXT,
            error TEXT,
            credits_charged INTEGER NOT NULL DEFAULT 0,
            started_at TEXT,
            completed_at TEXT,
            duration_ms INTEGER,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_steps_run_status ON steps(run_id, status)")
        .execute(pool)
        .await
        .map_err(db_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            token_estimate INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_run_messages_run ON run_messages(run_id, id)")
        .execute(pool)
        .await
        .map_err(db_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenant_balances (
            tenant_id TEXT PRIMARY KEY,
            available INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS credit_reservations (
            run_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            reserved INTEGER NOT NULL,
            consumed INTEGER NOT NULL DEFAULT 0,
            max_amount INTEGER NOT NULL,
            expires_at TEXT NOT NULL,
            released INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            hash TEXT PRIMARY KEY,
            mime_type TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            location TEXT NOT NULL,
            run_id TEXT NOT NULL,
            step_id TEXT,
            tool_name TEXT,
            metadata_json TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifact_provenance (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            artifact_hash TEXT NOT NULL,
            run_id TEXT NOT NULL,
            step_id TEXT,
            tool_name TEXT,
            parent_hashes_json TEXT,
            recorded_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_provenance_hash ON artifact_provenance(artifact_hash, recorded_at DESC)",
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS idempotency_cache (
            key TEXT PRIMARY KEY,
            result_json TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    Ok(())
}

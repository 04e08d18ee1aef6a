use std::sync::Arc;

use chrono::{DateTime, Utc};
use conductor_core::error::{ConductorError, InfraError};
use conductor_core::plan::Plan;
use conductor_core::run::{Run, RunId, RunStatus, TransitionRecord};
use sqlx::prelude::FromRow;
use sqlx::SqlitePool;

use crate::db::{db_err, json_err};

/// Persistence for run records, their CAS-guarded status column, and the
/// append-only transition log.
#[derive(Clone)]
pub struct RunStore {
    pool: Arc<SqlitePool>,
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: String,
    tenant_id: String,
    prompt: String,
    status: String,
    current_phase: i64,
    plan_json: Option<String>,
    credits_consumed: i64,
    error_kind: Option<String>,
    error_message: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct TransitionRow {
    run_id: String,
    from_status: String,
    to_status: String,
    triggered_by: String,
    metadata_json: Option<String>,
    created_at: String,
}

impl RunStore {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    pub async fn insert_run(&self, run: &Run) -> Result<(), ConductorError> {
        let plan_json = run
            .plan
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(json_err)?;

        sqlx::query(
            r#"
            INSERT INTO runs (
                id, tenant_id, prompt, status, current_phase, plan_json, credits_consumed,
                error_kind, error_message, started_at, completed_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.id.to_string())
        .bind(&run.tenant_id)
        .bind(&run.prompt)
        .bind(run.status.as_str())
        .bind(run.current_phase as i64)
        .bind(plan_json)
        .bind(run.credits_consumed)
        .bind(run.error_kind.clone())
        .bind(run.error_message.clone())
        .bind(run.started_at.map(|dt| dt.to_rfc3339()))
        .bind(run.completed_at.map(|dt| dt.to_rfc3339()))
        .bind(run.created_at.to_rfc3339())
        .bind(run.updated_at.to_rfc3339())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        Ok(())
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, ConductorError> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(db_err)?;

        row.map(parse_run_row).transpose()
    }

    pub async fn list_runs_by_status(
        &self,
        statuses: &[RunStatus],
    ) -> Result<Vec<Run>, ConductorError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = std::iter::repeat_n("?", statuses.len())
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "SELECT * FROM runs WHERE status IN ({placeholders}) ORDER BY created_at ASC"
        );
        let mut sql = sqlx::query_as::<_, RunRow>(&query);
        for status in statuses {
            sql = sql.bind(status.as_str());
        }
        let rows = sql.fetch_all(self.pool.as_ref()).await.map_err(db_err)?;

        rows.into_iter().map(parse_run_row).collect()
    }

    /// Compare-and-swap on the status column: the write succeeds only if the
    /// stored status still equals `from`. Returns false when the observed
    /// status was stale (or the run does not exist); the caller decides
    /// between `ConcurrentModification` and not-found after reloading.
    ///
    /// Terminal targets stamp `completed_at`; entering `executing` stamps
    /// `started_at` once; error fields are written only when provided.
    pub async fn cas_status(
        &self,
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
        error: Option<(&str, &str)>,
    ) -> Result<bool, ConductorError> {
        let now = Utc::now().to_rfc3339();
        let started_at = (to == RunStatus::Executing).then(|| now.clone());
        let completed_at = to.is_terminal().then(|| now.clone());
        let (error_kind, error_message) = match error {
            Some((kind, message)) => (Some(kind.to_string()), Some(message.to_string())),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = ?,
                updated_at = ?,
                started_at = COALESCE(started_at, ?),
                completed_at = COALESCE(?, completed_at),
                error_kind = COALESCE(?, error_kind),
                error_message = COALESCE(?, error_message)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(&now)
        .bind(started_at)
        .bind(completed_at)
        .bind(error_kind)
        .bind(error_message)
        .bind(run_id.to_string())
        .bind(from.as_str())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Append one immutable record to the transition log.
    pub async fn record_transition(
        &self,
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
        trigger: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), ConductorError> {
        sqlx::query(
            r#"
            INSERT INTO run_transitions (run_id, from_status, to_status, triggered_by, metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id.to_string())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(trigger)
        .bind(metadata.map(|value| value.to_string()))
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn list_transitions(
        &self,
        run_id: RunId,
    ) -> Result<Vec<TransitionRecord>, ConductorError> {
        let rows = sqlx::query_as::<_, TransitionRow>(
            r#"
            SELECT run_id, from_status, to_status, triggered_by, metadata_json, created_at
            FROM run_transitions
            WHERE run_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(run_id.to_string())
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        rows.into_iter().map(parse_transition_row).collect()
    }

    pub async fn update_plan(&self, run_id: RunId, plan: &Plan) -> Result<(), ConductorError> {
        let plan_json = serde_json::to_string(plan).map_err(json_err)?;
        sqlx::query("UPDATE runs SET plan_json = ?, updated_at = ? WHERE id = ?")
            .bind(plan_json)
            .bind(Utc::now().to_rfc3339())
            .bind(run_id.to_string())
            .execute(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn set_current_phase(
        &self,
        run_id: RunId,
        phase: usize,
    ) -> Result<(), ConductorError> {
        sqlx::query("UPDATE runs SET current_phase = ?, updated_at = ? WHERE id = ?")
            .bind(phase as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(run_id.to_string())
            .execute(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn add_credits_consumed(
        &self,
        run_id: RunId,
        amount: i64,
    ) -> Result<(), ConductorError> {
        sqlx::query(
            "UPDATE runs SET credits_consumed = credits_consumed + ?, updated_at = ? WHERE id = ?",
        )
        .bind(amount)
        .bind(Utc::now().to_rfc3339())
        .bind(run_id.to_string())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

fn parse_run_row(row: RunRow) -> Result<Run, ConductorError> {
    let infra = |msg: String| ConductorError::Infra(InfraError::Database(msg));

    let id = row.id.parse::<RunId>().map_err(|e| infra(e.to_string()))?;
    let status = RunStatus::parse(&row.status)
        .ok_or_else(|| infra(format!("unknown run status '{}'", row.status)))?;
    let plan = row
        .plan_json
        .as_deref()
        .map(serde_json::from_str::<Plan>)
        .transpose()
        .map_err(json_err)?;

    Ok(Run {
        id,
        tenant_id: row.tenant_id,
        prompt: row.prompt,
        status,
        current_phase: row.current_phase as usize,
        plan,
        credits_consumed: row.credits_consumed,
        error_kind: row.error_kind,
        error_message: row.error_message,
        started_at: parse_opt_ts(row.started_at.as_deref())?,
        completed_at: parse_opt_ts(row.completed_at.as_deref())?,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

fn parse_transition_row(row: TransitionRow) -> Result<TransitionRecord, ConductorError> {
    let infra = |msg: String| ConductorError::Infra(InfraError::Database(msg));

    Ok(TransitionRecord {
        run_id: row.run_id.parse().map_err(|e: uuid::Error| infra(e.to_string()))?,
        from_status: RunStatus::parse(&row.from_status)
            .ok_or_else(|| infra(format!("unknown run status '{}'", row.from_status)))?,
        to_status: RunStatus::parse(&row.to_status)
            .ok_or_else(|| infra(format!("unknown run status '{}'", row.to_status)))?,
        trigger: row.triggered_by,
        metadata: row
            .metadata_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(json_err)?,
        created_at: parse_ts(&row.created_at)?,
    })
}

pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>, ConductorError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| ConductorError::Infra(InfraError::Database(err.to_string())))
}

pub(crate) fn parse_opt_ts(value: Option<&str>) -> Result<Option<DateTime<Utc>>, ConductorError> {
    value.map(parse_ts).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::plan::Phase;

    use crate::db::in_memory_pool;

    async fn store() -> RunStore {
        RunStore::new(in_memory_pool().await.expect("pool"))
    }

    #[tokio::test]
    async fn insert_and_reload_run() {
        let store = store().await;
        let run = Run::new("tenant-a", "summarize the quarterly numbers");
        store.insert_run(&run).await.expect("insert");

        let loaded = store.get_run(run.id).await.expect("get").expect("present");
        assert_eq!(loaded.tenant_id, "tenant-a");
        assert_eq!(loaded.status, RunStatus::Created);
        assert_eq!(loaded.current_phase, 0);
        assert!(loaded.plan.is_none());
    }

    #[tokio::test]
    async fn cas_succeeds_only_from_observed_status() {
        let store = store().await;
        let run = Run::new("tenant-a", "p");
        store.insert_run(&run).await.expect("insert");

        let moved = store
            .cas_status(run.id, RunStatus::Created, RunStatus::Queued, None)
            .await
            .expect("cas");
        assert!(moved);

        // Stale observation: the run is already queued.
        let moved = store
            .cas_status(run.id, RunStatus::Created, RunStatus::Queued, None)
            .await
            .expect("cas");
        assert!(!moved);

        let loaded = store.get_run(run.id).await.expect("get").expect("present");
        assert_eq!(loaded.status, RunStatus::Queued);
    }

    #[tokio::test]
    async fn terminal_cas_stamps_completion_and_error() {
        let store = store().await;
        let mut run = Run::new("tenant-a", "p");
        run.status = RunStatus::Executing;
        store.insert_run(&run).await.expect("insert");

        let moved = store
            .cas_status(
                run.id,
                RunStatus::Executing,
                RunStatus::Failed,
                Some(("decision_failed", "model returned garbage")),
            )
            .await
            .expect("cas");
        assert!(moved);

        let loaded = store.get_run(run.id).await.expect("get").expect("present");
        assert_eq!(loaded.status, RunStatus::Failed);
        assert!(loaded.completed_at.is_some());
        assert_eq!(loaded.error_kind.as_deref(), Some("decision_failed"));
        assert_eq!(loaded.error_message.as_deref(), Some("model returned garbage"));
    }

    #[tokio::test]
    async fn transition_log_appends_and_lists_in_order() {
        let store = store().await;
        let run = Run::new("tenant-a", "p");
        store.insert_run(&run).await.expect("insert");

        store
            .record_transition(run.id, RunStatus::Created, RunStatus::Queued, "submit", None)
            .await
            .expect("record");
        store
            .record_transition(
                run.id,
                RunStatus::Queued,
                RunStatus::Planning,
                "start",
                Some(serde_json::json!({"worker": "w1"})),
            )
            .await
            .expect("record");

        let log = store.list_transitions(run.id).await.expect("list");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].to_status, RunStatus::Queued);
        assert_eq!(log[1].trigger, "start");
        assert_eq!(
            log[1].metadata.as_ref().and_then(|m| m["worker"].as_str()),
            Some("w1")
        );
    }

    #[tokio::test]
    async fn list_by_status_filters_and_orders() {
        let store = store().await;
        let queued = Run::new("tenant-a", "first");
        store.insert_run(&queued).await.expect("insert");
        store
            .cas_status(queued.id, RunStatus::Created, RunStatus::Queued, None)
            .await
            .expect("cas");
        let created = Run::new("tenant-a", "second");
        store.insert_run(&created).await.expect("insert");

        let runs = store
            .list_runs_by_status(&[RunStatus::Queued])
            .await
            .expect("list");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, queued.id);

        let runs = store
            .list_runs_by_status(&[RunStatus::Created, RunStatus::Queued])
            .await
            .expect("list");
        assert_eq!(runs.len(), 2);
        assert!(store.list_runs_by_status(&[]).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn plan_and_phase_updates_round_trip() {
        let store = store().await;
        let run = Run::new("tenant-a", "p");
        store.insert_run(&run).await.expect("insert");

        let plan = Plan::new(vec![
            Phase::new("work", "Work", "do the thing"),
            Phase::new("deliver", "Deliver", "wrap up"),
        ]);
        store.update_plan(run.id, &plan).await.expect("plan");
        store.set_current_phase(run.id, 1).await.expect("phase");
        store.add_credits_consumed(run.id, 7).await.expect("credits");

        let loaded = store.get_run(run.id).await.expect("get").expect("present");
        assert_eq!(loaded.plan.expect("plan").len(), 2);
        assert_eq!(loaded.current_phase, 1);
        assert_eq!(loaded.credits_consumed, 7);
    }
}

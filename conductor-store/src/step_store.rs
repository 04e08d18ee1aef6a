use std::sync::Arc;

use chrono::Utc;
use conductor_core::error::{ConductorError, InfraError};
use conductor_core::run::RunId;
use conductor_core::step::{Step, StepId, StepStatus};
use sqlx::prelude::FromRow;
use sqlx::SqlitePool;

use crate::db::{db_err, json_err};
use crate::run_store::{parse_opt_ts, parse_ts};

/// Persistence for step records. Status moves are CAS-guarded on the stored
/// status, mirroring the run store.
#[derive(Clone)]
pub struct StepStore {
    pool: Arc<SqlitePool>,
}

#[derive(Debug, FromRow)]
struct StepRow {
    id: String,
    run_id: String,
    phase_index: i64,
    tool_name: String,
    input_json: String,
    status: String,
    output_json: Option<String>,
    error: Option<String>,
    credits_charged: i64,
    started_at: Option<String>,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    created_at: String,
}

impl StepStore {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    pub async fn insert_step(&self, step: &Step) -> Result<(), ConductorError> {
        let input_json = serde_json::to_string(&step.input).map_err(json_err)?;
        sqlx::query(
            r#"
            INSERT INTO steps (
                id, run_id, phase_index, tool_name, input_json, status, credits_charged, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(step.id.to_string())
        .bind(step.run_id.to_string())
        .bind(step.phase_index as i64)
        .bind(&step.tool_name)
        .bind(input_json)
        .bind(step.status.as_str())
        .bind(step.credits_charged)
        .bind(step.created_at.to_rfc3339())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_step(&self, step_id: StepId) -> Result<Option<Step>, ConductorError> {
        let row = sqlx::query_as::<_, StepRow>("SELECT * FROM steps WHERE id = ?")
            .bind(step_id.to_string())
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        row.map(parse_step_row).transpose()
    }

    pub async fn list_steps_for_run(&self, run_id: RunId) -> Result<Vec<Step>, ConductorError> {
        let rows = sqlx::query_as::<_, StepRow>(
            "SELECT * FROM steps WHERE run_id = ? ORDER BY created_at ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(parse_step_row).collect()
    }

    /// `pending -> running`, stamping the start time. Returns false when the
    /// stored status was not `pending`.
    pub async fn cas_start(&self, step_id: StepId) -> Result<bool, ConductorError> {
        let result = sqlx::query(
            "UPDATE steps SET status = ?, started_at = ? WHERE id = ? AND status = ?",
        )
        .bind(StepStatus::Running.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(step_id.to_string())
        .bind(StepStatus::Pending.as_str())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    /// `running -> completed`, persisting output, charge, and the wall-clock
    /// duration computed from the recorded start time.
    pub async fn cas_complete(
        &self,
        step_id: StepId,
        output: &serde_json::Value,
        credits_charged: i64,
    ) -> Result<bool, ConductorError> {
        let duration_ms = self.elapsed_ms(step_id).await?;
        let output_json = serde_json::to_string(output).map_err(json_err)?;
        let result = sqlx::query(
            r#"
            UPDATE steps SET status = ?, output_json = ?, credits_charged = ?,
                completed_at = ?, duration_ms = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(StepStatus::Completed.as_str())
        .bind(output_json)
        .bind(credits_charged)
        .bind(Utc::now().to_rfc3339())
        .bind(duration_ms)
        .bind(step_id.to_string())
        .bind(StepStatus::Running.as_str())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    /// `running -> failed`, persisting the error and duration.
    pub async fn cas_fail(&self, step_id: StepId, error: &str) -> Result<bool, ConductorError> {
        let duration_ms = self.elapsed_ms(step_id).await?;
        let result = sqlx::query(
            r#"
            UPDATE steps SET status = ?, error = ?, completed_at = ?, duration_ms = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(StepStatus::Failed.as_str())
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(duration_ms)
        .bind(step_id.to_string())
        .bind(StepStatus::Running.as_str())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark every pending/running step of a run `cancelled`. Returns the
    /// number of steps cancelled.
    pub async fn cancel_in_flight(&self, run_id: RunId) -> Result<u64, ConductorError> {
        let result = sqlx::query(
            r#"
            UPDATE steps SET status = ?, completed_at = ?
            WHERE run_id = ? AND status IN (?, ?)
            "#,
        )
        .bind(StepStatus::Cancelled.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(run_id.to_string())
        .bind(StepStatus::Pending.as_str())
        .bind(StepStatus::Running.as_str())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn elapsed_ms(&self, step_id: StepId) -> Result<Option<i64>, ConductorError> {
        let started_at: Option<Option<String>> =
            sqlx::query_scalar("SELECT started_at FROM steps WHERE id = ?")
                .bind(step_id.to_string())
                .fetch_optional(self.pool.as_ref())
                .await
                .map_err(db_err)?;

        let Some(Some(started_at)) = started_at else {
            return Ok(None);
        };
        let started_at = parse_ts(&started_at)?;
        Ok(Some((Utc::now() - started_at).num_milliseconds().max(0)))
    }
}

fn parse_step_row(row: StepRow) -> Result<Step, ConductorError> {
    let infra = |msg: String| ConductorError::Infra(InfraError::Database(msg));

    Ok(Step {
        id: row.id.parse().map_err(|e: uuid::Error| infra(e.to_string()))?,
        run_id: row.run_id.parse().map_err(|e: uuid::Error| infra(e.to_string()))?,
        phase_index: row.phase_index as usize,
        tool_name: row.tool_name,
        input: serde_json::from_str(&row.input_json).map_err(json_err)?,
        status: StepStatus::parse(&row.status)
            .ok_or_else(|| infra(format!("unknown step status '{}'", row.status)))?,
        output: row
            .output_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(json_err)?,
        error: row.error,
        credits_charged: row.credits_charged,
        started_at: parse_opt_ts(row.started_at.as_deref())?,
        completed_at: parse_opt_ts(row.completed_at.as_deref())?,
        duration_ms: row.duration_ms,
        created_at: parse_ts(&row.created_at)?,
    })
}

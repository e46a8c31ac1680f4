//! Run-row operations and final aggregate summaries.
//!
//! The run row is exclusively mutated by the coordinator; every other
//! process only reads it. Summaries are written exactly once at finalize
//! (upsert, so a crash-retry does not duplicate the row).

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::Database;
use crate::aggregate::RunSummary;
use crate::types::{Phase, RunRecord, RunStatus};

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: Uuid,
    scenario: Value,
    status: String,
    phase: String,
    start_time: Option<DateTime<Utc>>,
    warmup_end_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    total_workers_expected: i32,
    workers_registered: i32,
    workers_active: i32,
    workers_completed: i32,
    total_ops: i64,
    error_count: i64,
    current_qps: f64,
    find_max_state: Option<Value>,
    next_sequence_id: i64,
    reason_code: Option<String>,
    reason_message: Option<String>,
    stop_requested: bool,
    abort_requested: bool,
}

impl RunRow {
    fn into_record(self) -> Result<RunRecord> {
        Ok(RunRecord {
            run_id: self.run_id,
            scenario: serde_json::from_value(self.scenario)?,
            status: RunStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("unknown run status `{}`", self.status))?,
            phase: Phase::parse(&self.phase)
                .ok_or_else(|| anyhow!("unknown phase `{}`", self.phase))?,
            start_time: self.start_time,
            warmup_end_time: self.warmup_end_time,
            end_time: self.end_time,
            total_workers_expected: self.total_workers_expected.max(0) as u32,
            workers_registered: self.workers_registered.max(0) as u32,
            workers_active: self.workers_active.max(0) as u32,
            workers_completed: self.workers_completed.max(0) as u32,
            total_ops: self.total_ops.max(0) as u64,
            error_count: self.error_count.max(0) as u64,
            current_qps: self.current_qps,
            find_max_state: self
                .find_max_state
                .map(serde_json::from_value)
                .transpose()?,
            next_sequence_id: self.next_sequence_id.max(0) as u64,
            reason_code: self.reason_code,
            reason_message: self.reason_message,
            stop_requested: self.stop_requested,
            abort_requested: self.abort_requested,
        })
    }
}

const RUN_COLUMNS: &str = "run_id, scenario, status, phase, start_time, warmup_end_time, end_time,
     total_workers_expected, workers_registered, workers_active, workers_completed,
     total_ops, error_count, current_qps, find_max_state, next_sequence_id,
     reason_code, reason_message, stop_requested, abort_requested";

impl Database {
    pub async fn insert_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs (run_id, scenario, status, phase, total_workers_expected, next_sequence_id)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(run.run_id)
        .bind(serde_json::to_value(&run.scenario)?)
        .bind(run.status.as_str())
        .bind(run.phase.as_str())
        .bind(run.total_workers_expected as i32)
        .bind(run.next_sequence_id as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET
               status = $2, phase = $3, start_time = $4, warmup_end_time = $5, end_time = $6,
               workers_registered = $7, workers_active = $8, workers_completed = $9,
               total_ops = $10, error_count = $11, current_qps = $12,
               find_max_state = $13, next_sequence_id = $14,
               reason_code = $15, reason_message = $16
             WHERE run_id = $1",
        )
        .bind(run.run_id)
        .bind(run.status.as_str())
        .bind(run.phase.as_str())
        .bind(run.start_time)
        .bind(run.warmup_end_time)
        .bind(run.end_time)
        .bind(run.workers_registered as i32)
        .bind(run.workers_active as i32)
        .bind(run.workers_completed as i32)
        .bind(run.total_ops as i64)
        .bind(run.error_count as i64)
        .bind(run.current_qps)
        .bind(
            run.find_max_state
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(run.next_sequence_id as i64)
        .bind(&run.reason_code)
        .bind(&run.reason_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set the one-shot user stop/abort request flags. The coordinator's own
    /// `update_run` never touches these columns, so the request cannot be
    /// lost to a racing row update. Returns false when the run is unknown.
    pub async fn request_stop(&self, run_id: Uuid, abort: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE runs SET stop_requested = TRUE,
                             abort_requested = abort_requested OR $2
             WHERE run_id = $1",
        )
        .bind(run_id)
        .bind(abort)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = $1"))
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(RunRow::into_record).transpose()
    }

    pub async fn write_summary(&self, run_id: Uuid, summary: &RunSummary) -> Result<()> {
        sqlx::query(
            "INSERT INTO run_summaries (run_id, summary) VALUES ($1, $2)
             ON CONFLICT (run_id) DO UPDATE SET summary = EXCLUDED.summary, written_at = NOW()",
        )
        .bind(run_id)
        .bind(serde_json::to_value(summary)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_summary(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        let row: Option<(Value,)> =
            sqlx::query_as("SELECT summary FROM run_summaries WHERE run_id = $1")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(v,)| serde_json::from_value(v).map_err(Into::into))
            .transpose()
    }
}

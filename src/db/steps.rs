//! FIND_MAX step history — one row per completed step.

use anyhow::{anyhow, Result};
use uuid::Uuid;

use super::Database;
use crate::types::{StepOutcome, StepRecord};

#[derive(sqlx::FromRow)]
struct StepRow {
    run_id: Uuid,
    step_number: i32,
    target_workers: i32,
    qps: f64,
    p50_ms: f64,
    p95_ms: f64,
    p99_ms: f64,
    error_rate: f64,
    queue_detected: bool,
    outcome: String,
    stop_reason: Option<String>,
}

impl StepRow {
    fn into_record(self) -> Result<StepRecord> {
        Ok(StepRecord {
            run_id: self.run_id,
            step_number: self.step_number.max(0) as u32,
            target_workers: self.target_workers.max(0) as u32,
            qps: self.qps,
            p50_ms: self.p50_ms,
            p95_ms: self.p95_ms,
            p99_ms: self.p99_ms,
            error_rate: self.error_rate,
            queue_detected: self.queue_detected,
            outcome: StepOutcome::parse(&self.outcome)
                .ok_or_else(|| anyhow!("unknown step outcome `{}`", self.outcome))?,
            stop_reason: self.stop_reason,
        })
    }
}

impl Database {
    pub async fn append_step(&self, step: &StepRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO step_history (run_id, step_number, target_workers, qps,
                                       p50_ms, p95_ms, p99_ms, error_rate,
                                       queue_detected, outcome, stop_reason)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(step.run_id)
        .bind(step.step_number as i32)
        .bind(step.target_workers as i32)
        .bind(step.qps)
        .bind(step.p50_ms)
        .bind(step.p95_ms)
        .bind(step.p99_ms)
        .bind(step.error_rate)
        .bind(step.queue_detected)
        .bind(step.outcome.as_str())
        .bind(&step.stop_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>> {
        let rows: Vec<StepRow> = sqlx::query_as(
            "SELECT run_id, step_number, target_workers, qps, p50_ms, p95_ms, p99_ms,
                    error_rate, queue_detected, outcome, stop_reason
             FROM step_history WHERE run_id = $1 ORDER BY step_number",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StepRow::into_record).collect()
    }
}

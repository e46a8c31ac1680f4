//! Query-execution stream — append-only, batched inserts.
//!
//! Workers flush at most once per second (or per batch cap), so a batch is
//! inserted inside one transaction the way work blocks are generated: one
//! round trip per row but a single commit.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Database;
use crate::types::{ErrorClass, QueryExecution, QueryKind};

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    run_id: Uuid,
    worker_id: String,
    query_kind: String,
    start_time: DateTime<Utc>,
    elapsed_ms: f64,
    success: bool,
    warmup: bool,
    rows_returned: Option<i64>,
    error_class: Option<String>,
}

impl ExecutionRow {
    fn into_execution(self) -> Result<QueryExecution> {
        Ok(QueryExecution {
            run_id: self.run_id,
            worker_id: self.worker_id,
            kind: QueryKind::parse(&self.query_kind)
                .ok_or_else(|| anyhow!("unknown query kind `{}`", self.query_kind))?,
            start_time: self.start_time,
            elapsed_ms: self.elapsed_ms,
            success: self.success,
            warmup: self.warmup,
            rows_returned: self.rows_returned.map(|r| r.max(0) as u64),
            error_class: self
                .error_class
                .as_deref()
                .map(|s| {
                    ErrorClass::parse(s).ok_or_else(|| anyhow!("unknown error class `{s}`"))
                })
                .transpose()?,
        })
    }
}

impl Database {
    pub async fn append_executions(&self, rows: &[QueryExecution]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for e in rows {
            sqlx::query(
                "INSERT INTO query_executions (run_id, worker_id, query_kind, start_time,
                                               elapsed_ms, success, warmup, rows_returned, error_class)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(e.run_id)
            .bind(&e.worker_id)
            .bind(e.kind.as_str())
            .bind(e.start_time)
            .bind(e.elapsed_ms)
            .bind(e.success)
            .bind(e.warmup)
            .bind(e.rows_returned.map(|r| r as i64))
            .bind(e.error_class.map(|c| c.as_str()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn executions(&self, run_id: Uuid) -> Result<Vec<QueryExecution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            "SELECT run_id, worker_id, query_kind, start_time, elapsed_ms,
                    success, warmup, rows_returned, error_class
             FROM query_executions WHERE run_id = $1 ORDER BY start_time",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    pub async fn execution_count(&self, run_id: Uuid) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM query_executions WHERE run_id = $1")
                .bind(run_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }
}

//! Worker heartbeat operations — upsert by `(run_id, worker_id)`.
//!
//! Each heartbeat replaces the previous row for its key; readers always see
//! the latest state per worker. The single non-worker write is
//! `mark_worker_dead`, the coordinator's liveness carve-out, which flips the
//! status of an already-stale row in place.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::Database;
use crate::types::{Phase, WorkerHeartbeat, WorkerStatus};

#[derive(sqlx::FromRow)]
struct HeartbeatRow {
    run_id: Uuid,
    worker_id: String,
    status: String,
    phase: String,
    last_heartbeat: DateTime<Utc>,
    heartbeat_count: i64,
    active_connections: i32,
    target_connections: i32,
    queries_processed: i64,
    error_count: i64,
    last_error: Option<String>,
    resources: Option<Value>,
}

impl HeartbeatRow {
    fn into_heartbeat(self) -> Result<WorkerHeartbeat> {
        Ok(WorkerHeartbeat {
            run_id: self.run_id,
            worker_id: self.worker_id,
            status: WorkerStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("unknown worker status `{}`", self.status))?,
            phase: Phase::parse(&self.phase)
                .ok_or_else(|| anyhow!("unknown phase `{}`", self.phase))?,
            last_heartbeat: self.last_heartbeat,
            heartbeat_count: self.heartbeat_count.max(0) as u64,
            active_connections: self.active_connections.max(0) as u32,
            target_connections: self.target_connections.max(0) as u32,
            queries_processed: self.queries_processed.max(0) as u64,
            error_count: self.error_count.max(0) as u64,
            last_error: self.last_error,
            resources: self.resources.map(serde_json::from_value).transpose()?,
        })
    }
}

impl Database {
    pub async fn upsert_heartbeat(&self, hb: &WorkerHeartbeat) -> Result<()> {
        sqlx::query(
            "INSERT INTO heartbeats (run_id, worker_id, status, phase, last_heartbeat,
                                     heartbeat_count, active_connections, target_connections,
                                     queries_processed, error_count, last_error, resources)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (run_id, worker_id) DO UPDATE SET
               status = EXCLUDED.status, phase = EXCLUDED.phase,
               last_heartbeat = EXCLUDED.last_heartbeat,
               heartbeat_count = EXCLUDED.heartbeat_count,
               active_connections = EXCLUDED.active_connections,
               target_connections = EXCLUDED.target_connections,
               queries_processed = EXCLUDED.queries_processed,
               error_count = EXCLUDED.error_count,
               last_error = EXCLUDED.last_error,
               resources = EXCLUDED.resources",
        )
        .bind(hb.run_id)
        .bind(&hb.worker_id)
        .bind(hb.status.as_str())
        .bind(hb.phase.as_str())
        .bind(hb.last_heartbeat)
        .bind(hb.heartbeat_count as i64)
        .bind(hb.active_connections as i32)
        .bind(hb.target_connections as i32)
        .bind(hb.queries_processed as i64)
        .bind(hb.error_count as i64)
        .bind(&hb.last_error)
        .bind(hb.resources.as_ref().map(serde_json::to_value).transpose()?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All heartbeat rows for a run, ordered by worker_id.
    pub async fn heartbeats(&self, run_id: Uuid) -> Result<Vec<WorkerHeartbeat>> {
        let rows: Vec<HeartbeatRow> = sqlx::query_as(
            "SELECT run_id, worker_id, status, phase, last_heartbeat, heartbeat_count,
                    active_connections, target_connections, queries_processed, error_count,
                    last_error, resources
             FROM heartbeats WHERE run_id = $1 ORDER BY worker_id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(HeartbeatRow::into_heartbeat).collect()
    }

    /// Coordinator liveness carve-out: flip a stale worker's status to DEAD.
    pub async fn mark_worker_dead(&self, run_id: Uuid, worker_id: &str) -> Result<()> {
        sqlx::query("UPDATE heartbeats SET status = 'DEAD' WHERE run_id = $1 AND worker_id = $2")
            .bind(run_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

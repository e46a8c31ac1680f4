//! Metric-snapshot stream — per-worker per-second rows, append-only.

use anyhow::{anyhow, Result};
use serde_json::Value;
use uuid::Uuid;

use super::Database;
use crate::types::{MetricSnapshot, Phase};

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    run_id: Uuid,
    worker_id: String,
    elapsed_seconds: i64,
    phase: String,
    active_connections: i32,
    target_connections: i32,
    ops: i64,
    errors: i64,
    p50_ms: f64,
    p95_ms: f64,
    p99_ms: f64,
    ops_by_kind: Value,
    queue_depth: Option<i64>,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<MetricSnapshot> {
        Ok(MetricSnapshot {
            run_id: self.run_id,
            worker_id: self.worker_id,
            elapsed_seconds: self.elapsed_seconds.max(0) as u64,
            phase: Phase::parse(&self.phase)
                .ok_or_else(|| anyhow!("unknown phase `{}`", self.phase))?,
            active_connections: self.active_connections.max(0) as u32,
            target_connections: self.target_connections.max(0) as u32,
            ops: self.ops.max(0) as u64,
            errors: self.errors.max(0) as u64,
            p50_ms: self.p50_ms,
            p95_ms: self.p95_ms,
            p99_ms: self.p99_ms,
            ops_by_kind: serde_json::from_value(self.ops_by_kind)?,
            queue_depth: self.queue_depth.map(|q| q.max(0) as u64),
        })
    }
}

impl Database {
    pub async fn append_snapshot(&self, snap: &MetricSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO metric_snapshots (run_id, worker_id, elapsed_seconds, phase,
                                           active_connections, target_connections, ops, errors,
                                           p50_ms, p95_ms, p99_ms, ops_by_kind, queue_depth)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(snap.run_id)
        .bind(&snap.worker_id)
        .bind(snap.elapsed_seconds as i64)
        .bind(snap.phase.as_str())
        .bind(snap.active_connections as i32)
        .bind(snap.target_connections as i32)
        .bind(snap.ops as i64)
        .bind(snap.errors as i64)
        .bind(snap.p50_ms)
        .bind(snap.p95_ms)
        .bind(snap.p99_ms)
        .bind(serde_json::to_value(&snap.ops_by_kind)?)
        .bind(snap.queue_depth.map(|q| q as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn snapshots(&self, run_id: Uuid, since_bucket: u64) -> Result<Vec<MetricSnapshot>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            "SELECT run_id, worker_id, elapsed_seconds, phase, active_connections,
                    target_connections, ops, errors, p50_ms, p95_ms, p99_ms,
                    ops_by_kind, queue_depth
             FROM metric_snapshots
             WHERE run_id = $1 AND elapsed_seconds >= $2
             ORDER BY elapsed_seconds, worker_id",
        )
        .bind(run_id)
        .bind(since_bucket as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }
}

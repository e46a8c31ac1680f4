//! # Database — PostgreSQL Storage Layer
//!
//! Async store operations over `sqlx::PgPool`. The control plane treats the
//! store as append-only except for the heartbeat upsert-by-key and the run
//! row, which only the coordinator mutates.
//!
//! ## Schema
//!
//! - `runs`: run row — scenario snapshot, status/phase, counters, FIND_MAX
//!   state, next_sequence_id
//! - `control_events`: per-run append-only command log, unique
//!   `(run_id, sequence_id)`
//! - `heartbeats`: latest state per `(run_id, worker_id)`, upserts only
//! - `query_executions`: per-operation records, batched appends
//! - `metric_snapshots`: per-worker per-second series
//! - `step_history`: FIND_MAX step records
//! - `run_summaries`: exactly one final aggregate row per closed run
//!
//! ## Module Structure
//!
//! Operations are split into submodules by domain: [`runs`], [`events`],
//! [`heartbeats`], [`executions`], [`snapshots`], [`steps`].
//!
//! ## Sync Bridge
//!
//! Workers and the coordinator run on plain threads (adapter calls block).
//! The [`crate::bus::PgBus`] wrapper bridges their synchronous bus calls
//! into these async operations via `tokio::runtime::Handle::block_on`.

mod events;
mod executions;
mod heartbeats;
mod runs;
mod snapshots;
mod steps;

use anyhow::Result;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL using the provided database URL.
    ///
    /// Manually parses the URL to preserve the full username — sqlx's
    /// built-in parser strips suffixes that some managed poolers require.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let url = url::Url::parse(database_url)?;
        let username = urlencoding::decode(url.username())?.into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username)
            .statement_cache_capacity(0);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;
        Ok(Database { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the coordination tables if they do not exist. Idempotent;
    /// called once at startup by whichever process reaches the store first.
    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS runs (
                run_id UUID PRIMARY KEY,
                scenario JSONB NOT NULL,
                status TEXT NOT NULL,
                phase TEXT NOT NULL,
                start_time TIMESTAMPTZ,
                warmup_end_time TIMESTAMPTZ,
                end_time TIMESTAMPTZ,
                total_workers_expected INT NOT NULL,
                workers_registered INT NOT NULL DEFAULT 0,
                workers_active INT NOT NULL DEFAULT 0,
                workers_completed INT NOT NULL DEFAULT 0,
                total_ops BIGINT NOT NULL DEFAULT 0,
                error_count BIGINT NOT NULL DEFAULT 0,
                current_qps DOUBLE PRECISION NOT NULL DEFAULT 0,
                find_max_state JSONB,
                next_sequence_id BIGINT NOT NULL DEFAULT 0,
                reason_code TEXT,
                reason_message TEXT,
                stop_requested BOOLEAN NOT NULL DEFAULT FALSE,
                abort_requested BOOLEAN NOT NULL DEFAULT FALSE
            )",
            "CREATE TABLE IF NOT EXISTS control_events (
                event_id UUID PRIMARY KEY,
                run_id UUID NOT NULL,
                sequence_id BIGINT NOT NULL,
                event_type TEXT NOT NULL,
                event_data JSONB NOT NULL,
                issued_at TIMESTAMPTZ NOT NULL,
                UNIQUE (run_id, sequence_id)
            )",
            "CREATE TABLE IF NOT EXISTS heartbeats (
                run_id UUID NOT NULL,
                worker_id TEXT NOT NULL,
                status TEXT NOT NULL,
                phase TEXT NOT NULL,
                last_heartbeat TIMESTAMPTZ NOT NULL,
                heartbeat_count BIGINT NOT NULL,
                active_connections INT NOT NULL,
                target_connections INT NOT NULL,
                queries_processed BIGINT NOT NULL,
                error_count BIGINT NOT NULL,
                last_error TEXT,
                resources JSONB,
                PRIMARY KEY (run_id, worker_id)
            )",
            "CREATE TABLE IF NOT EXISTS query_executions (
                id BIGSERIAL PRIMARY KEY,
                run_id UUID NOT NULL,
                worker_id TEXT NOT NULL,
                query_kind TEXT NOT NULL,
                start_time TIMESTAMPTZ NOT NULL,
                elapsed_ms DOUBLE PRECISION NOT NULL,
                success BOOLEAN NOT NULL,
                warmup BOOLEAN NOT NULL,
                rows_returned BIGINT,
                error_class TEXT
            )",
            "CREATE INDEX IF NOT EXISTS query_executions_run_idx
                ON query_executions (run_id)",
            "CREATE TABLE IF NOT EXISTS metric_snapshots (
                id BIGSERIAL PRIMARY KEY,
                run_id UUID NOT NULL,
                worker_id TEXT NOT NULL,
                elapsed_seconds BIGINT NOT NULL,
                phase TEXT NOT NULL,
                active_connections INT NOT NULL,
                target_connections INT NOT NULL,
                ops BIGINT NOT NULL,
                errors BIGINT NOT NULL,
                p50_ms DOUBLE PRECISION NOT NULL,
                p95_ms DOUBLE PRECISION NOT NULL,
                p99_ms DOUBLE PRECISION NOT NULL,
                ops_by_kind JSONB NOT NULL,
                queue_depth BIGINT
            )",
            "CREATE INDEX IF NOT EXISTS metric_snapshots_run_idx
                ON metric_snapshots (run_id, elapsed_seconds)",
            "CREATE TABLE IF NOT EXISTS step_history (
                run_id UUID NOT NULL,
                step_number INT NOT NULL,
                target_workers INT NOT NULL,
                qps DOUBLE PRECISION NOT NULL,
                p50_ms DOUBLE PRECISION NOT NULL,
                p95_ms DOUBLE PRECISION NOT NULL,
                p99_ms DOUBLE PRECISION NOT NULL,
                error_rate DOUBLE PRECISION NOT NULL,
                queue_detected BOOLEAN NOT NULL,
                outcome TEXT NOT NULL,
                stop_reason TEXT,
                PRIMARY KEY (run_id, step_number)
            )",
            "CREATE TABLE IF NOT EXISTS run_summaries (
                run_id UUID PRIMARY KEY,
                summary JSONB NOT NULL,
                written_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Health check: execute `SELECT 1` to verify database connectivity.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

//! # Postgres Adapter — sqlx-Backed Target
//!
//! Executor threads are plain OS threads that block on each operation, so
//! the adapter owns a tokio runtime solely to service sqlx and bridges into
//! it with `block_on` — the same sync-to-async seam the coordination layer
//! uses for the store.
//!
//! Binds are substituted through `$n` placeholders with `sqlx`'s typed
//! binding, never by string interpolation. Transport-fatal errors mark the
//! connection dead; the executor discards it and opens a fresh one before
//! its next operation.

use sqlx::postgres::PgConnection;
use sqlx::Connection as SqlxConnection;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::{Connection, Operation, OpResult, TargetAdapter};
use crate::error::AdapterError;
use crate::scenario::TargetConfig;
use crate::types::ErrorClass;
use crate::value_pool::BindValue;

pub struct PostgresAdapter {
    // Built lazily at the first `open`; admission-time validation must not
    // spin up a runtime.
    runtime: Mutex<Option<Arc<tokio::runtime::Runtime>>>,
}

impl PostgresAdapter {
    pub fn new() -> Self {
        PostgresAdapter {
            runtime: Mutex::new(None),
        }
    }

    fn runtime(&self) -> Result<Arc<tokio::runtime::Runtime>, AdapterError> {
        let mut guard = self.runtime.lock().unwrap();
        if let Some(rt) = guard.as_ref() {
            return Ok(Arc::clone(rt));
        }
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| AdapterError::Config(format!("tokio runtime: {e}")))?;
        let rt = Arc::new(rt);
        *guard = Some(Arc::clone(&rt));
        Ok(rt)
    }
}

impl Default for PostgresAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetAdapter for PostgresAdapter {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn open(&self, target: &TargetConfig) -> Result<Box<dyn Connection>, AdapterError> {
        let url = target
            .param_str("url")
            .ok_or_else(|| AdapterError::Config("postgres target requires params.url".into()))?
            .to_string();

        let runtime = self.runtime()?;
        let conn = runtime
            .block_on(PgConnection::connect(&url))
            .map_err(classify_open_error)?;

        Ok(Box::new(PgTargetConnection {
            runtime,
            conn: Some(conn),
            dead: false,
        }))
    }
}

fn classify_open_error(err: sqlx::Error) -> AdapterError {
    match &err {
        sqlx::Error::Configuration(e) => AdapterError::Config(e.to_string()),
        sqlx::Error::Database(db) => {
            // SQLSTATE class 28 = invalid authorization.
            if db.code().map(|c| c.starts_with("28")).unwrap_or(false) {
                AdapterError::Auth(db.to_string())
            } else {
                AdapterError::Connect(db.to_string())
            }
        }
        _ => AdapterError::Connect(err.to_string()),
    }
}

fn is_transport_fatal(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

struct PgTargetConnection {
    runtime: Arc<tokio::runtime::Runtime>,
    conn: Option<PgConnection>,
    dead: bool,
}

impl Connection for PgTargetConnection {
    fn execute(&mut self, op: &Operation) -> OpResult {
        let started = Instant::now();
        let Some(conn) = self.conn.as_mut() else {
            return OpResult::failed(0.0, ErrorClass::Transport, "connection closed");
        };

        let mut query = sqlx::query(&op.sql_template);
        for bind in &op.binds {
            query = match bind {
                BindValue::Int(v) => query.bind(*v),
                BindValue::Float(v) => query.bind(*v),
                BindValue::Text(v) => query.bind(v.clone()),
                BindValue::Bool(v) => query.bind(*v),
                BindValue::Null => query.bind(Option::<i64>::None),
            };
        }

        let expects_rows = op.expects_rows;
        let result = self.runtime.block_on(async {
            if expects_rows {
                let rows = query.fetch_all(&mut *conn).await?;
                Ok::<u64, sqlx::Error>(rows.len() as u64)
            } else {
                let done = query.execute(&mut *conn).await?;
                Ok(done.rows_affected())
            }
        });

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(rows) => OpResult::ok(elapsed_ms, Some(rows)),
            Err(err) if is_transport_fatal(&err) => {
                self.dead = true;
                OpResult::failed(elapsed_ms, ErrorClass::Transport, err.to_string())
            }
            Err(err) => OpResult::failed(elapsed_ms, ErrorClass::Execution, err.to_string()),
        }
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = self.runtime.block_on(conn.close());
        }
        self.dead = true;
    }

    fn is_dead(&self) -> bool {
        self.dead
    }
}

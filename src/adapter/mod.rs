//! # Target Adapter — Database Capability Seam
//!
//! Workers depend on this contract and never on target-specific features, so
//! adapters are interchangeable per scenario. The capability set is small:
//! `open`, `execute`, `close`, plus optional `cancel` and `server_timings`.
//! Selection is by name through [`create`] — an immutable registry, no
//! inheritance hierarchy.
//!
//! ## Failure encoding
//!
//! `execute` never returns `Err` for a failing query. User-facing errors are
//! encoded in the [`OpResult`]; transport-fatal conditions additionally mark
//! the connection dead (`is_dead()`) so the executor reopens before its next
//! operation. Only `open` can fail with an [`AdapterError`].

mod mock;
mod postgres;

pub use mock::MockAdapter;
pub use postgres::PostgresAdapter;

use std::sync::Arc;

use crate::error::{AdapterError, ConfigError};
use crate::scenario::TargetConfig;
use crate::types::{ErrorClass, QueryKind};
use crate::value_pool::BindValue;

/// One parameterized operation, ready to execute.
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: QueryKind,
    /// SQL with `$n` placeholders. Binds are substituted by the adapter,
    /// never by string interpolation.
    pub sql_template: String,
    pub binds: Vec<BindValue>,
    pub expects_rows: bool,
}

/// The outcome of a single operation. `elapsed_ms` is application-side wall
/// time unless the adapter captured an authoritative backend-side timing.
#[derive(Debug, Clone)]
pub struct OpResult {
    pub elapsed_ms: f64,
    pub success: bool,
    pub rows_returned: Option<u64>,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
}

impl OpResult {
    pub fn ok(elapsed_ms: f64, rows_returned: Option<u64>) -> Self {
        OpResult {
            elapsed_ms,
            success: true,
            rows_returned,
            error_class: None,
            error_message: None,
        }
    }

    pub fn failed(elapsed_ms: f64, class: ErrorClass, message: impl Into<String>) -> Self {
        OpResult {
            elapsed_ms,
            success: false,
            rows_returned: None,
            error_class: Some(class),
            error_message: Some(message.into()),
        }
    }
}

/// Optional backend-side readings taken after an operation.
#[derive(Debug, Clone, Default)]
pub struct ServerTimings {
    pub server_elapsed_ms: Option<f64>,
    pub queue_depth: Option<u64>,
}

/// Cross-thread cancellation for an in-flight operation. Executors register
/// their connection's handle so ABORT can reach operations that are blocked
/// inside `execute`.
pub trait CancelHandle: Send + Sync {
    fn cancel(&self);
}

/// A live connection owned by exactly one executor.
pub trait Connection: Send {
    /// Run one operation. Must not panic or return early on query failure;
    /// the failure is encoded in the result.
    fn execute(&mut self, op: &Operation) -> OpResult;

    /// Best-effort release; idempotent.
    fn close(&mut self);

    /// True once a transport-fatal error has been observed. The executor
    /// discards the connection and opens a fresh one.
    fn is_dead(&self) -> bool;

    /// Cancellation handle, when the target supports it.
    fn cancel_handle(&self) -> Option<Arc<dyn CancelHandle>> {
        None
    }

    /// Backend-side timings for the most recent operation, when available.
    fn server_timings(&self) -> Option<ServerTimings> {
        None
    }
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn Connection>")
    }
}

/// Adapter factory: opens connections to one kind of target.
pub trait TargetAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, target: &TargetConfig) -> Result<Box<dyn Connection>, AdapterError>;
}

/// Instantiate an adapter by its registered name. The registry is the only
/// process-wide state in the crate and is immutable.
pub fn create(name: &str) -> Result<Arc<dyn TargetAdapter>, ConfigError> {
    match name {
        "mock" => Ok(Arc::new(MockAdapter::new())),
        "postgres" => Ok(Arc::new(PostgresAdapter::new())),
        other => Err(ConfigError::UnknownAdapter(other.to_string())),
    }
}

//! # Error Taxonomy
//!
//! Expected failures are values, not panics. Each layer of the control plane
//! has its own error enum so callers can match on what actually went wrong:
//!
//! | Error | Raised by | Handling |
//! |-------|-----------|----------|
//! | [`ConfigError`] | scenario admission | surfaced to the caller, no run created |
//! | [`AdapterError`] | `TargetAdapter::open` | worker reports `last_error`, transitions to DRAINING |
//! | [`BusError`] | bus reads/writes | bounded exponential backoff, then run FAILED |
//! | [`InvariantError`] | anywhere | a bug — the coordinator fails the run immediately |
//!
//! Query-level failures are *not* errors: `Connection::execute` encodes them
//! in the returned `OpResult` so a failing statement never unwinds an
//! executor thread.

use thiserror::Error;

/// Scenario rejected at admission. No run record is created.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    #[error("unknown field `{0}`")]
    UnknownField(String),

    #[error("operation mix percentages sum to {0}, expected 100")]
    MixSum(u32),

    #[error("unknown adapter `{0}`")]
    UnknownAdapter(String),

    #[error("scenario file could not be parsed: {0}")]
    Parse(String),
}

/// Failures opening a connection to the target. Per-query failures are
/// reported through `OpResult`, never through this enum.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("adapter misconfigured: {0}")]
    Config(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("authentication failed: {0}")]
    Auth(String),
}

impl AdapterError {
    /// Short class tag used in heartbeat `last_error` fields.
    pub fn class(&self) -> &'static str {
        match self {
            AdapterError::Config(_) => "ADAPTER_CONFIG",
            AdapterError::Connect(_) => "ADAPTER_CONNECT",
            AdapterError::Auth(_) => "ADAPTER_AUTH",
        }
    }
}

/// Transient coordination-store failure. Workers retry with bounded backoff;
/// the coordinator treats a sustained outage as run FAILED with
/// reason `BUS_UNAVAILABLE`.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("bus store error: {0}")]
    Store(String),

    #[error("run {0} not found")]
    RunNotFound(uuid::Uuid),

    /// Not transient: the write itself violated an append-only invariant
    /// (sequence regression). Retrying cannot help; the run must fail.
    #[error("bus invariant violated: {0}")]
    Invariant(String),
}

/// A violated internal invariant (sequence regression, negative concurrency,
/// phase moving backwards). Indicates a bug; the run is failed immediately
/// without partial aggregates.
#[derive(Debug, Clone, Error)]
#[error("internal invariant violated: {0}")]
pub struct InvariantError(pub String);

/// Machine-readable reason codes carried on FAILED / CANCELLED runs.
pub mod reason {
    pub const REGISTRATION_TIMEOUT: &str = "REGISTRATION_TIMEOUT";
    pub const STOP_GRACE_TIMEOUT: &str = "STOP_GRACE_TIMEOUT";
    pub const ABORT_GRACE_TIMEOUT: &str = "ABORT_GRACE_TIMEOUT";
    pub const BUS_UNAVAILABLE: &str = "BUS_UNAVAILABLE";
    pub const WORKERS_DEAD: &str = "WORKERS_DEAD";
    pub const USER_ABORT: &str = "USER_ABORT";
    pub const SETUP_FAILURE: &str = "SETUP_FAILURE";
    pub const INVARIANT_VIOLATION: &str = "INVARIANT_VIOLATION";
    pub const MEASUREMENT_CAP: &str = "MEASUREMENT_CAP";
}

//! Structured error types for cadence.
//!
//! `EngineError` provides pattern-matchable errors for configuration mistakes
//! made at registration time. Everything that can go wrong *after* a call has
//! been accepted (a failing key/value store, a stale alarm, an empty pool) is
//! logged and absorbed instead of surfacing here.
//!
//! # Example
//!
//! ```ignore
//! use cadence::{ActionId, EngineError, Queue};
//!
//! match handle.register_permanent(ActionId(7), &[], Queue::Background) {
//!     Err(EngineError::EmptyEventSet { action }) => {
//!         eprintln!("action {} needs at least one event", action);
//!     }
//!     Err(e) => eprintln!("registration failed: {}", e),
//!     Ok(()) => {}
//! }
//! ```

use thiserror::Error;

use crate::core::ActionId;

/// Errors returned by the engine and the wake scheduler.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An action was registered with no required events.
    #[error("action {action} must require at least one event")]
    EmptyEventSet { action: ActionId },

    /// No live join action has this id.
    #[error("no action registered with id {action}")]
    UnknownAction { action: ActionId },

    /// The engine was stopped; it accepts no further registrations or runs.
    #[error("engine has been stopped")]
    EngineStopped,

    /// `start` was called outside a tokio runtime.
    #[error("no tokio runtime available to drive timers")]
    NoRuntime,

    /// The background worker thread could not be spawned.
    #[error("failed to spawn background worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// The wake scheduler was stopped and must be reopened before use.
    #[error("wake scheduler has been stopped")]
    SchedulerStopped,

    /// Tags are persisted newline-separated, so they may not contain one.
    #[error("tag for action {action} contains a newline")]
    InvalidTag { action: ActionId },

    /// Persisted wake state could not be decoded.
    #[error(transparent)]
    Persisted(#[from] PersistError),
}

/// Errors decoding the persisted wake list.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PersistError {
    /// The four parallel fields disagree on the number of entries.
    #[error("persisted field `{field}` has {found} entries, expected {expected}")]
    FieldCount {
        field: &'static str,
        expected: usize,
        found: usize,
    },

    /// A numeric field did not parse.
    #[error("persisted field `{field}` has invalid value {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

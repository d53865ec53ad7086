/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 */

use super::types::{LimiterName, LockMode};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Circuit breaker errors with serialization support
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum BreakerError {
    #[error("Permit for gate '{gate}' was already released")]
    #[diagnostic(
        code(breaker::permit_released),
        help("A permit is released exactly once. Drop it or call release() a single time.")
    )]
    PermitReleased { gate: LimiterName },

    #[error("Outcome for permit of gate '{gate}' was already reported")]
    #[diagnostic(
        code(breaker::outcome_reported),
        help("Report either success or failure once per permit.")
    )]
    OutcomeAlreadyReported { gate: LimiterName },

    #[error("Invalid circuit breaker configuration: {0}")]
    #[diagnostic(
        code(breaker::invalid_config),
        help("Failure threshold must be positive and durations non-zero.")
    )]
    InvalidConfig(String),
}

/// Result of running an operation through a circuit breaker
#[derive(Error, Debug)]
pub enum CallError<E> {
    #[error("Circuit breaker '{gate}' rejected the call")]
    Rejected { gate: LimiterName },

    #[error("Guarded call failed: {0}")]
    Failed(E),
}

impl<E> CallError<E> {
    /// True when the gate refused to issue a permit
    pub fn is_rejected(&self) -> bool {
        matches!(self, CallError::Rejected { .. })
    }

    /// The operation's own error, if the call was admitted
    pub fn into_failure(self) -> Option<E> {
        match self {
            CallError::Failed(e) => Some(e),
            CallError::Rejected { .. } => None,
        }
    }
}

/// Keyed lock errors with serialization support
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum LockError {
    #[error("No lock exists for key {key}")]
    #[diagnostic(
        code(keyed::not_locked),
        help("unlock must be paired with a prior lock_read/lock_write on the same key.")
    )]
    NotLocked { key: String },

    #[error("Current thread does not hold the {mode} lock for key {key}")]
    #[diagnostic(
        code(keyed::not_held),
        help("Locks are owned by the thread that acquired them.")
    )]
    NotHeld { key: String, mode: LockMode },

    #[error("Cannot upgrade read lock to write lock for key {key}")]
    #[diagnostic(
        code(keyed::upgrade_unsupported),
        help("Release the read lock before requesting the write lock.")
    )]
    UpgradeUnsupported { key: String },

    #[error("Failed to start lock sweeper: {0}")]
    #[diagnostic(code(keyed::sweeper_spawn), help("Check thread limits of the process."))]
    SweeperSpawn(String),
}

/// Executor and pool admission errors with serialization support
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum ExecutorError {
    #[error("Executor '{executor}' rejected task: busy after waiting {waited_ms}ms")]
    #[diagnostic(
        code(executor::busy),
        help("All admission slots are taken. Back off and retry, or raise max_pending_tasks.")
    )]
    Busy { executor: LimiterName, waited_ms: u64 },

    #[error("Executor '{executor}' cannot admit {requested} tasks at once (capacity {capacity})")]
    #[diagnostic(
        code(executor::batch_too_large),
        help("Split the batch into chunks no larger than the admission capacity.")
    )]
    BatchTooLarge {
        executor: LimiterName,
        requested: usize,
        capacity: usize,
    },

    #[error("Executor '{executor}' received an empty batch")]
    #[diagnostic(code(executor::empty_batch))]
    EmptyBatch { executor: LimiterName },

    #[error("Executor '{executor}' has been shut down")]
    #[diagnostic(
        code(executor::shutdown),
        help("No new work is accepted after shutdown.")
    )]
    Shutdown { executor: LimiterName },

    #[error("Interrupted while waiting for admission to '{executor}'")]
    #[diagnostic(code(executor::interrupted))]
    Interrupted { executor: LimiterName },

    #[error("Invalid executor configuration: {0}")]
    #[diagnostic(
        code(executor::invalid_config),
        help("Capacities must be positive and min_threads <= max_threads.")
    )]
    InvalidConfig(String),

    #[error("Failed to spawn worker thread: {0}")]
    #[diagnostic(code(executor::spawn_failed), help("Check thread limits of the process."))]
    SpawnFailed(String),
}

impl ExecutorError {
    /// Admission rejections are recoverable; the caller may back off and retry
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ExecutorError::Busy { .. } | ExecutorError::Shutdown { .. }
        )
    }

    /// Name of the limiter that produced this error, when known
    pub fn limiter(&self) -> Option<&str> {
        match self {
            ExecutorError::Busy { executor, .. }
            | ExecutorError::BatchTooLarge { executor, .. }
            | ExecutorError::EmptyBatch { executor }
            | ExecutorError::Shutdown { executor }
            | ExecutorError::Interrupted { executor } => Some(executor.as_str()),
            ExecutorError::InvalidConfig(_) | ExecutorError::SpawnFailed(_) => None,
        }
    }
}

/// Outcome errors of an individual task
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum TaskError {
    #[error("Task panicked: {0}")]
    #[diagnostic(code(task::panicked))]
    Panicked(String),

    #[error("Task was cancelled before it ran")]
    #[diagnostic(code(task::cancelled))]
    Cancelled,
}

//! Error taxonomy for the orchestration core.
//!
//! Every public operation in every component returns [`CoreResult`]. Kinds
//! follow the taxonomy in the specification's error handling design:
//! transient host errors, worker failures, deadline/cancellation outcomes,
//! admission races, lock conflicts, configuration errors, persistence
//! corruption, session conflicts, and fatal host conditions.
//!
//! Modeled on `knhk-workflow-engine`'s `WorkflowError`: one flat enum with
//! `#[source]` chaining, a `severity()` classifier, and a `user_message()`
//! translator for the boundary (sentinel files, CLI output).

use thiserror::Error;

/// Result alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error kinds produced by the orchestration core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A host-level read (resource metric, file) failed but is expected to
    /// be transient; callers retry locally before surfacing this.
    #[error("transient host error reading {what}: {message}")]
    TransientHost {
        /// What was being read (e.g. "cpu_percent", "lock registry file").
        what: String,
        message: String,
    },

    /// A spawned worker exited non-zero or abnormally.
    #[error("worker for task {task_id} failed: exit={exit_code:?}")]
    WorkerFailed {
        task_id: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    /// A running task exceeded its deadline and was cancelled.
    #[error("task {task_id} exceeded its deadline")]
    DeadlineExceeded { task_id: String },

    /// Admission was rejected because the strategy flipped mid-dispatch.
    #[error("admission rejected for task {task_id}: {reason}")]
    AdmissionRejected { task_id: String, reason: String },

    /// A lock request could not be granted.
    #[error("lock conflict on {path}: held by {holder}")]
    LockConflict { path: String, holder: String },

    /// The configuration failed validation.
    #[error("configuration error in field `{field}`: {message}")]
    Configuration { field: String, message: String },

    /// A persisted store was corrupt and has been archived/reset.
    #[error("persistence corruption in {store}: {message}")]
    PersistenceCorrupt { store: String, message: String },

    /// A session-level conflict was detected and arbitrated.
    #[error("session conflict: {message}")]
    SessionConflict { message: String },

    /// The core has entered quiescent mode after repeated emergency strategies.
    #[error("fatal host condition: {message}")]
    FatalHost { message: String },

    /// The requested entity does not exist.
    #[error("not found: {what} `{id}`")]
    NotFound { what: String, id: String },

    /// I/O failure with no more specific kind.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// (De)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether this error represents a condition callers may retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::TransientHost { .. }
                | CoreError::AdmissionRejected { .. }
                | CoreError::LockConflict { .. }
        )
    }

    /// Stable short string for user-visible surfaces (sentinel files, notification log).
    pub fn kind_str(&self) -> &'static str {
        match self {
            CoreError::TransientHost { .. } => "transient_host",
            CoreError::WorkerFailed { .. } => "worker_failed",
            CoreError::DeadlineExceeded { .. } => "deadline_exceeded",
            CoreError::AdmissionRejected { .. } => "admission_rejected",
            CoreError::LockConflict { .. } => "lock_conflict",
            CoreError::Configuration { .. } => "configuration_error",
            CoreError::PersistenceCorrupt { .. } => "persistence_corrupt",
            CoreError::SessionConflict { .. } => "session_conflict",
            CoreError::FatalHost { .. } => "fatal_host",
            CoreError::NotFound { .. } => "not_found",
            CoreError::Io(_) => "io_error",
            CoreError::Serde(_) => "serde_error",
        }
    }

    /// Human-friendly message for CLI / notification surfaces.
    pub fn user_message(&self) -> String {
        match self {
            CoreError::NotFound { what, id } => format!("{what} `{id}` was not found."),
            CoreError::LockConflict { path, holder } => {
                format!("`{path}` is currently locked by {holder}.")
            }
            CoreError::FatalHost { message } => {
                format!("Orchestration core is in quiescent mode: {message}")
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_lock_conflict_are_recoverable() {
        let e = CoreError::TransientHost {
            what: "cpu_percent".into(),
            message: "read failed".into(),
        };
        assert!(e.is_recoverable());

        let e = CoreError::LockConflict {
            path: "/x".into(),
            holder: "writer-1".into(),
        };
        assert!(e.is_recoverable());
    }

    #[test]
    fn worker_failed_is_not_recoverable() {
        let e = CoreError::WorkerFailed {
            task_id: "t1".into(),
            exit_code: Some(1),
            stderr_tail: String::new(),
        };
        assert!(!e.is_recoverable());
    }

    #[test]
    fn kind_str_is_stable() {
        let e = CoreError::SessionConflict {
            message: "x".into(),
        };
        assert_eq!(e.kind_str(), "session_conflict");
    }
}

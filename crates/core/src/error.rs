//! Error types for the taskforge engine.

use crate::lifecycle::TaskState;
use crate::task::TaskId;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid submission; the task never entered the queue.
    #[error("validation error: {0}")]
    Validation(String),

    /// Dependency edge could not be installed.
    #[error("dependency error: {0}")]
    Dependency(#[from] taskforge_graph::Error),

    /// Illegal lifecycle transition; the state was left unchanged.
    #[error("illegal transition {from:?} -> {to:?} for task {task}: {reason}")]
    Transition {
        /// The task being transitioned.
        task: TaskId,
        /// State before the attempt.
        from: TaskState,
        /// Requested state.
        to: TaskState,
        /// Why the transition was rejected.
        reason: String,
    },

    /// A transition was requested while another is in flight for the
    /// same task.
    #[error("transition already in flight for task {task}")]
    TransitionBusy {
        /// The locked task.
        task: TaskId,
    },

    /// The executor callback failed.
    #[error("executor error for task {task}: {message}")]
    Executor {
        /// The failing task.
        task: TaskId,
        /// Executor-provided message.
        message: String,
    },

    /// Execution exceeded its bound.
    #[error("task {task} timed out after {limit_ms}ms")]
    Timeout {
        /// The timed-out task.
        task: TaskId,
        /// The configured limit.
        limit_ms: u64,
    },

    /// A required resource could not be reserved right now. Internal:
    /// the scheduler defers the task instead of surfacing this.
    #[error("resource contention on '{resource}'")]
    ResourceContention {
        /// The contended resource name.
        resource: String,
    },

    /// Snapshot write/read failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A snapshot exists but fails checksum or structural validation.
    #[error("corrupt snapshot {id}: {reason}")]
    CorruptSnapshot {
        /// Snapshot id.
        id: uuid::Uuid,
        /// What failed.
        reason: String,
    },

    /// Referenced task or snapshot does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Underlying filesystem failure.
    #[error("io error during {operation} on {}: {source}", path.display())]
    Io {
        /// The failing operation.
        operation: String,
        /// The path involved.
        path: PathBuf,
        /// OS error.
        source: std::io::Error,
    },

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The engine has shut down and no longer accepts requests.
    #[error("engine is shut down")]
    Shutdown,
}

impl Error {
    /// Build a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Build a transition error.
    pub fn transition(
        task: TaskId,
        from: TaskState,
        to: TaskState,
        reason: impl Into<String>,
    ) -> Self {
        Self::Transition {
            task,
            from,
            to,
            reason: reason.into(),
        }
    }

    /// Build an executor error.
    pub fn executor(task: TaskId, message: impl Into<String>) -> Self {
        Self::Executor {
            task,
            message: message.into(),
        }
    }

    /// Build a persistence error.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Build a not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Build an io error with context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>, operation: impl Into<String>) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Build a serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

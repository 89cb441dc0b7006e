//! Store error taxonomy.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An exclusive file lock could not be acquired within the timeout.
    #[error("timed out waiting for lock on {0}")]
    LockTimeout(PathBuf),

    /// The requested project or task does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// A status transition that is not an edge in the task state graph.
    #[error("invalid status transition for task {task_id}: {from} -> {to}")]
    Conflict {
        task_id: String,
        from: String,
        to: String,
    },

    /// A store file exists but does not parse as the expected JSON shape.
    #[error("corrupt store file {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    /// Underlying filesystem failure.
    #[error("store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the error indicates a missing entity (maps to HTTP 404).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when the error indicates an illegal transition (maps to HTTP 409).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

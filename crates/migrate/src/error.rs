use std::path::PathBuf;

use quire_schema::SchemaValidationError;
use quire_storage::{Retryable, StorageError};
use uuid::Uuid;

/// Errors surfaced by migration requests and the job runner.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// The requested schema change is invalid. No job is created.
    #[error("invalid schema change: {0}")]
    Validation(#[from] SchemaValidationError),

    /// Another job for the same branch and schema is still running, or the
    /// target edge is mid-activation.
    #[error("migration conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("migration job not found: {0}")]
    JobNotFound(Uuid),

    /// A record the job refers to is missing or inconsistent.
    #[error("{0}")]
    InvalidJob(String),

    /// The job was cancelled while running.
    #[error("cancelled")]
    Cancelled,

    /// No node finished within the stall timeout.
    #[error("stalled: no progress for {secs}s")]
    Stalled { secs: u64 },

    /// A node task panicked or was dropped.
    #[error("node task failed: {0}")]
    Task(String),
}

impl Retryable for MigrationError {
    fn is_retryable(&self) -> bool {
        match self {
            MigrationError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Errors returned by a document index backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    /// The index cannot be reached; the request may be retried.
    #[error("search index unavailable: {0}")]
    Unavailable(String),

    /// The index refused the request.
    #[error("search index rejected {id}: {reason}")]
    Rejected { id: String, reason: String },

    /// Reading the records a document is built from failed.
    #[error("could not load index source: {0}")]
    Source(String),
}

impl Retryable for IndexError {
    fn is_retryable(&self) -> bool {
        matches!(self, IndexError::Unavailable(_))
    }
}

/// Errors raised while loading a `QuireConfig`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

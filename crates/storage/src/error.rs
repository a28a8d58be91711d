/// All errors that can be returned by a ContentStore implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency control conflict: a record read inside the
    /// snapshot was modified by another transaction before commit.
    #[error("concurrent conflict on {record}: expected revision {expected_revision}")]
    ConcurrentConflict {
        record: String,
        expected_revision: u64,
    },

    /// No record of the given kind with the given id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// An insert collided with an existing record.
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// A backend-specific storage error (connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StorageError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl ToString) -> Self {
        StorageError::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }
}

/// Errors that a retry loop may safely re-run the transaction for.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::ConcurrentConflict { .. } | StorageError::Backend(_)
        )
    }
}

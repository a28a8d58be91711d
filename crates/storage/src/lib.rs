//! Quire content store: the `ContentStore` trait, its record types and
//! errors, the in-memory backend, a transaction retry helper, and a
//! backend-agnostic conformance suite.

pub mod conformance;
mod error;
mod memory;
mod record;
mod retry;
mod traits;

pub use error::{Retryable, StorageError};
pub use memory::{MemorySnapshot, MemoryStore};
pub use record::{
    now_rfc3339, BranchRecord, BranchSchemaEdgeRecord, ConflictWarning, ContainerRecord,
    EdgeMigrationStatus, HeadKey, JobStatus, MigrationCause, MigrationJobRecord, MigrationType,
    PendingIndexAction, PendingIndexEntryRecord, ProjectRecord, Reference, SchemaContainerRecord,
};
pub use retry::{retry_with_backoff, with_store_retry, RetryPolicy};
pub use traits::ContentStore;

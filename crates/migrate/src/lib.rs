//! Quire schema migration runtime.
//!
//! Turns schema changes into migration jobs and runs them: every node
//! container bound to the old schema version in a branch is migrated to the
//! new version, the branch's active version is flipped, and the search index
//! is brought in line afterwards.
//!
//! [`MigrationService`] is the entry point; the pieces it wires together
//! ([`JobRunner`], [`NodeMigrator`], [`BranchSchemaAssignment`],
//! [`IndexSyncCoordinator`]) are usable on their own.

pub mod branch;
pub mod config;
pub mod error;
pub mod events;
pub mod index;
pub mod job;
pub mod node;
pub mod service;

pub use branch::BranchSchemaAssignment;
pub use config::{read_config, IndexConfig, MigrationConfig, QuireConfig};
pub use error::{ConfigError, IndexError, MigrationError};
pub use events::{
    BranchAssignEventModel, BroadcastEventBus, EventBus, MigrationEvent, MigrationEventModel,
};
pub use index::{
    document_id, node_document, node_index_mapping, DocumentIndex, IndexAction, IndexEntry,
    IndexOp, IndexSyncCoordinator, IndexSyncReport, MemoryIndex, StoredDocument,
};
pub use job::{CancelToken, JobContext, JobRunner, MigrationProgress, NodeOutcome};
pub use node::{migrated_container_id, NodeMigration, NodeMigrator};
pub use service::{AssignOutcome, JobStatusView, MigrationService, SchemaUpdateOutcome};

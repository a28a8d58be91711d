use async_trait::async_trait;
use quire_schema::SchemaVersion;
use uuid::Uuid;

use crate::error::StorageError;
use crate::record::{
    BranchRecord, BranchSchemaEdgeRecord, ContainerRecord, HeadKey, JobStatus, MigrationJobRecord,
    PendingIndexEntryRecord, ProjectRecord, SchemaContainerRecord,
};

/// The storage trait for Quire content backends.
///
/// A `ContentStore` provides transactional storage for projects, branches,
/// schema families and their versions, branch → schema version edges,
/// migration jobs, the append-only node containers with their head
/// pointers, and the queue of undelivered search index work.
///
/// ## Snapshot Semantics
///
/// All mutating operations take `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()`: start a transaction, returns a `Snapshot`
/// 2. Call `*_for_update` reads and mutating methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)`: commit and consume the transaction
///    OR `abort_snapshot(snapshot)`: roll back and consume the transaction
///
/// Reads inside a snapshot see the snapshot's own writes. If a `Snapshot` is
/// dropped without committing, nothing it staged becomes visible.
///
/// ## OCC Conflict Detection
///
/// Every record read through a `*_for_update` method (including the
/// listing methods, which cover the whole listed family) is validated at
/// commit. If another transaction committed a change to any of them in the
/// meantime, `commit_snapshot` returns `StorageError::ConcurrentConflict`
/// and applies nothing.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be shared between the
/// job runner's worker tasks.
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all mutations durable atomically.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Projects, branches, schemas (within snapshot) ────────────────────────

    async fn put_project(
        &self,
        snapshot: &mut Self::Snapshot,
        record: ProjectRecord,
    ) -> Result<(), StorageError>;

    async fn put_branch(
        &self,
        snapshot: &mut Self::Snapshot,
        record: BranchRecord,
    ) -> Result<(), StorageError>;

    async fn get_schema_container_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        id: Uuid,
    ) -> Result<SchemaContainerRecord, StorageError>;

    async fn put_schema_container(
        &self,
        snapshot: &mut Self::Snapshot,
        record: SchemaContainerRecord,
    ) -> Result<(), StorageError>;

    /// Insert or replace a schema version (replacement only updates links).
    async fn put_schema_version(
        &self,
        snapshot: &mut Self::Snapshot,
        version: SchemaVersion,
    ) -> Result<(), StorageError>;

    // ── Branch → schema version edges (within snapshot) ─────────────────────

    /// All edges of one schema family in one branch.
    ///
    /// The whole family is covered by the conflict check, including edges
    /// that another transaction adds concurrently.
    async fn list_branch_schema_edges_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        branch_id: Uuid,
        schema_id: Uuid,
    ) -> Result<Vec<BranchSchemaEdgeRecord>, StorageError>;

    /// Insert or replace the edge keyed by (branch, version).
    async fn put_branch_schema_edge(
        &self,
        snapshot: &mut Self::Snapshot,
        edge: BranchSchemaEdgeRecord,
    ) -> Result<(), StorageError>;

    // ── Migration jobs (within snapshot) ─────────────────────────────────────

    /// Returns `Err(StorageError::AlreadyExists)` if the id is taken.
    async fn insert_job(
        &self,
        snapshot: &mut Self::Snapshot,
        job: MigrationJobRecord,
    ) -> Result<(), StorageError>;

    /// Returns `Err(StorageError::NotFound)` if the job does not exist.
    async fn get_job_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        id: Uuid,
    ) -> Result<MigrationJobRecord, StorageError>;

    /// Returns `Err(StorageError::NotFound)` if the job does not exist.
    async fn update_job(
        &self,
        snapshot: &mut Self::Snapshot,
        job: MigrationJobRecord,
    ) -> Result<(), StorageError>;

    /// All jobs of one (branch, schema family), covered by the conflict check.
    async fn list_jobs_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        branch_id: Uuid,
        schema_id: Uuid,
    ) -> Result<Vec<MigrationJobRecord>, StorageError>;

    // ── Node containers (within snapshot) ────────────────────────────────────

    /// Current head container of (node, language, branch), if any.
    async fn get_container_head_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        key: &HeadKey,
    ) -> Result<Option<ContainerRecord>, StorageError>;

    /// Append a container. Returns `Err(StorageError::AlreadyExists)` if the
    /// id is taken; containers are never overwritten.
    async fn insert_container(
        &self,
        snapshot: &mut Self::Snapshot,
        container: ContainerRecord,
    ) -> Result<(), StorageError>;

    /// Point the head of (node, language, branch) at `container_id`.
    async fn set_container_head(
        &self,
        snapshot: &mut Self::Snapshot,
        key: &HeadKey,
        container_id: Uuid,
    ) -> Result<(), StorageError>;

    // ── Pending index entries (within snapshot) ──────────────────────────────

    /// Insert or replace a queued index entry.
    async fn put_pending_index_entry(
        &self,
        snapshot: &mut Self::Snapshot,
        entry: PendingIndexEntryRecord,
    ) -> Result<(), StorageError>;

    /// Remove a queued index entry. Removing a missing entry is not an error.
    async fn delete_pending_index_entry(
        &self,
        snapshot: &mut Self::Snapshot,
        id: Uuid,
    ) -> Result<(), StorageError>;

    // ── Query operations (outside snapshot) ──────────────────────────────────

    async fn get_project(&self, id: Uuid) -> Result<ProjectRecord, StorageError>;

    async fn get_branch(&self, id: Uuid) -> Result<BranchRecord, StorageError>;

    /// All branches of all projects.
    async fn list_branches(&self) -> Result<Vec<BranchRecord>, StorageError>;

    async fn get_schema_container(&self, id: Uuid) -> Result<SchemaContainerRecord, StorageError>;

    async fn get_schema_version(&self, id: Uuid) -> Result<SchemaVersion, StorageError>;

    /// All versions of one schema family, in version order.
    async fn list_schema_versions(&self, schema_id: Uuid)
        -> Result<Vec<SchemaVersion>, StorageError>;

    async fn list_branch_schema_edges(
        &self,
        branch_id: Uuid,
    ) -> Result<Vec<BranchSchemaEdgeRecord>, StorageError>;

    async fn get_job(&self, id: Uuid) -> Result<MigrationJobRecord, StorageError>;

    /// All jobs, optionally filtered by status, oldest first.
    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
    ) -> Result<Vec<MigrationJobRecord>, StorageError>;

    async fn get_container(&self, id: Uuid) -> Result<ContainerRecord, StorageError>;

    async fn get_container_head(&self, key: &HeadKey)
        -> Result<Option<ContainerRecord>, StorageError>;

    /// Head containers in `branch_id` bound to `version_id`, ordered by node
    /// and language.
    async fn list_container_heads(
        &self,
        branch_id: Uuid,
        version_id: Uuid,
    ) -> Result<Vec<ContainerRecord>, StorageError>;

    /// Containers created by a migration job.
    async fn list_containers_by_job(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<ContainerRecord>, StorageError>;

    /// Queued index entries, oldest first.
    async fn list_pending_index_entries(&self)
        -> Result<Vec<PendingIndexEntryRecord>, StorageError>;
}

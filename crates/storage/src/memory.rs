//! In-memory `ContentStore` backend with optimistic concurrency control.
//!
//! Every key carries a revision counter. A snapshot records the revision of
//! each key it reads and stages its writes locally; commit validates all
//! recorded revisions under the write lock and then applies the staged
//! writes, bumping their revisions. Edge and job writes also touch a family
//! marker key so that listing a family conflicts with concurrent inserts.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use quire_schema::SchemaVersion;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StorageError;
use crate::record::{
    BranchRecord, BranchSchemaEdgeRecord, ContainerRecord, HeadKey, JobStatus, MigrationJobRecord,
    PendingIndexEntryRecord, ProjectRecord, SchemaContainerRecord,
};
use crate::traits::ContentStore;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Key {
    Project(Uuid),
    Branch(Uuid),
    SchemaContainer(Uuid),
    SchemaVersion(Uuid),
    Edge { branch: Uuid, version: Uuid },
    EdgeFamily { branch: Uuid, schema: Uuid },
    Job(Uuid),
    JobFamily { branch: Uuid, schema: Uuid },
    Container(Uuid),
    Head(HeadKey),
    PendingIndex(Uuid),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Project(id) => write!(f, "project {}", id),
            Key::Branch(id) => write!(f, "branch {}", id),
            Key::SchemaContainer(id) => write!(f, "schema {}", id),
            Key::SchemaVersion(id) => write!(f, "schema version {}", id),
            Key::Edge { branch, version } => write!(f, "edge {}/{}", branch, version),
            Key::EdgeFamily { branch, schema } => write!(f, "edges of {}/{}", branch, schema),
            Key::Job(id) => write!(f, "job {}", id),
            Key::JobFamily { branch, schema } => write!(f, "jobs of {}/{}", branch, schema),
            Key::Container(id) => write!(f, "container {}", id),
            Key::Head(h) => write!(f, "head {}/{}/{}", h.node_uuid, h.language, h.branch_id),
            Key::PendingIndex(id) => write!(f, "pending index entry {}", id),
        }
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Project(ProjectRecord),
    Branch(BranchRecord),
    SchemaContainer(SchemaContainerRecord),
    SchemaVersion(Box<SchemaVersion>),
    Edge(BranchSchemaEdgeRecord),
    Job(Box<MigrationJobRecord>),
    Container(Box<ContainerRecord>),
    Head(Uuid),
    PendingIndex(Box<PendingIndexEntryRecord>),
    Marker,
    /// Staged deletion; never stored.
    Removed,
}

#[derive(Debug, Default)]
struct Tables {
    entries: BTreeMap<Key, Entry>,
    revisions: BTreeMap<Key, u64>,
}

impl Tables {
    fn revision(&self, key: &Key) -> u64 {
        self.revisions.get(key).copied().unwrap_or(0)
    }
}

/// An open transaction against a [`MemoryStore`].
#[derive(Debug)]
pub struct MemorySnapshot {
    id: u64,
    observed: BTreeMap<Key, u64>,
    staged: BTreeMap<Key, Entry>,
}

impl MemorySnapshot {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Process-local content store. Cheap to create; suitable for tests, the
/// CLI, and as the reference backend for the conformance suite.
#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
    failing_commits: AtomicUsize,
    commit_delay_ms: AtomicU64,
    next_snapshot: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
            failing_commits: AtomicUsize::new(0),
            commit_delay_ms: AtomicU64::new(0),
            next_snapshot: AtomicU64::new(1),
        }
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// `StorageError::Backend`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `n` commits fail with a retryable backend error.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Hold every commit for `delay` before it is validated. Zero disables.
    pub fn set_commit_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.commit_delay_ms.store(ms, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Backend("store unavailable".to_string()))
        }
    }

    /// Read `key` inside a snapshot, recording its revision.
    async fn read(
        &self,
        snapshot: &mut MemorySnapshot,
        key: &Key,
    ) -> Result<Option<Entry>, StorageError> {
        self.check_available()?;
        match snapshot.staged.get(key) {
            Some(Entry::Removed) => return Ok(None),
            Some(entry) => return Ok(Some(entry.clone())),
            None => {}
        }
        let tables = self.tables.read().await;
        snapshot
            .observed
            .entry(key.clone())
            .or_insert_with(|| tables.revision(key));
        Ok(tables.entries.get(key).cloned())
    }

    fn stage(
        &self,
        snapshot: &mut MemorySnapshot,
        key: Key,
        entry: Entry,
    ) -> Result<(), StorageError> {
        self.check_available()?;
        snapshot.staged.insert(key, entry);
        Ok(())
    }

    /// Committed entries matching `select`, overlaid with the snapshot's
    /// staged entries.
    async fn scan<T, F>(&self, snapshot: &MemorySnapshot, select: F) -> Vec<T>
    where
        F: Fn(&Key, &Entry) -> Option<T>,
    {
        let tables = self.tables.read().await;
        let mut merged: BTreeMap<&Key, &Entry> = tables.entries.iter().collect();
        for (key, entry) in &snapshot.staged {
            merged.insert(key, entry);
        }
        merged
            .into_iter()
            .filter_map(|(k, e)| select(k, e))
            .collect()
    }

    async fn committed<T>(
        &self,
        key: &Key,
        pick: impl Fn(&Entry) -> Option<T>,
    ) -> Result<Option<T>, StorageError> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables.entries.get(key).and_then(pick))
    }

    async fn container_for_head(
        &self,
        snapshot: &mut MemorySnapshot,
        container_id: Uuid,
    ) -> Result<Option<ContainerRecord>, StorageError> {
        match self.read(snapshot, &Key::Container(container_id)).await? {
            Some(Entry::Container(c)) => Ok(Some(*c)),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        self.check_available()?;
        Ok(MemorySnapshot {
            id: self.next_snapshot.fetch_add(1, Ordering::SeqCst),
            observed: BTreeMap::new(),
            staged: BTreeMap::new(),
        })
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        self.check_available()?;
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Backend("injected commit failure".to_string()));
        }
        let delay = self.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut tables = self.tables.write().await;
        for (key, expected) in &snapshot.observed {
            if tables.revision(key) != *expected {
                tracing::debug!(snapshot = snapshot.id, record = %key, "commit rejected");
                return Err(StorageError::ConcurrentConflict {
                    record: key.to_string(),
                    expected_revision: *expected,
                });
            }
        }
        let writes = snapshot.staged.len();
        for (key, entry) in snapshot.staged {
            *tables.revisions.entry(key.clone()).or_insert(0) += 1;
            match entry {
                Entry::Removed => {
                    tables.entries.remove(&key);
                }
                entry => {
                    tables.entries.insert(key, entry);
                }
            }
        }
        tracing::trace!(snapshot = snapshot.id, writes, "snapshot committed");
        Ok(())
    }

    async fn abort_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        tracing::trace!(snapshot = snapshot.id, "snapshot aborted");
        Ok(())
    }

    async fn put_project(
        &self,
        snapshot: &mut MemorySnapshot,
        record: ProjectRecord,
    ) -> Result<(), StorageError> {
        self.stage(snapshot, Key::Project(record.id), Entry::Project(record))
    }

    async fn put_branch(
        &self,
        snapshot: &mut MemorySnapshot,
        record: BranchRecord,
    ) -> Result<(), StorageError> {
        self.stage(snapshot, Key::Branch(record.id), Entry::Branch(record))
    }

    async fn get_schema_container_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        id: Uuid,
    ) -> Result<SchemaContainerRecord, StorageError> {
        match self.read(snapshot, &Key::SchemaContainer(id)).await? {
            Some(Entry::SchemaContainer(r)) => Ok(r),
            _ => Err(StorageError::not_found("schema", id)),
        }
    }

    async fn put_schema_container(
        &self,
        snapshot: &mut MemorySnapshot,
        record: SchemaContainerRecord,
    ) -> Result<(), StorageError> {
        let key = Key::SchemaContainer(record.id);
        self.stage(snapshot, key, Entry::SchemaContainer(record))
    }

    async fn put_schema_version(
        &self,
        snapshot: &mut MemorySnapshot,
        version: SchemaVersion,
    ) -> Result<(), StorageError> {
        self.stage(
            snapshot,
            Key::SchemaVersion(version.id),
            Entry::SchemaVersion(Box::new(version)),
        )
    }

    async fn list_branch_schema_edges_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        branch_id: Uuid,
        schema_id: Uuid,
    ) -> Result<Vec<BranchSchemaEdgeRecord>, StorageError> {
        let family = Key::EdgeFamily {
            branch: branch_id,
            schema: schema_id,
        };
        self.read(snapshot, &family).await?;
        Ok(self
            .scan(snapshot, |_, e| match e {
                Entry::Edge(edge) if edge.branch_id == branch_id && edge.schema_id == schema_id => {
                    Some(edge.clone())
                }
                _ => None,
            })
            .await)
    }

    async fn put_branch_schema_edge(
        &self,
        snapshot: &mut MemorySnapshot,
        edge: BranchSchemaEdgeRecord,
    ) -> Result<(), StorageError> {
        let family = Key::EdgeFamily {
            branch: edge.branch_id,
            schema: edge.schema_id,
        };
        self.stage(snapshot, family, Entry::Marker)?;
        let key = Key::Edge {
            branch: edge.branch_id,
            version: edge.version_id,
        };
        self.stage(snapshot, key, Entry::Edge(edge))
    }

    async fn insert_job(
        &self,
        snapshot: &mut MemorySnapshot,
        job: MigrationJobRecord,
    ) -> Result<(), StorageError> {
        let key = Key::Job(job.id);
        if self.read(snapshot, &key).await?.is_some() {
            return Err(StorageError::already_exists("job", job.id));
        }
        let family = Key::JobFamily {
            branch: job.branch_id,
            schema: job.schema_id,
        };
        self.stage(snapshot, family, Entry::Marker)?;
        self.stage(snapshot, key, Entry::Job(Box::new(job)))
    }

    async fn get_job_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        id: Uuid,
    ) -> Result<MigrationJobRecord, StorageError> {
        match self.read(snapshot, &Key::Job(id)).await? {
            Some(Entry::Job(job)) => Ok(*job),
            _ => Err(StorageError::not_found("job", id)),
        }
    }

    async fn update_job(
        &self,
        snapshot: &mut MemorySnapshot,
        job: MigrationJobRecord,
    ) -> Result<(), StorageError> {
        let key = Key::Job(job.id);
        if self.read(snapshot, &key).await?.is_none() {
            return Err(StorageError::not_found("job", job.id));
        }
        let family = Key::JobFamily {
            branch: job.branch_id,
            schema: job.schema_id,
        };
        self.stage(snapshot, family, Entry::Marker)?;
        self.stage(snapshot, key, Entry::Job(Box::new(job)))
    }

    async fn list_jobs_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        branch_id: Uuid,
        schema_id: Uuid,
    ) -> Result<Vec<MigrationJobRecord>, StorageError> {
        let family = Key::JobFamily {
            branch: branch_id,
            schema: schema_id,
        };
        self.read(snapshot, &family).await?;
        let mut jobs = self
            .scan(snapshot, |_, e| match e {
                Entry::Job(job) if job.branch_id == branch_id && job.schema_id == schema_id => {
                    Some((**job).clone())
                }
                _ => None,
            })
            .await;
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn get_container_head_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        key: &HeadKey,
    ) -> Result<Option<ContainerRecord>, StorageError> {
        match self.read(snapshot, &Key::Head(key.clone())).await? {
            Some(Entry::Head(container_id)) => {
                self.container_for_head(snapshot, container_id).await
            }
            _ => Ok(None),
        }
    }

    async fn insert_container(
        &self,
        snapshot: &mut MemorySnapshot,
        container: ContainerRecord,
    ) -> Result<(), StorageError> {
        let key = Key::Container(container.id);
        if self.read(snapshot, &key).await?.is_some() {
            return Err(StorageError::already_exists("container", container.id));
        }
        self.stage(snapshot, key, Entry::Container(Box::new(container)))
    }

    async fn set_container_head(
        &self,
        snapshot: &mut MemorySnapshot,
        key: &HeadKey,
        container_id: Uuid,
    ) -> Result<(), StorageError> {
        if self
            .container_for_head(snapshot, container_id)
            .await?
            .is_none()
        {
            return Err(StorageError::not_found("container", container_id));
        }
        self.stage(snapshot, Key::Head(key.clone()), Entry::Head(container_id))
    }

    async fn put_pending_index_entry(
        &self,
        snapshot: &mut MemorySnapshot,
        entry: PendingIndexEntryRecord,
    ) -> Result<(), StorageError> {
        let key = Key::PendingIndex(entry.id);
        self.stage(snapshot, key, Entry::PendingIndex(Box::new(entry)))
    }

    async fn delete_pending_index_entry(
        &self,
        snapshot: &mut MemorySnapshot,
        id: Uuid,
    ) -> Result<(), StorageError> {
        let key = Key::PendingIndex(id);
        if self.read(snapshot, &key).await?.is_none() {
            return Ok(());
        }
        self.stage(snapshot, key, Entry::Removed)
    }

    async fn get_project(&self, id: Uuid) -> Result<ProjectRecord, StorageError> {
        self.committed(&Key::Project(id), |e| match e {
            Entry::Project(r) => Some(r.clone()),
            _ => None,
        })
        .await?
        .ok_or_else(|| StorageError::not_found("project", id))
    }

    async fn get_branch(&self, id: Uuid) -> Result<BranchRecord, StorageError> {
        self.committed(&Key::Branch(id), |e| match e {
            Entry::Branch(r) => Some(r.clone()),
            _ => None,
        })
        .await?
        .ok_or_else(|| StorageError::not_found("branch", id))
    }

    async fn list_branches(&self) -> Result<Vec<BranchRecord>, StorageError> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .entries
            .values()
            .filter_map(|e| match e {
                Entry::Branch(b) => Some(b.clone()),
                _ => None,
            })
            .collect())
    }

    async fn get_schema_container(&self, id: Uuid) -> Result<SchemaContainerRecord, StorageError> {
        self.committed(&Key::SchemaContainer(id), |e| match e {
            Entry::SchemaContainer(r) => Some(r.clone()),
            _ => None,
        })
        .await?
        .ok_or_else(|| StorageError::not_found("schema", id))
    }

    async fn get_schema_version(&self, id: Uuid) -> Result<SchemaVersion, StorageError> {
        self.committed(&Key::SchemaVersion(id), |e| match e {
            Entry::SchemaVersion(v) => Some((**v).clone()),
            _ => None,
        })
        .await?
        .ok_or_else(|| StorageError::not_found("schema version", id))
    }

    async fn list_schema_versions(
        &self,
        schema_id: Uuid,
    ) -> Result<Vec<SchemaVersion>, StorageError> {
        self.check_available()?;
        let tables = self.tables.read().await;
        let mut versions: Vec<SchemaVersion> = tables
            .entries
            .values()
            .filter_map(|e| match e {
                Entry::SchemaVersion(v) if v.schema_id == schema_id => Some((**v).clone()),
                _ => None,
            })
            .collect();
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    async fn list_branch_schema_edges(
        &self,
        branch_id: Uuid,
    ) -> Result<Vec<BranchSchemaEdgeRecord>, StorageError> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .entries
            .values()
            .filter_map(|e| match e {
                Entry::Edge(edge) if edge.branch_id == branch_id => Some(edge.clone()),
                _ => None,
            })
            .collect())
    }

    async fn get_job(&self, id: Uuid) -> Result<MigrationJobRecord, StorageError> {
        self.committed(&Key::Job(id), |e| match e {
            Entry::Job(job) => Some((**job).clone()),
            _ => None,
        })
        .await?
        .ok_or_else(|| StorageError::not_found("job", id))
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
    ) -> Result<Vec<MigrationJobRecord>, StorageError> {
        self.check_available()?;
        let tables = self.tables.read().await;
        let mut jobs: Vec<MigrationJobRecord> = tables
            .entries
            .values()
            .filter_map(|e| match e {
                Entry::Job(job) if status.map_or(true, |s| job.status == s) => {
                    Some((**job).clone())
                }
                _ => None,
            })
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn get_container(&self, id: Uuid) -> Result<ContainerRecord, StorageError> {
        self.committed(&Key::Container(id), |e| match e {
            Entry::Container(c) => Some((**c).clone()),
            _ => None,
        })
        .await?
        .ok_or_else(|| StorageError::not_found("container", id))
    }

    async fn get_container_head(
        &self,
        key: &HeadKey,
    ) -> Result<Option<ContainerRecord>, StorageError> {
        self.check_available()?;
        let tables = self.tables.read().await;
        let Some(Entry::Head(container_id)) = tables.entries.get(&Key::Head(key.clone())) else {
            return Ok(None);
        };
        match tables.entries.get(&Key::Container(*container_id)) {
            Some(Entry::Container(c)) => Ok(Some((**c).clone())),
            _ => Ok(None),
        }
    }

    async fn list_container_heads(
        &self,
        branch_id: Uuid,
        version_id: Uuid,
    ) -> Result<Vec<ContainerRecord>, StorageError> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .entries
            .iter()
            .filter_map(|(k, e)| match (k, e) {
                (Key::Head(head), Entry::Head(container_id)) if head.branch_id == branch_id => {
                    match tables.entries.get(&Key::Container(*container_id)) {
                        Some(Entry::Container(c)) if c.schema_version_id == version_id => {
                            Some((**c).clone())
                        }
                        _ => None,
                    }
                }
                _ => None,
            })
            .collect())
    }

    async fn list_containers_by_job(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<ContainerRecord>, StorageError> {
        self.check_available()?;
        let tables = self.tables.read().await;
        let mut containers: Vec<ContainerRecord> = tables
            .entries
            .values()
            .filter_map(|e| match e {
                Entry::Container(c) if c.job_id == Some(job_id) => Some((**c).clone()),
                _ => None,
            })
            .collect();
        containers.sort_by(|a, b| a.head_key().cmp(&b.head_key()));
        Ok(containers)
    }

    async fn list_pending_index_entries(
        &self,
    ) -> Result<Vec<PendingIndexEntryRecord>, StorageError> {
        self.check_available()?;
        let tables = self.tables.read().await;
        let mut entries: Vec<PendingIndexEntryRecord> = tables
            .entries
            .values()
            .filter_map(|e| match e {
                Entry::PendingIndex(p) => Some((**p).clone()),
                _ => None,
            })
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }
}

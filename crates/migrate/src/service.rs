//! `MigrationService`: the application-lifetime entry point.
//!
//! Owns the collaborators (store, index, event bus), turns schema update and
//! assignment requests into migration jobs, and keeps track of the jobs
//! running in this process. Create one at startup and call
//! [`MigrationService::shutdown`] before exiting.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use quire_schema::{
    apply_to_version, diff_schemas, Schema, SchemaChange, SchemaValidationError, SchemaVersion,
    VersionReference,
};
use quire_storage::{
    now_rfc3339, with_store_retry, BranchRecord, BranchSchemaEdgeRecord, ConflictWarning,
    ContainerRecord, ContentStore, EdgeMigrationStatus, HeadKey, JobStatus, MigrationJobRecord,
    ProjectRecord, SchemaContainerRecord, StorageError,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::branch::{activate_in, BranchSchemaAssignment};
use crate::config::QuireConfig;
use crate::error::MigrationError;
use crate::events::EventBus;
use crate::index::{DocumentIndex, IndexSyncCoordinator, IndexSyncReport};
use crate::job::{CancelToken, JobRunner};

/// Answer to a schema update request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SchemaUpdateOutcome {
    /// The request matches the latest version; nothing was stored.
    NoDifference,
    /// A new version was cut; one job per branch that had the schema active.
    MigrationInvoked {
        version: VersionReference,
        jobs: Vec<Uuid>,
    },
}

impl SchemaUpdateOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            SchemaUpdateOutcome::NoDifference => "schema_update_no_difference_detected",
            SchemaUpdateOutcome::MigrationInvoked { .. } => "migration_invoked",
        }
    }
}

/// Answer to a branch assignment request.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignOutcome {
    /// The family had no active version in the branch; nothing to migrate.
    Activated(BranchSchemaEdgeRecord),
    AlreadyActive(BranchSchemaEdgeRecord),
    /// Content bound to the active version is migrated by this job.
    MigrationInvoked(MigrationJobRecord),
}

/// Read model of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub warnings: Vec<ConflictWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct RunningJob {
    handle: JoinHandle<Result<MigrationJobRecord, MigrationError>>,
    cancel: CancelToken,
}

pub struct MigrationService<S, I, E> {
    store: Arc<S>,
    index: Arc<IndexSyncCoordinator<S, I>>,
    assignment: Arc<BranchSchemaAssignment<S, E>>,
    runner: JobRunner<S, I, E>,
    config: QuireConfig,
    /// Jobs spawned by this service; a job removes itself when it ends.
    running: Arc<Mutex<HashMap<Uuid, RunningJob>>>,
    index_retry: Mutex<Option<JoinHandle<()>>>,
}

impl<S, I, E> MigrationService<S, I, E>
where
    S: ContentStore,
    I: DocumentIndex,
    E: EventBus,
{
    pub fn new(store: Arc<S>, index: Arc<I>, events: Arc<E>, config: QuireConfig) -> Self {
        let index = Arc::new(IndexSyncCoordinator::new(
            store.clone(),
            index,
            config.index.clone(),
        ));
        let assignment = Arc::new(BranchSchemaAssignment::new(
            store.clone(),
            events.clone(),
            config.migration.store_retry_limit,
        ));
        let runner = JobRunner::new(
            store.clone(),
            events,
            index.clone(),
            config.migration.clone(),
        );
        Self {
            store,
            index,
            assignment,
            runner,
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
            index_retry: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &QuireConfig {
        &self.config
    }

    /// The runner used for spawned jobs.
    pub fn runner(&self) -> &JobRunner<S, I, E> {
        &self.runner
    }

    fn retry_limit(&self) -> u32 {
        self.config.migration.store_retry_limit
    }

    /// Run `op` on a fresh snapshot, committing on success and aborting on
    /// error, retried as a whole on conflicts. `op` hands the snapshot back
    /// together with its result.
    async fn transact<T, F, Fut>(&self, op: F) -> Result<T, MigrationError>
    where
        F: Fn(S::Snapshot) -> Fut,
        Fut: Future<Output = (S::Snapshot, Result<T, MigrationError>)>,
    {
        let store = self.store.as_ref();
        let op = &op;
        with_store_retry(self.retry_limit(), || async move {
            let snap = store.begin_snapshot().await?;
            let (snap, result) = op(snap).await;
            match result {
                Ok(value) => {
                    store.commit_snapshot(snap).await?;
                    Ok(value)
                }
                Err(e) => {
                    let _ = store.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        })
        .await
    }

    // ── Setup ───────────────────────────────────────────────────────────────

    /// Create a project with its initial branch.
    pub async fn create_project(
        &self,
        name: &str,
        branch_name: &str,
    ) -> Result<(ProjectRecord, BranchRecord), MigrationError> {
        let project = ProjectRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        let branch = BranchRecord {
            id: Uuid::new_v4(),
            name: branch_name.to_string(),
            project_id: project.id,
        };
        let (p, b) = (&project, &branch);
        self.transact(|mut snap| async move {
            let result = self.put_project_in(&mut snap, p, b).await;
            (snap, result)
        })
        .await?;
        tracing::debug!(project = %project.name, branch = %branch.name, "project created");
        Ok((project, branch))
    }

    pub async fn create_branch(
        &self,
        project_id: Uuid,
        name: &str,
    ) -> Result<BranchRecord, MigrationError> {
        self.store.get_project(project_id).await?;
        let branch = BranchRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            project_id,
        };
        let b = &branch;
        self.transact(|mut snap| async move {
            let result = self.store.put_branch(&mut snap, b.clone()).await;
            (snap, result.map_err(MigrationError::from))
        })
        .await?;
        Ok(branch)
    }

    /// Register a new schema family with `schema` as version 1.
    pub async fn create_schema(&self, schema: Schema) -> Result<SchemaVersion, MigrationError> {
        let version = SchemaVersion::initial(Uuid::new_v4(), schema)?;
        let container = SchemaContainerRecord {
            id: version.schema_id,
            name: version.name().to_string(),
            latest_version_id: version.id,
        };
        let (v, c) = (&version, &container);
        self.transact(|mut snap| async move {
            let result = self.put_schema_in(&mut snap, v, c).await;
            (snap, result)
        })
        .await?;
        tracing::info!(schema = %version.name(), id = %version.schema_id, "schema created");
        Ok(version)
    }

    /// Store content of a new node under `version_id` in `branch_id`.
    pub async fn create_node(
        &self,
        branch_id: Uuid,
        version_id: Uuid,
        language: &str,
        fields: Map<String, Value>,
    ) -> Result<ContainerRecord, MigrationError> {
        self.store_content(branch_id, Uuid::new_v4(), language, version_id, fields)
            .await
    }

    /// Append a container for (node, language, branch) and move the head to
    /// it. Fields must exist in the schema of `version_id`.
    pub async fn store_content(
        &self,
        branch_id: Uuid,
        node_uuid: Uuid,
        language: &str,
        version_id: Uuid,
        fields: Map<String, Value>,
    ) -> Result<ContainerRecord, MigrationError> {
        self.store.get_branch(branch_id).await?;
        let version = self.store.get_schema_version(version_id).await?;
        if let Some(unknown) = fields.keys().find(|k| !version.schema.has_field(k)) {
            return Err(SchemaValidationError::UnknownField(unknown.clone()).into());
        }
        let key = &HeadKey::new(node_uuid, language, branch_id);
        let fields = &fields;
        self.transact(|mut snap| async move {
            let result = self
                .append_container_in(&mut snap, key, version_id, fields)
                .await;
            (snap, result)
        })
        .await
    }

    async fn put_project_in(
        &self,
        snap: &mut S::Snapshot,
        project: &ProjectRecord,
        branch: &BranchRecord,
    ) -> Result<(), MigrationError> {
        self.store.put_project(snap, project.clone()).await?;
        self.store.put_branch(snap, branch.clone()).await?;
        Ok(())
    }

    async fn put_schema_in(
        &self,
        snap: &mut S::Snapshot,
        version: &SchemaVersion,
        container: &SchemaContainerRecord,
    ) -> Result<(), MigrationError> {
        self.store.put_schema_version(snap, version.clone()).await?;
        self.store
            .put_schema_container(snap, container.clone())
            .await?;
        Ok(())
    }

    async fn append_container_in(
        &self,
        snap: &mut S::Snapshot,
        key: &HeadKey,
        version_id: Uuid,
        fields: &Map<String, Value>,
    ) -> Result<ContainerRecord, MigrationError> {
        let previous = self.store.get_container_head_for_update(snap, key).await?;
        let container = ContainerRecord {
            id: Uuid::new_v4(),
            node_uuid: key.node_uuid,
            language: key.language.clone(),
            branch_id: key.branch_id,
            schema_version_id: version_id,
            fields: fields.clone(),
            previous_id: previous.map(|p| p.id),
            job_id: None,
            warnings: Vec::new(),
            created_at: now_rfc3339(),
        };
        self.store.insert_container(snap, container.clone()).await?;
        self.store
            .set_container_head(snap, key, container.id)
            .await?;
        Ok(container)
    }

    // ── Schema updates ──────────────────────────────────────────────────────

    async fn latest_version(&self, schema_id: Uuid) -> Result<SchemaVersion, MigrationError> {
        let container = self.store.get_schema_container(schema_id).await?;
        Ok(self
            .store
            .get_schema_version(container.latest_version_id)
            .await?)
    }

    /// Dry run: changes that turn the latest version of `schema_id` into `new`.
    pub async fn diff_schema(
        &self,
        schema_id: Uuid,
        new: &Schema,
    ) -> Result<Vec<SchemaChange>, MigrationError> {
        new.validate()?;
        let latest = self.latest_version(schema_id).await?;
        Ok(diff_schemas(&latest.schema, new))
    }

    /// Update `schema_id` to `new`, migrating every branch that uses it.
    pub async fn update_schema(
        &self,
        schema_id: Uuid,
        new: Schema,
    ) -> Result<SchemaUpdateOutcome, MigrationError> {
        let changes = self.diff_schema(schema_id, &new).await?;
        if changes.is_empty() {
            tracing::info!(schema = %new.name, "schema update without difference");
            return Ok(SchemaUpdateOutcome::NoDifference);
        }
        self.apply_schema_changes(schema_id, changes).await
    }

    /// Cut the next version of `schema_id` from `changes` and queue one job
    /// per branch where the family is active.
    ///
    /// Rejected as a whole, without cutting a version, when any of those
    /// branches still has an unfinished job or a pending activation.
    pub async fn apply_schema_changes(
        &self,
        schema_id: Uuid,
        changes: Vec<SchemaChange>,
    ) -> Result<SchemaUpdateOutcome, MigrationError> {
        let latest = self.latest_version(schema_id).await?;
        let (next, _) = apply_to_version(&latest, &changes)?;
        if next.schema == latest.schema {
            return Ok(SchemaUpdateOutcome::NoDifference);
        }
        let branches = self.store.list_branches().await?;

        let (latest_ref, next_ref, branches_ref) = (&latest, &next, &branches);
        let jobs = self
            .transact(|mut snap| async move {
                let result = self
                    .cut_version(&mut snap, latest_ref, next_ref, branches_ref)
                    .await;
                (snap, result)
            })
            .await?;

        tracing::info!(
            schema = %next.name(),
            version = next.version,
            jobs = jobs.len(),
            "schema version created"
        );
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(job.id);
            self.spawn_job(job.id).await;
        }
        Ok(SchemaUpdateOutcome::MigrationInvoked {
            version: next.reference(),
            jobs: ids,
        })
    }

    async fn cut_version(
        &self,
        snap: &mut S::Snapshot,
        latest: &SchemaVersion,
        next: &SchemaVersion,
        branches: &[BranchRecord],
    ) -> Result<Vec<MigrationJobRecord>, MigrationError> {
        let schema_id = latest.schema_id;
        let mut container = self
            .store
            .get_schema_container_for_update(snap, schema_id)
            .await?;
        if container.latest_version_id != latest.id {
            return Err(MigrationError::Conflict(format!(
                "schema '{}' was updated concurrently",
                container.name
            )));
        }

        let mut jobs = Vec::new();
        for branch in branches {
            let Some(active) = self.check_family_free(snap, branch, schema_id).await? else {
                continue;
            };
            let job = MigrationJobRecord::queued(branch.id, schema_id, active.version_id, next.id);
            self.store.insert_job(snap, job.clone()).await?;
            jobs.push(job);
        }

        let mut previous = latest.clone();
        previous.next = Some(next.id);
        self.store.put_schema_version(snap, previous).await?;
        self.store.put_schema_version(snap, next.clone()).await?;
        container.latest_version_id = next.id;
        self.store.put_schema_container(snap, container).await?;
        Ok(jobs)
    }

    /// Reject when the family is busy in `branch`; otherwise return its
    /// active edge, if any.
    async fn check_family_free(
        &self,
        snap: &mut S::Snapshot,
        branch: &BranchRecord,
        schema_id: Uuid,
    ) -> Result<Option<BranchSchemaEdgeRecord>, MigrationError> {
        let family = self
            .store
            .list_branch_schema_edges_for_update(snap, branch.id, schema_id)
            .await?;
        if let Some(pending) = family.iter().find(|e| e.is_pending()) {
            return Err(MigrationError::Conflict(format!(
                "schema version {} is being activated in branch '{}'",
                pending.version_id, branch.name
            )));
        }
        let jobs = self
            .store
            .list_jobs_for_update(snap, branch.id, schema_id)
            .await?;
        if let Some(job) = jobs.iter().find(|j| !j.status.is_terminal()) {
            return Err(MigrationError::Conflict(format!(
                "job {} is still {} in branch '{}'",
                job.id, job.status, branch.name
            )));
        }
        Ok(family.into_iter().find(|e| e.active))
    }

    // ── Branch assignment ───────────────────────────────────────────────────

    /// Make `version_id` the active version of its family in `branch_id`,
    /// migrating content when another version is active.
    pub async fn assign_schema_version(
        &self,
        branch_id: Uuid,
        version_id: Uuid,
    ) -> Result<AssignOutcome, MigrationError> {
        let branch = self.store.get_branch(branch_id).await?;
        let version = self.store.get_schema_version(version_id).await?;
        let (branch_ref, version_ref) = (&branch, &version);
        let outcome = self
            .transact(|mut snap| async move {
                let result = self.assign_in(&mut snap, branch_ref, version_ref).await;
                (snap, result)
            })
            .await?;

        match &outcome {
            AssignOutcome::Activated(_) => {
                tracing::info!(
                    branch = %branch.name,
                    schema = %version.name(),
                    version = version.version,
                    "schema version assigned"
                );
                self.assignment
                    .publish(branch_id, &version, EdgeMigrationStatus::Completed, None)
                    .await;
            }
            AssignOutcome::AlreadyActive(_) => {}
            AssignOutcome::MigrationInvoked(job) => self.spawn_job(job.id).await,
        }
        Ok(outcome)
    }

    async fn assign_in(
        &self,
        snap: &mut S::Snapshot,
        branch: &BranchRecord,
        version: &SchemaVersion,
    ) -> Result<AssignOutcome, MigrationError> {
        let active = self
            .check_family_free(snap, branch, version.schema_id)
            .await?;
        match active {
            None => {
                let edge = activate_in(
                    self.store.as_ref(),
                    snap,
                    branch.id,
                    version.schema_id,
                    version.id,
                    None,
                )
                .await?;
                Ok(AssignOutcome::Activated(edge))
            }
            Some(edge) if edge.version_id == version.id => Ok(AssignOutcome::AlreadyActive(edge)),
            Some(edge) => {
                let from = self.store.get_schema_version(edge.version_id).await?;
                if from.version > version.version {
                    return Err(MigrationError::Conflict(format!(
                        "branch '{}' already uses version {} of '{}'",
                        branch.name,
                        from.version,
                        version.name()
                    )));
                }
                let job =
                    MigrationJobRecord::queued(branch.id, version.schema_id, from.id, version.id);
                self.store.insert_job(snap, job.clone()).await?;
                Ok(AssignOutcome::MigrationInvoked(job))
            }
        }
    }

    // ── Jobs ────────────────────────────────────────────────────────────────

    async fn spawn_job(&self, job_id: Uuid) {
        self.start_index_retry().await;
        let cancel = CancelToken::new();
        let runner = self.runner.clone();
        let token = cancel.clone();
        let running = self.running.clone();
        // Held until the handle is registered, so the task's own removal
        // always comes after the insert.
        let mut jobs = self.running.lock().await;
        let handle = tokio::spawn(async move {
            let result = runner.run(job_id, token).await;
            running.lock().await.remove(&job_id);
            if let Err(e) = &result {
                tracing::error!(job = %job_id, error = %e, "migration job ended with error");
            }
            result
        });
        jobs.insert(job_id, RunningJob { handle, cancel });
        tracing::debug!(job = %job_id, "migration job spawned");
    }

    /// Start the loop that re-delivers queued index entries, once.
    async fn start_index_retry(&self) {
        let mut slot = self.index_retry.lock().await;
        if slot.is_none() {
            *slot = Some(self.index.clone().spawn_retry_loop());
            tracing::debug!("index retry loop started");
        }
    }

    /// Number of jobs spawned by this service that have not ended yet.
    pub async fn running_jobs(&self) -> usize {
        self.running.lock().await.len()
    }

    pub async fn job_status(&self, job_id: Uuid) -> Result<JobStatusView, MigrationError> {
        let job = self.store.get_job(job_id).await.map_err(|e| match e {
            StorageError::NotFound { .. } => MigrationError::JobNotFound(job_id),
            other => other.into(),
        })?;
        let warnings = if job.status.is_terminal() {
            job.warnings
        } else {
            self.store
                .list_containers_by_job(job_id)
                .await?
                .into_iter()
                .flat_map(|c| c.warnings)
                .collect()
        };
        Ok(JobStatusView {
            job_id,
            status: job.status,
            warnings,
            error: job.error,
        })
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
    ) -> Result<Vec<MigrationJobRecord>, MigrationError> {
        Ok(self.store.list_jobs(status).await?)
    }

    /// Wait until `job_id` is terminal in this process and return it.
    pub async fn wait_for_job(&self, job_id: Uuid) -> Result<MigrationJobRecord, MigrationError> {
        let running = self.running.lock().await.remove(&job_id);
        match running {
            Some(job) => job
                .handle
                .await
                .map_err(|e| MigrationError::Task(e.to_string()))?,
            None => self.store.get_job(job_id).await.map_err(|e| match e {
                StorageError::NotFound { .. } => MigrationError::JobNotFound(job_id),
                other => other.into(),
            }),
        }
    }

    /// Request cancellation. A job that is not running in this process is
    /// failed directly. Returns `false` when the job was already terminal.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool, MigrationError> {
        if let Some(job) = self.running.lock().await.get(&job_id) {
            if !job.handle.is_finished() {
                job.cancel.cancel();
                tracing::info!(job = %job_id, "cancellation requested");
                return Ok(true);
            }
        }
        let job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        let token = CancelToken::new();
        token.cancel();
        self.runner.run(job_id, token).await?;
        Ok(true)
    }

    /// Spawn every non-terminal job not already running here and deliver
    /// the pending index queue. Call once at startup to pick up work
    /// interrupted by a crash.
    pub async fn resume_incomplete_jobs(&self) -> Result<Vec<Uuid>, MigrationError> {
        self.start_index_retry().await;
        self.index.drain_pending().await;
        let jobs = self.store.list_jobs(None).await?;
        let mut resumed = Vec::new();
        for job in jobs.into_iter().filter(|j| !j.status.is_terminal()) {
            if self.running.lock().await.contains_key(&job.id) {
                continue;
            }
            tracing::info!(job = %job.id, status = %job.status, "resuming migration job");
            self.spawn_job(job.id).await;
            resumed.push(job.id);
        }
        Ok(resumed)
    }

    pub async fn reindex_branch(&self, branch_id: Uuid) -> IndexSyncReport {
        self.index.reindex_branch(branch_id).await
    }

    /// Deliver queued index entries now instead of waiting for the retry loop.
    pub async fn retry_pending_index(&self) -> IndexSyncReport {
        self.index.drain_pending().await
    }

    /// Cancel every running job and wait for all of them.
    pub async fn shutdown(&self) {
        if let Some(retry) = self.index_retry.lock().await.take() {
            retry.abort();
        }
        let running: Vec<(Uuid, RunningJob)> = self.running.lock().await.drain().collect();
        for (_, job) in &running {
            job.cancel.cancel();
        }
        for (job_id, job) in running {
            match job.handle.await {
                Ok(Ok(record)) => {
                    tracing::debug!(job = %job_id, status = %record.status, "job stopped")
                }
                Ok(Err(e)) => tracing::warn!(job = %job_id, error = %e, "job stopped with error"),
                Err(e) => tracing::error!(job = %job_id, error = %e, "job task failed"),
            }
        }
        tracing::info!("migration service stopped");
    }
}

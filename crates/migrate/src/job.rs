//! Migration job runner.
//!
//! Drives one `MigrationJobRecord` through
//! `QUEUED → PREPARING → RUNNING → {DONE, FAILED}` against a `ContentStore`.
//! Every state transition is a single snapshot, committed through
//! `with_store_retry`. Node migration fans out over a bounded number of
//! tasks that report back on a completion channel.
//!
//! A job left non-terminal by a crash is resumed by calling [`JobRunner::run`]
//! again: heads still bound to the source version are migrated, heads that
//! already moved are skipped, and migrated container ids are derived from the
//! job id so a replay cannot fork a node's history.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quire_schema::{diff_schemas, replay_changes, SchemaVersion, TransformRules, VersionChain};
use quire_storage::{
    now_rfc3339, with_store_retry, BranchRecord, ConflictWarning, ContainerRecord, ContentStore,
    EdgeMigrationStatus, HeadKey, JobStatus, MigrationCause, MigrationJobRecord, ProjectRecord,
    StorageError,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::branch::{activate_in, assign_pending_in, mark_failed_in, BranchSchemaAssignment};
use crate::config::MigrationConfig;
use crate::error::MigrationError;
use crate::events::{EventBus, MigrationEvent, MigrationEventModel};
use crate::index::{DocumentIndex, IndexSyncCoordinator};
use crate::node::NodeMigrator;

/// Cooperative cancellation flag shared between a job and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a running job needs, resolved once in PREPARING.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: MigrationJobRecord,
    pub branch: BranchRecord,
    pub project: ProjectRecord,
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub rules: TransformRules,
}

/// Result of one node task.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Migrated { warnings: Vec<ConflictWarning> },
    /// The head no longer points at the source version.
    Skipped,
}

/// Counters of the RUNNING phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationProgress {
    pub total: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub warnings: usize,
}

pub struct JobRunner<S, I, E> {
    store: Arc<S>,
    events: Arc<E>,
    index: Arc<IndexSyncCoordinator<S, I>>,
    assignment: Arc<BranchSchemaAssignment<S, E>>,
    config: MigrationConfig,
}

impl<S, I, E> Clone for JobRunner<S, I, E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            events: self.events.clone(),
            index: self.index.clone(),
            assignment: self.assignment.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, I, E> JobRunner<S, I, E>
where
    S: ContentStore,
    I: DocumentIndex,
    E: EventBus,
{
    pub fn new(
        store: Arc<S>,
        events: Arc<E>,
        index: Arc<IndexSyncCoordinator<S, I>>,
        config: MigrationConfig,
    ) -> Self {
        let assignment = Arc::new(BranchSchemaAssignment::new(
            store.clone(),
            events.clone(),
            config.store_retry_limit,
        ));
        Self {
            store,
            events,
            index,
            assignment,
            config,
        }
    }

    /// Run (or resume) a job to a terminal state.
    ///
    /// Job failures are recorded on the job and returned as `Ok` with a
    /// FAILED record. `Err` means the job could not even be marked failed.
    pub async fn run(
        &self,
        job_id: Uuid,
        cancel: CancelToken,
    ) -> Result<MigrationJobRecord, MigrationError> {
        let job = self.store.get_job(job_id).await.map_err(|e| match e {
            StorageError::NotFound { .. } => MigrationError::JobNotFound(job_id),
            other => other.into(),
        })?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        if cancel.is_cancelled() {
            return self.fail(job_id, None, &MigrationError::Cancelled).await;
        }

        let ctx = match self.prepare(job_id).await {
            Ok(ctx) => Arc::new(ctx),
            Err(e) => return self.fail(job_id, None, &e).await,
        };

        match self.migrate_nodes(ctx.clone(), &cancel).await {
            Ok(progress) => {
                tracing::info!(
                    job = %job_id,
                    total = progress.total,
                    migrated = progress.migrated,
                    skipped = progress.skipped,
                    warnings = progress.warnings,
                    "all nodes migrated"
                );
            }
            Err(e) => return self.fail(job_id, Some(&ctx), &e).await,
        }

        match self.finalize(&ctx).await {
            Ok(job) => Ok(job),
            Err(e) => self.fail(job_id, Some(&ctx), &e).await,
        }
    }

    // ── QUEUED → PREPARING → RUNNING ────────────────────────────────────────

    /// Move the job into RUNNING and resolve everything it refers to.
    ///
    /// Idempotent for a job that is already PREPARING or RUNNING.
    /// `MIGRATION_START` is published unless the job was already RUNNING.
    pub async fn prepare(&self, job_id: Uuid) -> Result<JobContext, MigrationError> {
        let store = self.store.as_ref();
        let limit = self.config.store_retry_limit;

        let job = with_store_retry(limit, || async move {
            let mut snap = store.begin_snapshot().await?;
            let mut job = match store.get_job_for_update(&mut snap, job_id).await {
                Ok(job) => job,
                Err(e) => {
                    let _ = store.abort_snapshot(snap).await;
                    return Err(e);
                }
            };
            if job.status != JobStatus::Queued {
                let _ = store.abort_snapshot(snap).await;
                return Ok(job);
            }
            job.status = JobStatus::Preparing;
            job.started_at = Some(now_rfc3339());
            if let Err(e) = store.update_job(&mut snap, job.clone()).await {
                let _ = store.abort_snapshot(snap).await;
                return Err(e);
            }
            store.commit_snapshot(snap).await?;
            Ok(job)
        })
        .await?;
        if job.status.is_terminal() {
            return Err(MigrationError::Conflict(format!(
                "job {} finished while being prepared",
                job_id
            )));
        }
        let announce = job.status != JobStatus::Running;
        tracing::debug!(job = %job_id, status = %job.status, "preparing migration job");

        let mut ctx = self.resolve(job).await?;

        let cause = MigrationCause {
            job_id,
            origin: self.config.origin.clone(),
            from_version: ctx.from.reference(),
            to_version: ctx.to.reference(),
            branch: ctx.branch.reference(),
            project: ctx.project.reference(),
            started_at: ctx.job.started_at.clone().unwrap_or_else(now_rfc3339),
        };
        let cause = &cause;
        ctx.job = with_store_retry(limit, || async move {
            let mut snap = store.begin_snapshot().await?;
            match self.enter_running(&mut snap, job_id, cause).await {
                Ok(job) => {
                    store.commit_snapshot(snap).await?;
                    Ok(job)
                }
                Err(e) => {
                    let _ = store.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        })
        .await?;
        if ctx.job.status != JobStatus::Running {
            return Err(MigrationError::Conflict(format!(
                "job {} finished while being prepared",
                job_id
            )));
        }

        if announce {
            self.events
                .publish(MigrationEvent::MigrationStart(event_model(&ctx.job, Some(&ctx))));
            self.assignment
                .publish(
                    ctx.branch.id,
                    &ctx.to,
                    EdgeMigrationStatus::Pending,
                    Some(job_id),
                )
                .await;
            tracing::info!(
                job = %job_id,
                schema = %ctx.to.name(),
                from = ctx.from.version,
                to = ctx.to.version,
                branch = %ctx.branch.name,
                "migration started"
            );
        }
        Ok(ctx)
    }

    async fn enter_running(
        &self,
        snap: &mut S::Snapshot,
        job_id: Uuid,
        cause: &MigrationCause,
    ) -> Result<MigrationJobRecord, StorageError> {
        let mut job = self.store.get_job_for_update(snap, job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        assign_pending_in(
            self.store.as_ref(),
            snap,
            job.branch_id,
            job.schema_id,
            job.to_version_id,
            job.id,
        )
        .await?;
        if job.status != JobStatus::Running {
            job.status = JobStatus::Running;
            job.cause = Some(cause.clone());
            self.store.update_job(snap, job.clone()).await?;
        }
        Ok(job)
    }

    /// Load the branch, project and both versions, and derive the transform
    /// rules between the versions.
    async fn resolve(&self, job: MigrationJobRecord) -> Result<JobContext, MigrationError> {
        let store = self.store.as_ref();
        let id = job.id;
        let branch = store
            .get_branch(job.branch_id)
            .await
            .map_err(|e| missing(e, format!("Branch for job {} not found", id)))?;
        let project = store
            .get_project(branch.project_id)
            .await
            .map_err(|e| missing(e, format!("Project for job {} not found", id)))?;
        store
            .get_schema_container(job.schema_id)
            .await
            .map_err(|e| missing(e, format!("Schema container for job {} not found", id)))?;
        let from = store
            .get_schema_version(job.from_version_id)
            .await
            .map_err(|e| missing(e, format!("Source schema version for job {} not found", id)))?;
        let to = store
            .get_schema_version(job.to_version_id)
            .await
            .map_err(|e| missing(e, format!("Target schema version for job {} not found", id)))?;
        if from.schema_id != job.schema_id || to.schema_id != job.schema_id {
            return Err(MigrationError::InvalidJob(format!(
                "Schema versions of job {} belong to another schema",
                id
            )));
        }
        if to.version <= from.version {
            return Err(MigrationError::InvalidJob(format!(
                "Target version {} of job {} does not follow source version {}",
                to.version, id, from.version
            )));
        }

        let rules = self.transform_rules(&from, &to).await?;
        Ok(JobContext {
            job,
            branch,
            project,
            from,
            to,
            rules,
        })
    }

    /// Rules from the recorded change lists of the chain; a diff of the two
    /// schemas when the chain cannot be walked.
    async fn transform_rules(
        &self,
        from: &SchemaVersion,
        to: &SchemaVersion,
    ) -> Result<TransformRules, MigrationError> {
        let versions = self.store.list_schema_versions(from.schema_id).await?;
        let changes = VersionChain::from_versions(versions)
            .ok()
            .and_then(|chain| chain.changes_between(from.id, to.id));
        let changes = match changes {
            Some(changes) => changes,
            None => {
                tracing::debug!(schema = %from.name(), "version chain incomplete, diffing schemas");
                diff_schemas(&from.schema, &to.schema)
            }
        };
        let applied = replay_changes(&from.schema, &changes)?;
        Ok(applied.rules)
    }

    // ── RUNNING ─────────────────────────────────────────────────────────────

    /// Migrate every head still bound to the source version.
    ///
    /// At most `worker_pool_size` nodes are in flight. The first node error
    /// stops dispatch; in-flight nodes are drained before returning it.
    pub async fn migrate_nodes(
        &self,
        ctx: Arc<JobContext>,
        cancel: &CancelToken,
    ) -> Result<MigrationProgress, MigrationError> {
        let job_id = ctx.job.id;
        let heads = self
            .store
            .list_container_heads(ctx.branch.id, ctx.from.id)
            .await?;
        let mut progress = MigrationProgress {
            total: heads.len(),
            ..MigrationProgress::default()
        };
        let step = (progress.total / 10).max(1);
        let pool = self.config.worker_pool_size.max(1);
        let stall = self.config.stall_timeout();

        let (tx, mut rx) = mpsc::unbounded_channel::<Result<NodeOutcome, MigrationError>>();
        let mut pending = heads.into_iter();
        let mut in_flight = 0usize;
        let mut done = 0usize;
        let mut failure: Option<MigrationError> = None;

        loop {
            while in_flight < pool && failure.is_none() && !cancel.is_cancelled() {
                let Some(container) = pending.next() else {
                    break;
                };
                let runner = self.clone();
                let node_ctx = ctx.clone();
                let task =
                    tokio::spawn(async move { runner.migrate_node(&node_ctx, &container).await });
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = match task.await {
                        Ok(result) => result,
                        Err(e) => Err(MigrationError::Task(e.to_string())),
                    };
                    let _ = tx.send(result);
                });
                in_flight += 1;
            }
            if in_flight == 0 {
                break;
            }

            let result = match tokio::time::timeout(stall, rx.recv()).await {
                Ok(Some(result)) => result,
                Ok(None) => Err(MigrationError::Task("completion channel closed".to_string())),
                Err(_) => {
                    tracing::error!(job = %job_id, in_flight, "migration stalled");
                    return Err(MigrationError::Stalled {
                        secs: stall.as_secs(),
                    });
                }
            };
            in_flight -= 1;
            done += 1;
            match result {
                Ok(NodeOutcome::Migrated { warnings }) => {
                    progress.migrated += 1;
                    progress.warnings += warnings.len();
                }
                Ok(NodeOutcome::Skipped) => progress.skipped += 1,
                Err(e) => {
                    tracing::warn!(job = %job_id, error = %e, "node migration failed");
                    failure.get_or_insert(e);
                }
            }
            if done % step == 0 || done == progress.total {
                tracing::info!(job = %job_id, done, total = progress.total, "migration progress");
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if cancel.is_cancelled() {
            tracing::warn!(job = %job_id, done, total = progress.total, "migration cancelled");
            return Err(MigrationError::Cancelled);
        }
        Ok(progress)
    }

    /// Migrate the current head of `container`'s (node, language, branch) in
    /// one retried transaction. Skips heads that already left the source
    /// version.
    pub async fn migrate_node(
        &self,
        ctx: &JobContext,
        container: &ContainerRecord,
    ) -> Result<NodeOutcome, MigrationError> {
        let store = self.store.as_ref();
        let key = &container.head_key();
        let outcome = with_store_retry(self.config.store_retry_limit, || async move {
            let mut snap = store.begin_snapshot().await?;
            match self.migrate_head(&mut snap, ctx, key).await {
                Ok(NodeOutcome::Skipped) => {
                    let _ = store.abort_snapshot(snap).await;
                    Ok(NodeOutcome::Skipped)
                }
                Ok(outcome) => {
                    store.commit_snapshot(snap).await?;
                    Ok(outcome)
                }
                Err(e) => {
                    let _ = store.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        })
        .await?;
        Ok(outcome)
    }

    async fn migrate_head(
        &self,
        snap: &mut S::Snapshot,
        ctx: &JobContext,
        key: &HeadKey,
    ) -> Result<NodeOutcome, StorageError> {
        let head = match self.store.get_container_head_for_update(snap, key).await? {
            Some(head) if head.schema_version_id == ctx.from.id => head,
            _ => return Ok(NodeOutcome::Skipped),
        };
        let migration = NodeMigrator::new(&ctx.to, &ctx.rules, ctx.job.id).migrate(&head);
        let new_id = migration.container.id;
        // A concurrent runner committed this migration first; retry re-reads the head.
        self.store
            .insert_container(snap, migration.container)
            .await
            .map_err(|e| match e {
                StorageError::AlreadyExists { kind, id } => StorageError::ConcurrentConflict {
                    record: format!("{} {}", kind, id),
                    expected_revision: 0,
                },
                other => other,
            })?;
        self.store.set_container_head(snap, key, new_id).await?;
        tracing::trace!(
            node = %key.node_uuid,
            language = %key.language,
            warnings = migration.warnings.len(),
            "node migrated"
        );
        Ok(NodeOutcome::Migrated {
            warnings: migration.warnings,
        })
    }

    // ── RUNNING → DONE / FAILED ─────────────────────────────────────────────

    async fn finalize(&self, ctx: &JobContext) -> Result<MigrationJobRecord, MigrationError> {
        let store = self.store.as_ref();
        let job_id = ctx.job.id;
        let mut warnings: Vec<ConflictWarning> = store
            .list_containers_by_job(job_id)
            .await?
            .into_iter()
            .flat_map(|c| c.warnings)
            .collect();
        warnings.sort_by(|a, b| {
            (a.node_uuid, &a.language, &a.field_name)
                .cmp(&(b.node_uuid, &b.language, &b.field_name))
        });
        let warnings = &warnings;

        let job = with_store_retry(self.config.store_retry_limit, || async move {
            let mut snap = store.begin_snapshot().await?;
            match self.complete(&mut snap, ctx, warnings).await {
                Ok(job) => {
                    store.commit_snapshot(snap).await?;
                    Ok(job)
                }
                Err(e) => {
                    let _ = store.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        })
        .await?;

        self.assignment
            .publish(
                ctx.branch.id,
                &ctx.to,
                EdgeMigrationStatus::Completed,
                Some(job_id),
            )
            .await;
        self.events
            .publish(MigrationEvent::MigrationFinished(event_model(&job, Some(ctx))));
        tracing::info!(
            job = %job_id,
            schema = %ctx.to.name(),
            version = ctx.to.version,
            warnings = job.warnings.len(),
            "migration finished"
        );

        self.index.sync_job(job_id).await;
        Ok(job)
    }

    async fn complete(
        &self,
        snap: &mut S::Snapshot,
        ctx: &JobContext,
        warnings: &[ConflictWarning],
    ) -> Result<MigrationJobRecord, StorageError> {
        let mut job = self.store.get_job_for_update(snap, ctx.job.id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        activate_in(
            self.store.as_ref(),
            snap,
            job.branch_id,
            job.schema_id,
            job.to_version_id,
            Some(job.id),
        )
        .await?;
        job.status = JobStatus::Done;
        job.warnings = warnings.to_vec();
        job.finished_at = Some(now_rfc3339());
        self.store.update_job(snap, job.clone()).await?;
        Ok(job)
    }

    /// Mark the job FAILED with `cause` and release its pending edge. The
    /// active edge is left as it was.
    async fn fail(
        &self,
        job_id: Uuid,
        ctx: Option<&JobContext>,
        cause: &MigrationError,
    ) -> Result<MigrationJobRecord, MigrationError> {
        let store = self.store.as_ref();
        let message = &cause.to_string();
        let recorded = with_store_retry(self.config.store_retry_limit, || async move {
            let mut snap = store.begin_snapshot().await?;
            match self.mark_failed(&mut snap, job_id, message).await {
                Ok(job) => {
                    store.commit_snapshot(snap).await?;
                    Ok(job)
                }
                Err(e) => {
                    let _ = store.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        })
        .await;
        let job = match recorded {
            Ok(job) => job,
            Err(e) => {
                // Waiters still get FINISHED; the stored job keeps its old status.
                let model = MigrationEventModel {
                    job_id,
                    status: JobStatus::Failed,
                    from_version: ctx.map(|c| c.from.reference()),
                    to_version: ctx.map(|c| c.to.reference()),
                    branch: ctx.map(|c| c.branch.reference()),
                    project: ctx.map(|c| c.project.reference()),
                    error: Some(format!("{}; failure not recorded: {}", message, e)),
                    warnings: 0,
                };
                self.events.publish(MigrationEvent::MigrationFinished(model));
                tracing::error!(
                    job = %job_id,
                    error = %message,
                    store_error = %e,
                    "migration failed and could not be marked failed"
                );
                return Err(e.into());
            }
        };

        if job.status == JobStatus::Failed && job.error.as_deref() == Some(message.as_str()) {
            self.events
                .publish(MigrationEvent::MigrationFinished(event_model(&job, ctx)));
            tracing::error!(job = %job_id, error = %message, "migration failed");
        }
        Ok(job)
    }

    async fn mark_failed(
        &self,
        snap: &mut S::Snapshot,
        job_id: Uuid,
        message: &str,
    ) -> Result<MigrationJobRecord, StorageError> {
        let mut job = self.store.get_job_for_update(snap, job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        mark_failed_in(
            self.store.as_ref(),
            snap,
            job.branch_id,
            job.schema_id,
            job.to_version_id,
            job.id,
        )
        .await?;
        job.status = JobStatus::Failed;
        job.error = Some(message.to_string());
        job.finished_at = Some(now_rfc3339());
        self.store.update_job(snap, job.clone()).await?;
        Ok(job)
    }
}

fn missing(e: StorageError, message: String) -> MigrationError {
    match e {
        StorageError::NotFound { .. } => MigrationError::InvalidJob(message),
        other => other.into(),
    }
}

fn event_model(job: &MigrationJobRecord, ctx: Option<&JobContext>) -> MigrationEventModel {
    MigrationEventModel {
        job_id: job.id,
        status: job.status,
        from_version: ctx.map(|c| c.from.reference()),
        to_version: ctx.map(|c| c.to.reference()),
        branch: ctx.map(|c| c.branch.reference()),
        project: ctx.map(|c| c.project.reference()),
        error: job.error.clone(),
        warnings: job.warnings.len(),
    }
}

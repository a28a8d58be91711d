//! Branch → schema version assignment.
//!
//! The `*_in` helpers work inside a caller's snapshot so that the job runner
//! can fold edge changes into its own state transitions. [`BranchSchemaAssignment`]
//! wraps them in standalone retried transactions for direct activation.

use std::sync::Arc;

use quire_schema::SchemaVersion;
use quire_storage::{
    with_store_retry, BranchSchemaEdgeRecord, ContentStore, EdgeMigrationStatus, StorageError,
};
use uuid::Uuid;

use crate::error::MigrationError;
use crate::events::{BranchAssignEventModel, EventBus, MigrationEvent};

/// Make `version_id` the active version of its family in `branch_id`.
///
/// Every other active edge of the family is deactivated; the target edge is
/// reused when present. Returns the activated edge.
pub async fn activate_in<S: ContentStore>(
    store: &S,
    snap: &mut S::Snapshot,
    branch_id: Uuid,
    schema_id: Uuid,
    version_id: Uuid,
    job_id: Option<Uuid>,
) -> Result<BranchSchemaEdgeRecord, StorageError> {
    let family = store
        .list_branch_schema_edges_for_update(snap, branch_id, schema_id)
        .await?;
    let mut target = None;
    for edge in family {
        if edge.version_id == version_id {
            target = Some(edge);
        } else if edge.active {
            let mut old = edge;
            old.active = false;
            store.put_branch_schema_edge(snap, old).await?;
        }
    }

    let mut edge = target.unwrap_or(BranchSchemaEdgeRecord {
        branch_id,
        schema_id,
        version_id,
        active: true,
        migration_status: EdgeMigrationStatus::Completed,
        job_id,
    });
    edge.active = true;
    edge.migration_status = EdgeMigrationStatus::Completed;
    if job_id.is_some() {
        edge.job_id = job_id;
    }
    store.put_branch_schema_edge(snap, edge.clone()).await?;
    Ok(edge)
}

/// Reserve the target edge for `job_id`: inactive and `Pending`.
///
/// Re-reserving for the same job is a no-op. An edge that is already active
/// stays active.
pub async fn assign_pending_in<S: ContentStore>(
    store: &S,
    snap: &mut S::Snapshot,
    branch_id: Uuid,
    schema_id: Uuid,
    version_id: Uuid,
    job_id: Uuid,
) -> Result<BranchSchemaEdgeRecord, StorageError> {
    let family = store
        .list_branch_schema_edges_for_update(snap, branch_id, schema_id)
        .await?;
    let edge = match family.into_iter().find(|e| e.version_id == version_id) {
        Some(edge) if edge.is_pending() && edge.job_id == Some(job_id) => return Ok(edge),
        Some(mut edge) => {
            edge.migration_status = EdgeMigrationStatus::Pending;
            edge.job_id = Some(job_id);
            edge
        }
        None => BranchSchemaEdgeRecord {
            branch_id,
            schema_id,
            version_id,
            active: false,
            migration_status: EdgeMigrationStatus::Pending,
            job_id: Some(job_id),
        },
    };
    store.put_branch_schema_edge(snap, edge.clone()).await?;
    Ok(edge)
}

/// Deactivate the edge of `version_id`. Missing or inactive edges are left
/// alone.
pub async fn deactivate_in<S: ContentStore>(
    store: &S,
    snap: &mut S::Snapshot,
    branch_id: Uuid,
    schema_id: Uuid,
    version_id: Uuid,
) -> Result<(), StorageError> {
    let family = store
        .list_branch_schema_edges_for_update(snap, branch_id, schema_id)
        .await?;
    if let Some(mut edge) = family
        .into_iter()
        .find(|e| e.version_id == version_id && e.active)
    {
        edge.active = false;
        store.put_branch_schema_edge(snap, edge).await?;
    }
    Ok(())
}

/// Release a `Pending` reservation of `job_id` as `Failed`. Active flags are
/// not touched.
pub async fn mark_failed_in<S: ContentStore>(
    store: &S,
    snap: &mut S::Snapshot,
    branch_id: Uuid,
    schema_id: Uuid,
    version_id: Uuid,
    job_id: Uuid,
) -> Result<(), StorageError> {
    let family = store
        .list_branch_schema_edges_for_update(snap, branch_id, schema_id)
        .await?;
    if let Some(mut edge) = family
        .into_iter()
        .find(|e| e.version_id == version_id && e.is_pending() && e.job_id == Some(job_id))
    {
        edge.migration_status = EdgeMigrationStatus::Failed;
        store.put_branch_schema_edge(snap, edge).await?;
    }
    Ok(())
}

/// Edge binding `version_id` to `branch_id`, if any.
pub async fn find_edge<S: ContentStore>(
    store: &S,
    branch_id: Uuid,
    version_id: Uuid,
) -> Result<Option<BranchSchemaEdgeRecord>, StorageError> {
    Ok(store
        .list_branch_schema_edges(branch_id)
        .await?
        .into_iter()
        .find(|e| e.version_id == version_id))
}

/// Active edge of the family `schema_id` in `branch_id`, if any.
pub async fn active_edge<S: ContentStore>(
    store: &S,
    branch_id: Uuid,
    schema_id: Uuid,
) -> Result<Option<BranchSchemaEdgeRecord>, StorageError> {
    Ok(store
        .list_branch_schema_edges(branch_id)
        .await?
        .into_iter()
        .find(|e| e.schema_id == schema_id && e.active))
}

/// Standalone branch assignment operations, each one retried transaction.
pub struct BranchSchemaAssignment<S, E> {
    store: Arc<S>,
    events: Arc<E>,
    retry_limit: u32,
}

impl<S, E> BranchSchemaAssignment<S, E>
where
    S: ContentStore,
    E: EventBus,
{
    pub fn new(store: Arc<S>, events: Arc<E>, retry_limit: u32) -> Self {
        Self {
            store,
            events,
            retry_limit,
        }
    }

    /// Activate `version` in `branch_id` without migrating content.
    pub async fn activate(
        &self,
        branch_id: Uuid,
        version: &SchemaVersion,
    ) -> Result<BranchSchemaEdgeRecord, MigrationError> {
        let store = self.store.as_ref();
        let edge = with_store_retry(self.retry_limit, || async move {
            let mut snap = store.begin_snapshot().await?;
            match activate_in(
                store,
                &mut snap,
                branch_id,
                version.schema_id,
                version.id,
                None,
            )
            .await
            {
                Ok(edge) => {
                    store.commit_snapshot(snap).await?;
                    Ok(edge)
                }
                Err(e) => {
                    let _ = store.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        })
        .await?;
        tracing::info!(
            branch = %branch_id,
            schema = %version.name(),
            version = version.version,
            "schema version activated"
        );
        self.publish(branch_id, version, EdgeMigrationStatus::Completed, None)
            .await;
        Ok(edge)
    }

    /// Deactivate the edge of `version` in `branch_id`. Idempotent.
    pub async fn deactivate(
        &self,
        branch_id: Uuid,
        version: &SchemaVersion,
    ) -> Result<(), MigrationError> {
        let store = self.store.as_ref();
        with_store_retry(self.retry_limit, || async move {
            let mut snap = store.begin_snapshot().await?;
            match deactivate_in(store, &mut snap, branch_id, version.schema_id, version.id).await {
                Ok(()) => store.commit_snapshot(snap).await,
                Err(e) => {
                    let _ = store.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        })
        .await?;
        Ok(())
    }

    pub async fn find_edge(
        &self,
        branch_id: Uuid,
        version_id: Uuid,
    ) -> Result<Option<BranchSchemaEdgeRecord>, MigrationError> {
        Ok(find_edge(self.store.as_ref(), branch_id, version_id).await?)
    }

    pub async fn active_edge(
        &self,
        branch_id: Uuid,
        schema_id: Uuid,
    ) -> Result<Option<BranchSchemaEdgeRecord>, MigrationError> {
        Ok(active_edge(self.store.as_ref(), branch_id, schema_id).await?)
    }

    /// Publish `BRANCH_SCHEMA_ASSIGN`. Missing branch or project records
    /// only skip the event.
    pub async fn publish(
        &self,
        branch_id: Uuid,
        version: &SchemaVersion,
        status: EdgeMigrationStatus,
        job_id: Option<Uuid>,
    ) {
        let refs = async {
            let branch = self.store.get_branch(branch_id).await?;
            let project = self.store.get_project(branch.project_id).await?;
            Ok::<_, StorageError>((branch.reference(), project.reference()))
        };
        match refs.await {
            Ok((branch, project)) => {
                self.events
                    .publish(MigrationEvent::BranchSchemaAssign(BranchAssignEventModel {
                        project,
                        branch,
                        schema: version.reference(),
                        status,
                        job_id,
                    }))
            }
            Err(e) => tracing::warn!(
                branch = %branch_id,
                error = %e,
                "skipping branch schema assign event"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEventBus;
    use quire_schema::{FieldSchema, FieldType, Schema};
    use quire_storage::{BranchRecord, MemoryStore, ProjectRecord};

    async fn commit<S: ContentStore>(store: &S, snap: S::Snapshot) {
        store.commit_snapshot(snap).await.unwrap();
    }

    #[tokio::test]
    async fn activation_replaces_the_active_edge() {
        let store = MemoryStore::new();
        let (branch, schema) = (Uuid::new_v4(), Uuid::new_v4());
        let (v1, v2) = (Uuid::new_v4(), Uuid::new_v4());

        let mut snap = store.begin_snapshot().await.unwrap();
        activate_in(&store, &mut snap, branch, schema, v1, None)
            .await
            .unwrap();
        commit(&store, snap).await;
        let mut snap = store.begin_snapshot().await.unwrap();
        activate_in(&store, &mut snap, branch, schema, v2, None)
            .await
            .unwrap();
        commit(&store, snap).await;

        let edges = store.list_branch_schema_edges(branch).await.unwrap();
        assert_eq!(edges.len(), 2);
        let active: Vec<_> = edges.iter().filter(|e| e.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].version_id, v2);
    }

    #[tokio::test]
    async fn pending_reservation_then_failure() {
        let store = MemoryStore::new();
        let (branch, schema, version, job) =
            (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        for _ in 0..2 {
            let mut snap = store.begin_snapshot().await.unwrap();
            assign_pending_in(&store, &mut snap, branch, schema, version, job)
                .await
                .unwrap();
            commit(&store, snap).await;
        }
        let edge = find_edge(&store, branch, version).await.unwrap().unwrap();
        assert!(edge.is_pending());
        assert!(!edge.active);
        assert_eq!(edge.job_id, Some(job));

        let mut snap = store.begin_snapshot().await.unwrap();
        mark_failed_in(&store, &mut snap, branch, schema, version, job)
            .await
            .unwrap();
        commit(&store, snap).await;
        let edge = find_edge(&store, branch, version).await.unwrap().unwrap();
        assert_eq!(edge.migration_status, EdgeMigrationStatus::Failed);
        assert!(!edge.active);
    }

    #[tokio::test]
    async fn deactivate_is_idempotent() {
        let store = MemoryStore::new();
        let (branch, schema, version) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut snap = store.begin_snapshot().await.unwrap();
        activate_in(&store, &mut snap, branch, schema, version, None)
            .await
            .unwrap();
        commit(&store, snap).await;

        for _ in 0..2 {
            let mut snap = store.begin_snapshot().await.unwrap();
            deactivate_in(&store, &mut snap, branch, schema, version)
                .await
                .unwrap();
            commit(&store, snap).await;
        }
        assert!(active_edge(&store, branch, schema).await.unwrap().is_none());
        assert!(find_edge(&store, branch, version).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn activate_publishes_assign_event() {
        let store = Arc::new(MemoryStore::new());
        let project = ProjectRecord {
            id: Uuid::new_v4(),
            name: "demo".to_string(),
        };
        let branch = BranchRecord {
            id: Uuid::new_v4(),
            name: "main".to_string(),
            project_id: project.id,
        };
        let mut snap = store.begin_snapshot().await.unwrap();
        store.put_project(&mut snap, project).await.unwrap();
        store.put_branch(&mut snap, branch.clone()).await.unwrap();
        commit(store.as_ref(), snap).await;

        let version = SchemaVersion::initial(
            Uuid::new_v4(),
            Schema::new("article").with_field(FieldSchema::new("title", FieldType::String)),
        )
        .unwrap();
        let bus = Arc::new(BroadcastEventBus::default());
        let mut rx = bus.subscribe();
        let assignment = BranchSchemaAssignment::new(store.clone(), bus, 0);
        let edge = assignment.activate(branch.id, &version).await.unwrap();
        assert!(edge.active);

        match rx.recv().await.unwrap() {
            MigrationEvent::BranchSchemaAssign(model) => {
                assert_eq!(model.branch.name, "main");
                assert_eq!(model.schema.version, 1);
                assert_eq!(model.status, EdgeMigrationStatus::Completed);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

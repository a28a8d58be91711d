//! Atomic commit conformance tests.
//!
//! A snapshot that touches several record kinds becomes visible all at once,
//! and a snapshot rejected at commit leaves no trace.

use std::future::Future;

use quire_schema::{FieldSchema, FieldType, Schema, SchemaVersion};
use uuid::Uuid;

use super::{make_container, make_edge, make_job, TestResult};
use crate::record::{
    BranchRecord, JobStatus, PendingIndexAction, PendingIndexEntryRecord, ProjectRecord,
    SchemaContainerRecord,
};
use crate::{ContentStore, StorageError};

pub(super) async fn run_commit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "commit",
        "multi_record_commit_visible_together",
        multi_record_commit_visible_together(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "rejected_commit_applies_nothing",
        rejected_commit_applies_nothing(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "schema_versions_listed_in_order",
        schema_versions_listed_in_order(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "project_branch_schema_round_trip",
        project_branch_schema_round_trip(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "containers_listed_by_job",
        containers_listed_by_job(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "pending_index_entries_queue",
        pending_index_entries_queue(factory).await,
    ));

    results
}

async fn multi_record_commit_visible_together<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let (branch, schema, version) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let job = make_job(branch, schema);
    let edge = make_edge(branch, schema, version, true);
    let container = make_container(Uuid::new_v4(), branch, version);

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_job(&mut snap, job.clone())
        .await
        .map_err(|e| format!("job: {e}"))?;
    s.put_branch_schema_edge(&mut snap, edge.clone())
        .await
        .map_err(|e| format!("edge: {e}"))?;
    s.insert_container(&mut snap, container.clone())
        .await
        .map_err(|e| format!("container: {e}"))?;
    s.set_container_head(&mut snap, &container.head_key(), container.id)
        .await
        .map_err(|e| format!("head: {e}"))?;

    if s.get_job(job.id).await.is_ok() {
        return Err("job visible before commit".to_string());
    }
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    s.get_job(job.id).await.map_err(|e| format!("job: {e}"))?;
    let edges = s
        .list_branch_schema_edges(branch)
        .await
        .map_err(|e| format!("edges: {e}"))?;
    if edges != vec![edge] {
        return Err(format!("unexpected edges {:?}", edges));
    }
    let heads = s
        .list_container_heads(branch, version)
        .await
        .map_err(|e| format!("heads: {e}"))?;
    if heads.len() != 1 || heads[0].id != container.id {
        return Err(format!("unexpected heads {:?}", heads));
    }
    Ok(())
}

/// Two snapshots read the same job; the first commit wins and the second
/// must be rejected without applying its other writes.
async fn rejected_commit_applies_nothing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let job = make_job(Uuid::new_v4(), Uuid::new_v4());
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_job(&mut snap, job.clone())
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut a = s.begin_snapshot().await.map_err(|e| format!("begin a: {e}"))?;
    let mut b = s.begin_snapshot().await.map_err(|e| format!("begin b: {e}"))?;
    let mut job_a = s
        .get_job_for_update(&mut a, job.id)
        .await
        .map_err(|e| format!("read a: {e}"))?;
    let mut job_b = s
        .get_job_for_update(&mut b, job.id)
        .await
        .map_err(|e| format!("read b: {e}"))?;

    job_a.status = JobStatus::Preparing;
    s.update_job(&mut a, job_a)
        .await
        .map_err(|e| format!("update a: {e}"))?;
    job_b.status = JobStatus::Failed;
    s.update_job(&mut b, job_b)
        .await
        .map_err(|e| format!("update b: {e}"))?;
    let extra = make_container(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    s.insert_container(&mut b, extra.clone())
        .await
        .map_err(|e| format!("insert b: {e}"))?;

    s.commit_snapshot(a)
        .await
        .map_err(|e| format!("commit a: {e}"))?;
    match s.commit_snapshot(b).await {
        Err(StorageError::ConcurrentConflict { .. }) => {}
        other => return Err(format!("expected ConcurrentConflict, got {:?}", other)),
    }

    let stored = s.get_job(job.id).await.map_err(|e| format!("get: {e}"))?;
    if stored.status != JobStatus::Preparing {
        return Err(format!("expected PREPARING, got {}", stored.status));
    }
    if s.get_container(extra.id).await.is_ok() {
        return Err("write of the rejected snapshot is visible".to_string());
    }
    Ok(())
}

async fn schema_versions_listed_in_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let schema = Schema::new("article").with_field(FieldSchema::new("title", FieldType::String));
    let v1 = SchemaVersion::initial(Uuid::new_v4(), schema).map_err(|e| e.to_string())?;
    let changes = vec![quire_schema::SchemaChange::AddField {
        field: FieldSchema::new("body", FieldType::Html),
    }];
    let (v2, _) = quire_schema::apply_to_version(&v1, &changes).map_err(|e| e.to_string())?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.put_schema_version(&mut snap, v2.clone())
        .await
        .map_err(|e| format!("put v2: {e}"))?;
    s.put_schema_version(&mut snap, v1.clone())
        .await
        .map_err(|e| format!("put v1: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let listed = s
        .list_schema_versions(v1.schema_id)
        .await
        .map_err(|e| format!("list: {e}"))?;
    let numbers: Vec<u32> = listed.iter().map(|v| v.version).collect();
    if numbers != vec![1, 2] {
        return Err(format!("expected versions [1, 2], got {:?}", numbers));
    }
    let fetched = s
        .get_schema_version(v2.id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if fetched != v2 {
        return Err("fetched version differs".to_string());
    }
    Ok(())
}

async fn project_branch_schema_round_trip<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let project = ProjectRecord {
        id: Uuid::new_v4(),
        name: "demo".to_string(),
    };
    let branch = BranchRecord {
        id: Uuid::new_v4(),
        name: "main".to_string(),
        project_id: project.id,
    };
    let container = SchemaContainerRecord {
        id: Uuid::new_v4(),
        name: "article".to_string(),
        latest_version_id: Uuid::new_v4(),
    };

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.put_project(&mut snap, project.clone())
        .await
        .map_err(|e| format!("project: {e}"))?;
    s.put_branch(&mut snap, branch.clone())
        .await
        .map_err(|e| format!("branch: {e}"))?;
    s.put_schema_container(&mut snap, container.clone())
        .await
        .map_err(|e| format!("schema: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let mut locked = s
        .get_schema_container_for_update(&mut snap, container.id)
        .await
        .map_err(|e| format!("lock schema: {e}"))?;
    locked.latest_version_id = Uuid::new_v4();
    s.put_schema_container(&mut snap, locked.clone())
        .await
        .map_err(|e| format!("update schema: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    if s.get_project(project.id).await.map_err(|e| e.to_string())? != project {
        return Err("project differs".to_string());
    }
    if s.get_branch(branch.id).await.map_err(|e| e.to_string())? != branch {
        return Err("branch differs".to_string());
    }
    let branches = s.list_branches().await.map_err(|e| e.to_string())?;
    if !branches.contains(&branch) {
        return Err(format!("branch missing from listing {:?}", branches));
    }
    let stored = s
        .get_schema_container(container.id)
        .await
        .map_err(|e| e.to_string())?;
    if stored.latest_version_id != locked.latest_version_id {
        return Err("schema update lost".to_string());
    }
    Ok(())
}

async fn containers_listed_by_job<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let (branch, version, job_id) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let mut mine = make_container(Uuid::new_v4(), branch, version);
    mine.job_id = Some(job_id);
    let other = make_container(Uuid::new_v4(), branch, version);

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    for c in [mine.clone(), other] {
        s.insert_container(&mut snap, c)
            .await
            .map_err(|e| format!("insert: {e}"))?;
    }
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let listed = s
        .list_containers_by_job(job_id)
        .await
        .map_err(|e| format!("list: {e}"))?;
    if listed.len() != 1 || listed[0].id != mine.id {
        return Err(format!("expected only the job's container, got {:?}", listed));
    }
    Ok(())
}

async fn pending_index_entries_queue<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let first = PendingIndexEntryRecord::new(
        PendingIndexAction::Store {
            container_id: Uuid::new_v4(),
        },
        "unavailable",
    );
    let second = PendingIndexEntryRecord::new(
        PendingIndexAction::ReindexAll {
            branch_id: Uuid::new_v4(),
        },
        "unavailable",
    );

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    for entry in [first.clone(), second.clone()] {
        s.put_pending_index_entry(&mut snap, entry)
            .await
            .map_err(|e| format!("put: {e}"))?;
    }
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut retried = first.clone();
    retried.attempts = 2;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.put_pending_index_entry(&mut snap, retried.clone())
        .await
        .map_err(|e| format!("replace: {e}"))?;
    s.delete_pending_index_entry(&mut snap, second.id)
        .await
        .map_err(|e| format!("delete: {e}"))?;
    s.delete_pending_index_entry(&mut snap, Uuid::new_v4())
        .await
        .map_err(|e| format!("delete missing: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let listed = s
        .list_pending_index_entries()
        .await
        .map_err(|e| format!("list: {e}"))?;
    if listed != vec![retried] {
        return Err(format!("expected only the retried entry, got {:?}", listed));
    }
    Ok(())
}

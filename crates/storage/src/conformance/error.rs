use std::future::Future;

use uuid::Uuid;

use super::{make_container, make_job, seed_container, TestResult};
use crate::record::HeadKey;
use crate::{ContentStore, StorageError};

pub(super) async fn run_error_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "error",
        "get_job_nonexistent",
        get_job_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "get_job_for_update_nonexistent",
        get_job_for_update_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "update_job_nonexistent",
        update_job_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "insert_job_duplicate",
        insert_job_duplicate(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "insert_container_duplicate",
        insert_container_duplicate(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "head_to_missing_container",
        head_to_missing_container(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "lookups_of_missing_records",
        lookups_of_missing_records(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "empty_listings",
        empty_listings(factory).await,
    ));

    results
}

// ── 1. get_job on empty store returns NotFound ──────────────────────────────

async fn get_job_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = Uuid::new_v4();
    match s.get_job(id).await {
        Err(StorageError::NotFound { kind, id: got }) if got == id.to_string() => {
            if kind == "job" {
                Ok(())
            } else {
                Err(format!("expected kind 'job', got '{kind}'"))
            }
        }
        other => Err(format!("expected NotFound, got {:?}", other)),
    }
}

// ── 2. get_job_for_update inside a snapshot returns NotFound ────────────────

async fn get_job_for_update_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let result = s.get_job_for_update(&mut snap, Uuid::new_v4()).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::NotFound { .. }) => Ok(()),
        other => Err(format!("expected NotFound, got {:?}", other)),
    }
}

// ── 3. update_job of an unknown job returns NotFound ────────────────────────

async fn update_job_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let result = s
        .update_job(&mut snap, make_job(Uuid::new_v4(), Uuid::new_v4()))
        .await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::NotFound { .. }) => Ok(()),
        other => Err(format!("expected NotFound, got {:?}", other)),
    }
}

// ── 4. inserting a job twice returns AlreadyExists ──────────────────────────

async fn insert_job_duplicate<S, F, Fut>(factory: &F) -> Result<(), String>
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

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let result = s.insert_job(&mut snap, job).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::AlreadyExists { kind: "job", .. }) => Ok(()),
        other => Err(format!("expected AlreadyExists, got {:?}", other)),
    }
}

// ── 5. containers are never overwritten ─────────────────────────────────────

async fn insert_container_duplicate<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let container = make_container(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    seed_container(&s, &container).await?;

    let mut changed = container.clone();
    changed.fields.clear();
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let result = s.insert_container(&mut snap, changed).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::AlreadyExists { .. }) => {}
        other => return Err(format!("expected AlreadyExists, got {:?}", other)),
    }

    let stored = s
        .get_container(container.id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.fields != container.fields {
        return Err("container fields were overwritten".to_string());
    }
    Ok(())
}

// ── 6. head pointers must name an existing container ────────────────────────

async fn head_to_missing_container<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let key = HeadKey::new(Uuid::new_v4(), "en", Uuid::new_v4());
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let result = s.set_container_head(&mut snap, &key, Uuid::new_v4()).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::NotFound { kind: "container", .. }) => Ok(()),
        other => Err(format!("expected NotFound, got {:?}", other)),
    }
}

// ── 7. single-record lookups ────────────────────────────────────────────────

async fn lookups_of_missing_records<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = Uuid::new_v4();

    if !matches!(s.get_project(id).await, Err(StorageError::NotFound { .. })) {
        return Err("get_project: expected NotFound".to_string());
    }
    if !matches!(s.get_branch(id).await, Err(StorageError::NotFound { .. })) {
        return Err("get_branch: expected NotFound".to_string());
    }
    if !matches!(
        s.get_schema_container(id).await,
        Err(StorageError::NotFound { .. })
    ) {
        return Err("get_schema_container: expected NotFound".to_string());
    }
    if !matches!(
        s.get_schema_version(id).await,
        Err(StorageError::NotFound { .. })
    ) {
        return Err("get_schema_version: expected NotFound".to_string());
    }
    if !matches!(s.get_container(id).await, Err(StorageError::NotFound { .. })) {
        return Err("get_container: expected NotFound".to_string());
    }
    match s.get_container_head(&HeadKey::new(id, "en", id)).await {
        Ok(None) => Ok(()),
        other => Err(format!("get_container_head: expected None, got {:?}", other)),
    }
}

// ── 8. listings on an empty store ───────────────────────────────────────────

async fn empty_listings<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = Uuid::new_v4();
    let jobs = s.list_jobs(None).await.map_err(|e| format!("list_jobs: {e}"))?;
    let edges = s
        .list_branch_schema_edges(id)
        .await
        .map_err(|e| format!("list edges: {e}"))?;
    let heads = s
        .list_container_heads(id, id)
        .await
        .map_err(|e| format!("list heads: {e}"))?;
    let versions = s
        .list_schema_versions(id)
        .await
        .map_err(|e| format!("list versions: {e}"))?;
    if !jobs.is_empty() || !edges.is_empty() || !heads.is_empty() || !versions.is_empty() {
        return Err("expected all listings to be empty".to_string());
    }
    Ok(())
}

//! Snapshot isolation conformance tests.
//!
//! Verifies that uncommitted writes are invisible outside a snapshot, that a
//! snapshot reads its own writes, and that aborted writes are discarded.

use std::future::Future;

use uuid::Uuid;

use super::{make_container, make_job, seed_container, TestResult};
use crate::record::JobStatus;
use crate::ContentStore;

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "snapshot",
        "uncommitted_job_invisible",
        uncommitted_job_invisible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "committed_job_visible",
        committed_job_visible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "abort_discards_writes",
        abort_discards_writes(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "snapshot_reads_its_own_writes",
        snapshot_reads_its_own_writes(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "head_moves_on_commit",
        head_moves_on_commit(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "list_jobs_filters_by_status",
        list_jobs_filters_by_status(factory).await,
    ));

    results
}

async fn uncommitted_job_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
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

    let visible = s.get_job(job.id).await.is_ok();
    let listed = s
        .list_jobs(None)
        .await
        .map_err(|e| format!("list: {e}"))?
        .len();
    let _ = s.abort_snapshot(snap).await;

    if visible || listed != 0 {
        return Err("uncommitted job visible outside its snapshot".to_string());
    }
    Ok(())
}

async fn committed_job_visible<S, F, Fut>(factory: &F) -> Result<(), String>
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

    let stored = s.get_job(job.id).await.map_err(|e| format!("get: {e}"))?;
    if stored != job {
        return Err(format!("stored job differs: {:?}", stored));
    }
    Ok(())
}

async fn abort_discards_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let container = make_container(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_container(&mut snap, container.clone())
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.set_container_head(&mut snap, &container.head_key(), container.id)
        .await
        .map_err(|e| format!("set head: {e}"))?;
    s.abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    if s.get_container(container.id).await.is_ok() {
        return Err("aborted container is visible".to_string());
    }
    match s.get_container_head(&container.head_key()).await {
        Ok(None) => Ok(()),
        other => Err(format!("aborted head is visible: {:?}", other)),
    }
}

async fn snapshot_reads_its_own_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut job = make_job(Uuid::new_v4(), Uuid::new_v4());
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_job(&mut snap, job.clone())
        .await
        .map_err(|e| format!("insert: {e}"))?;
    job.status = JobStatus::Preparing;
    s.update_job(&mut snap, job.clone())
        .await
        .map_err(|e| format!("update: {e}"))?;

    let read = s
        .get_job_for_update(&mut snap, job.id)
        .await
        .map_err(|e| format!("read back: {e}"))?;
    let family = s
        .list_jobs_for_update(&mut snap, job.branch_id, job.schema_id)
        .await
        .map_err(|e| format!("list: {e}"))?;
    let _ = s.abort_snapshot(snap).await;

    if read.status != JobStatus::Preparing {
        return Err(format!("expected PREPARING, read {}", read.status));
    }
    if family.len() != 1 {
        return Err(format!("expected 1 job in family, got {}", family.len()));
    }
    Ok(())
}

async fn head_moves_on_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let (node, branch, v1, v2) = (
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
    );
    let first = make_container(node, branch, v1);
    seed_container(&s, &first).await?;

    let mut second = make_container(node, branch, v2);
    second.previous_id = Some(first.id);
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let head = s
        .get_container_head_for_update(&mut snap, &first.head_key())
        .await
        .map_err(|e| format!("read head: {e}"))?;
    if head.map(|c| c.id) != Some(first.id) {
        return Err("head does not name the first container".to_string());
    }
    s.insert_container(&mut snap, second.clone())
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.set_container_head(&mut snap, &second.head_key(), second.id)
        .await
        .map_err(|e| format!("set head: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let old_heads = s
        .list_container_heads(branch, v1)
        .await
        .map_err(|e| format!("list v1: {e}"))?;
    let new_heads = s
        .list_container_heads(branch, v2)
        .await
        .map_err(|e| format!("list v2: {e}"))?;
    if !old_heads.is_empty() || new_heads.len() != 1 {
        return Err(format!(
            "expected head on v2 only, got {} on v1 and {} on v2",
            old_heads.len(),
            new_heads.len()
        ));
    }
    // The superseded container stays readable.
    s.get_container(first.id)
        .await
        .map_err(|e| format!("old container lost: {e}"))?;
    Ok(())
}

async fn list_jobs_filters_by_status<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let queued = make_job(Uuid::new_v4(), Uuid::new_v4());
    let mut running = make_job(Uuid::new_v4(), Uuid::new_v4());
    running.status = JobStatus::Running;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    for job in [queued.clone(), running.clone()] {
        s.insert_job(&mut snap, job)
            .await
            .map_err(|e| format!("insert: {e}"))?;
    }
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let only_running = s
        .list_jobs(Some(JobStatus::Running))
        .await
        .map_err(|e| format!("list: {e}"))?;
    if only_running.len() != 1 || only_running[0].id != running.id {
        return Err(format!("expected only the running job, got {:?}", only_running));
    }
    let all = s.list_jobs(None).await.map_err(|e| format!("list: {e}"))?;
    if all.len() != 2 {
        return Err(format!("expected 2 jobs, got {}", all.len()));
    }
    Ok(())
}

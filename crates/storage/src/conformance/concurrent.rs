use std::future::Future;
use std::sync::Arc;

use uuid::Uuid;

use super::{make_container, make_edge, make_job, seed_container, TestResult};
use crate::{ContentStore, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_activations_leave_one_active",
        concurrent_activations_leave_one_active(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_job_creation_exactly_one_wins",
        concurrent_job_creation_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_head_moves_exactly_one_wins",
        concurrent_head_moves_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_distinct_heads_all_succeed",
        concurrent_distinct_heads_all_succeed(factory).await,
    ));

    results
}

// ── Concurrent activation: one active edge per family ───────────────────────

/// N tasks each activate a different version of the same (branch, schema)
/// family, deactivating whatever active edge they see. However the commits
/// interleave, exactly one edge may end up active.
async fn concurrent_activations_leave_one_active<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let (branch, schema) = (Uuid::new_v4(), Uuid::new_v4());

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let family = s
                .list_branch_schema_edges_for_update(&mut snap, branch, schema)
                .await?;
            for mut edge in family.into_iter().filter(|e| e.active) {
                edge.active = false;
                s.put_branch_schema_edge(&mut snap, edge).await?;
            }
            s.put_branch_schema_edge(&mut snap, make_edge(branch, schema, Uuid::new_v4(), true))
                .await?;
            match s.commit_snapshot(snap).await {
                Ok(()) => Ok(true),
                Err(StorageError::ConcurrentConflict { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }

    let edges = storage
        .list_branch_schema_edges(branch)
        .await
        .map_err(|e| format!("list: {e}"))?;
    let active = edges.iter().filter(|e| e.active).count();
    if winners == 0 {
        return Err("no activation committed".to_string());
    }
    if edges.len() != winners {
        return Err(format!(
            "expected {winners} edges (one per committed activation), got {}",
            edges.len()
        ));
    }
    if active != 1 {
        return Err(format!("expected exactly 1 active edge, got {active}"));
    }
    Ok(())
}

// ── Concurrent job creation: exactly one wins ───────────────────────────────

/// N tasks each create a job for the same (branch, schema) unless a job
/// already exists. Exactly one job may be stored.
async fn concurrent_job_creation_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let (branch, schema) = (Uuid::new_v4(), Uuid::new_v4());

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let existing = s.list_jobs_for_update(&mut snap, branch, schema).await?;
            if !existing.is_empty() {
                s.abort_snapshot(snap).await?;
                return Ok(false);
            }
            s.insert_job(&mut snap, make_job(branch, schema)).await?;
            match s.commit_snapshot(snap).await {
                Ok(()) => Ok(true),
                Err(StorageError::ConcurrentConflict { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    let jobs = storage
        .list_jobs(None)
        .await
        .map_err(|e| format!("list: {e}"))?;
    if jobs.len() != 1 {
        return Err(format!("expected 1 stored job, got {}", jobs.len()));
    }
    Ok(())
}

// ── Concurrent head moves from the same container ───────────────────────────

/// N tasks each read the same head and try to append a successor that was
/// derived from it. Only one successor may become the head; the rest must
/// conflict (the head they read is stale by then).
async fn concurrent_head_moves_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let (node, branch, v1) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let first = make_container(node, branch, v1);
    seed_container(storage.as_ref(), &first).await?;
    let first_id = first.id;

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        let key = first.head_key();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let head = s.get_container_head_for_update(&mut snap, &key).await?;
            if head.as_ref().map(|c| c.id) != Some(first_id) {
                s.abort_snapshot(snap).await?;
                return Ok(false);
            }
            let mut next = make_container(node, branch, Uuid::new_v4());
            next.previous_id = Some(first_id);
            let next_id = next.id;
            s.insert_container(&mut snap, next).await?;
            s.set_container_head(&mut snap, &key, next_id).await?;
            match s.commit_snapshot(snap).await {
                Ok(()) => Ok(true),
                Err(StorageError::ConcurrentConflict { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    let head = storage
        .get_container_head(&first.head_key())
        .await
        .map_err(|e| format!("head: {e}"))?
        .ok_or_else(|| "head missing".to_string())?;
    if head.previous_id != Some(first_id) {
        return Err("head is not a successor of the first container".to_string());
    }
    Ok(())
}

// ── Concurrent updates to different heads: all succeed ──────────────────────

/// N tasks each append to a different node. All should succeed; no false
/// conflicts when there is no contention.
async fn concurrent_distinct_heads_all_succeed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let (branch, version) = (Uuid::new_v4(), Uuid::new_v4());

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let container = make_container(Uuid::new_v4(), branch, version);
            let mut snap = s.begin_snapshot().await?;
            s.get_container_head_for_update(&mut snap, &container.head_key())
                .await?;
            let (key, id) = (container.head_key(), container.id);
            s.insert_container(&mut snap, container).await?;
            s.set_container_head(&mut snap, &key, id).await?;
            s.commit_snapshot(snap).await
        }));
    }

    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
    }

    let heads = storage
        .list_container_heads(branch, version)
        .await
        .map_err(|e| format!("list: {e}"))?;
    if heads.len() != N {
        return Err(format!("expected {N} heads, got {}", heads.len()));
    }
    Ok(())
}

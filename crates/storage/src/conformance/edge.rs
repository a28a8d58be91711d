//! Branch → schema version edge conformance tests.

use std::future::Future;

use uuid::Uuid;

use super::{make_edge, TestResult};
use crate::record::EdgeMigrationStatus;
use crate::{ContentStore, StorageError};

pub(super) async fn run_edge_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "edge",
        "family_listing_is_scoped",
        family_listing_is_scoped(factory).await,
    ));
    results.push(TestResult::from_result(
        "edge",
        "put_replaces_same_branch_and_version",
        put_replaces_same_branch_and_version(factory).await,
    ));
    results.push(TestResult::from_result(
        "edge",
        "family_write_conflicts_with_family_read",
        family_write_conflicts_with_family_read(factory).await,
    ));

    results
}

async fn family_listing_is_scoped<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let (branch, other_branch) = (Uuid::new_v4(), Uuid::new_v4());
    let (schema, other_schema) = (Uuid::new_v4(), Uuid::new_v4());

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    for edge in [
        make_edge(branch, schema, Uuid::new_v4(), false),
        make_edge(branch, schema, Uuid::new_v4(), true),
        make_edge(branch, other_schema, Uuid::new_v4(), true),
        make_edge(other_branch, schema, Uuid::new_v4(), true),
    ] {
        s.put_branch_schema_edge(&mut snap, edge)
            .await
            .map_err(|e| format!("put: {e}"))?;
    }
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let family = s
        .list_branch_schema_edges_for_update(&mut snap, branch, schema)
        .await
        .map_err(|e| format!("list family: {e}"))?;
    let _ = s.abort_snapshot(snap).await;
    if family.len() != 2 {
        return Err(format!("expected 2 edges in family, got {}", family.len()));
    }
    if family.iter().filter(|e| e.active).count() != 1 {
        return Err("expected exactly one active edge in family".to_string());
    }

    let in_branch = s
        .list_branch_schema_edges(branch)
        .await
        .map_err(|e| format!("list branch: {e}"))?;
    if in_branch.len() != 3 {
        return Err(format!("expected 3 edges in branch, got {}", in_branch.len()));
    }
    Ok(())
}

async fn put_replaces_same_branch_and_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let (branch, schema, version) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let mut edge = make_edge(branch, schema, version, false);
    edge.migration_status = EdgeMigrationStatus::Pending;
    edge.job_id = Some(Uuid::new_v4());

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.put_branch_schema_edge(&mut snap, edge.clone())
        .await
        .map_err(|e| format!("put: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    edge.active = true;
    edge.migration_status = EdgeMigrationStatus::Completed;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.put_branch_schema_edge(&mut snap, edge.clone())
        .await
        .map_err(|e| format!("put again: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let edges = s
        .list_branch_schema_edges(branch)
        .await
        .map_err(|e| format!("list: {e}"))?;
    if edges != vec![edge] {
        return Err(format!("expected the replaced edge only, got {:?}", edges));
    }
    Ok(())
}

/// A snapshot that listed a family must not commit after another snapshot
/// added an edge to that family.
async fn family_write_conflicts_with_family_read<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let (branch, schema) = (Uuid::new_v4(), Uuid::new_v4());

    let mut reader = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.list_branch_schema_edges_for_update(&mut reader, branch, schema)
        .await
        .map_err(|e| format!("list: {e}"))?;
    s.put_branch_schema_edge(&mut reader, make_edge(branch, schema, Uuid::new_v4(), true))
        .await
        .map_err(|e| format!("put reader: {e}"))?;

    let mut writer = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.put_branch_schema_edge(&mut writer, make_edge(branch, schema, Uuid::new_v4(), true))
        .await
        .map_err(|e| format!("put writer: {e}"))?;
    s.commit_snapshot(writer)
        .await
        .map_err(|e| format!("commit writer: {e}"))?;

    match s.commit_snapshot(reader).await {
        Err(StorageError::ConcurrentConflict { .. }) => Ok(()),
        other => Err(format!("expected ConcurrentConflict, got {:?}", other)),
    }
}

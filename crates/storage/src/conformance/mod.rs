//! Conformance test suite for `ContentStore` implementations.
//!
//! This module provides a backend-agnostic test suite that any `ContentStore`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Snapshot isolation**: uncommitted writes invisible, own writes visible, aborts discarded
//! - **Atomic commit**: all-or-nothing semantics for multi-record snapshots,
//!   including the pending index queue
//! - **Edges**: family-scoped listing and replacement of branch → version edges
//! - **Error handling**: correct error variants for missing and duplicate records
//! - **Concurrency / OCC**: conflicting transactions never both take effect
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty store for each test:
//!
//! ```ignore
//! use quire_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn memory_conformance() {
//!     let report = run_conformance_suite(|| async { MemoryStore::new() }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod commit;
mod concurrent;
mod edge;
mod error;
mod snapshot;

use std::fmt;
use std::future::Future;

use serde_json::{json, Map};
use uuid::Uuid;

use crate::record::{
    now_rfc3339, BranchSchemaEdgeRecord, ContainerRecord, EdgeMigrationStatus, MigrationJobRecord,
};
use crate::ContentStore;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "snapshot", "commit", "edge").
    pub category: String,
    /// Test name (e.g. "uncommitted_job_invisible").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// store, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: ContentStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(error::run_error_tests(&factory).await);
    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(commit::run_commit_tests(&factory).await);
    results.extend(edge::run_edge_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

fn make_edge(
    branch_id: Uuid,
    schema_id: Uuid,
    version_id: Uuid,
    active: bool,
) -> BranchSchemaEdgeRecord {
    BranchSchemaEdgeRecord {
        branch_id,
        schema_id,
        version_id,
        active,
        migration_status: EdgeMigrationStatus::Completed,
        job_id: None,
    }
}

fn make_job(branch_id: Uuid, schema_id: Uuid) -> MigrationJobRecord {
    MigrationJobRecord::queued(branch_id, schema_id, Uuid::new_v4(), Uuid::new_v4())
}

fn make_container(node_uuid: Uuid, branch_id: Uuid, version_id: Uuid) -> ContainerRecord {
    let mut fields = Map::new();
    fields.insert("title".to_string(), json!("Hello"));
    ContainerRecord {
        id: Uuid::new_v4(),
        node_uuid,
        language: "en".to_string(),
        branch_id,
        schema_version_id: version_id,
        fields,
        previous_id: None,
        job_id: None,
        warnings: Vec::new(),
        created_at: now_rfc3339(),
    }
}

/// Commit a single container and point its head at it.
async fn seed_container<S: ContentStore>(
    store: &S,
    container: &ContainerRecord,
) -> Result<(), String> {
    let mut snap = store.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    store
        .insert_container(&mut snap, container.clone())
        .await
        .map_err(|e| format!("insert container: {e}"))?;
    store
        .set_container_head(&mut snap, &container.head_key(), container.id)
        .await
        .map_err(|e| format!("set head: {e}"))?;
    store
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))
}

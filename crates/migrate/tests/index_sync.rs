//! Search index synchronisation after migrations, against `MemoryIndex`.

use std::sync::Arc;
use std::time::Duration;

use quire_migrate::{
    document_id, BroadcastEventBus, IndexConfig, IndexOp, MemoryIndex, MigrationService,
    QuireConfig, SchemaUpdateOutcome,
};
use quire_schema::{ElementType, FieldSchema, FieldType, Schema, SchemaChange};
use quire_storage::{
    BranchRecord, ContainerRecord, ContentStore, JobStatus, MemoryStore, MigrationJobRecord,
    PendingIndexAction,
};
use serde_json::json;
use uuid::Uuid;

struct Fixture {
    index: Arc<MemoryIndex>,
    service: MigrationService<MemoryStore, MemoryIndex, BroadcastEventBus>,
    branch: BranchRecord,
    schema_id: Uuid,
    nodes: Vec<ContainerRecord>,
}

async fn fixture(index_config: IndexConfig) -> Fixture {
    let index = Arc::new(MemoryIndex::new());
    let config = QuireConfig {
        index: index_config,
        ..QuireConfig::default()
    };
    let service = MigrationService::new(
        Arc::new(MemoryStore::new()),
        index.clone(),
        Arc::new(BroadcastEventBus::default()),
        config,
    );
    let (_, branch) = service.create_project("demo", "main").await.unwrap();
    let schema = Schema::new("article")
        .with_field(FieldSchema::new("title", FieldType::String).required())
        .with_field(FieldSchema::new("body", FieldType::Html))
        .with_field(FieldSchema::new("flags", FieldType::List(ElementType::Boolean)))
        .with_display_field("title");
    let v1 = service.create_schema(schema).await.unwrap();
    service.assign_schema_version(branch.id, v1.id).await.unwrap();

    let mut nodes = Vec::new();
    for (i, lang) in ["en", "en", "de"].iter().enumerate() {
        let fields = json!({
            "title": format!("article {}", i),
            "body": "<p>text</p>",
            "flags": [true, false],
        });
        let node = service
            .create_node(branch.id, v1.id, lang, fields.as_object().cloned().unwrap())
            .await
            .unwrap();
        nodes.push(node);
    }
    Fixture {
        index,
        service,
        branch,
        schema_id: v1.schema_id,
        nodes,
    }
}

async fn remove_body(fx: &Fixture) -> MigrationJobRecord {
    let outcome = fx
        .service
        .apply_schema_changes(
            fx.schema_id,
            vec![SchemaChange::RemoveField {
                name: "body".to_string(),
            }],
        )
        .await
        .unwrap();
    let SchemaUpdateOutcome::MigrationInvoked { jobs, .. } = outcome else {
        panic!("expected a migration");
    };
    fx.service.wait_for_job(jobs[0]).await.unwrap()
}

fn fast_retries(retry_limit: u32) -> IndexConfig {
    IndexConfig {
        retry_limit,
        retry_backoff_ms: 1,
        ..IndexConfig::default()
    }
}

#[tokio::test]
async fn migrated_nodes_are_indexed_under_the_new_type() {
    let fx = fixture(fast_retries(3)).await;
    let job = remove_body(&fx).await;
    assert_eq!(job.status, JobStatus::Done);

    assert_eq!(fx.index.document_count("node").await, 3);
    let node = &fx.nodes[2];
    let stored = fx
        .index
        .document("node", &document_id(node.node_uuid, "de"))
        .await
        .unwrap();
    assert_eq!(stored.doc_type, "article-2");
    let doc = &stored.document;
    assert_eq!(doc["uuid"], json!(node.node_uuid.to_string()));
    assert_eq!(doc["language"], "de");
    assert_eq!(doc["branch"]["name"], "main");
    assert_eq!(doc["schema"]["version"], 2);
    assert_eq!(doc["displayField"]["value"], "article 2");
    assert_eq!(doc["fields"]["flags"], json!(["true", "false"]));
    assert!(doc["fields"].get("body").is_none());

    let mapping = fx.index.mapping("node", "article-2").await.unwrap();
    assert!(mapping.get("article-2").is_some());
}

#[tokio::test]
async fn stale_documents_are_deleted_before_store() {
    let fx = fixture(fast_retries(3)).await;
    remove_body(&fx).await;

    let ops = fx.index.ops().await;
    let first_store = ops
        .iter()
        .position(|op| matches!(op, IndexOp::Store { .. }))
        .unwrap();
    let mapping = ops
        .iter()
        .position(|op| {
            matches!(op, IndexOp::PutMapping { doc_type, .. } if doc_type == "article-2")
        })
        .unwrap();
    assert!(mapping < first_store);
    assert_eq!(
        ops.iter()
            .filter(|op| matches!(op, IndexOp::PutMapping { .. }))
            .count(),
        1
    );

    for (i, op) in ops.iter().enumerate() {
        let IndexOp::Store { id, .. } = op else {
            continue;
        };
        let uuid = id.rsplit_once('-').map(|(uuid, _)| uuid).unwrap();
        let deleted_before = ops[..i].iter().any(|prior| match prior {
            IndexOp::DeleteByQuery { query, .. } => query.to_string().contains(uuid),
            _ => false,
        });
        assert!(deleted_before, "store of {} without prior delete", id);
    }
    assert!(matches!(ops.last(), Some(IndexOp::Refresh { .. })));
}

#[tokio::test]
async fn unavailable_index_does_not_fail_the_job() {
    let fx = fixture(fast_retries(1)).await;
    fx.index.fail_next(1000);
    let job = remove_body(&fx).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(fx.index.document_count("node").await, 0);

    fx.index.fail_next(0);
    let report = fx.service.reindex_branch(fx.branch.id).await;
    assert_eq!(report.stored, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(fx.index.document_count("node").await, 3);
}

async fn pending_count(fx: &Fixture) -> usize {
    fx.service
        .store()
        .list_pending_index_entries()
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn failed_entries_are_delivered_once_the_index_recovers() {
    let fx = fixture(IndexConfig {
        pending_retry_interval_ms: 20,
        ..fast_retries(1)
    })
    .await;
    fx.index.fail_next(1000);
    let job = remove_body(&fx).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(fx.index.document_count("node").await, 0);

    let pending = fx
        .service
        .store()
        .list_pending_index_entries()
        .await
        .unwrap();
    assert_eq!(pending.len(), 3);
    assert!(pending
        .iter()
        .all(|p| matches!(p.action, PendingIndexAction::Store { .. })));
    assert!(pending.iter().all(|p| p.last_error.is_some()));

    fx.index.fail_next(0);
    for _ in 0..200 {
        if pending_count(&fx).await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pending_count(&fx).await, 0);
    assert_eq!(fx.index.document_count("node").await, 3);
    let stored = fx
        .index
        .document("node", &document_id(fx.nodes[1].node_uuid, "en"))
        .await
        .unwrap();
    assert_eq!(stored.doc_type, "article-2");
}

#[tokio::test]
async fn pending_entries_are_delivered_at_startup() {
    let fx = fixture(IndexConfig {
        pending_retry_interval_ms: 60_000,
        ..fast_retries(1)
    })
    .await;
    fx.index.fail_next(1000);
    remove_body(&fx).await;
    assert_eq!(pending_count(&fx).await, 3);
    fx.service.shutdown().await;

    // A fresh service over the same store and index picks the queue up.
    fx.index.fail_next(0);
    let restarted = MigrationService::new(
        fx.service.store().clone(),
        fx.index.clone(),
        Arc::new(BroadcastEventBus::default()),
        QuireConfig::default(),
    );
    assert!(restarted.resume_incomplete_jobs().await.unwrap().is_empty());
    assert_eq!(fx.index.document_count("node").await, 3);
    assert!(restarted
        .store()
        .list_pending_index_entries()
        .await
        .unwrap()
        .is_empty());
    restarted.shutdown().await;
}

#[tokio::test]
async fn retry_counts_attempts_while_the_index_is_down() {
    let fx = fixture(IndexConfig {
        pending_retry_interval_ms: 60_000,
        ..fast_retries(1)
    })
    .await;
    fx.index.fail_next(1000);
    remove_body(&fx).await;

    let report = fx.service.retry_pending_index().await;
    assert_eq!(report.failed, 3);
    let pending = fx
        .service
        .store()
        .list_pending_index_entries()
        .await
        .unwrap();
    assert!(pending.iter().all(|p| p.attempts == 2));

    fx.index.fail_next(0);
    let report = fx.service.retry_pending_index().await;
    assert_eq!(report.stored, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(pending_count(&fx).await, 0);
}

#[tokio::test]
async fn transient_index_failures_are_retried() {
    let fx = fixture(fast_retries(3)).await;
    fx.index.fail_next(2);
    remove_body(&fx).await;
    assert_eq!(fx.index.document_count("node").await, 3);
}

#[tokio::test]
async fn reindex_covers_only_active_versions() {
    let fx = fixture(fast_retries(3)).await;
    let report = fx.service.reindex_branch(fx.branch.id).await;
    assert_eq!(report.stored, 3);
    let stored = fx
        .index
        .document("node", &document_id(fx.nodes[0].node_uuid, "en"))
        .await
        .unwrap();
    assert_eq!(stored.doc_type, "article-1");

    remove_body(&fx).await;
    let report = fx.service.reindex_branch(fx.branch.id).await;
    assert_eq!(report.stored, 3);
    assert_eq!(report.deleted, 3);
    assert_eq!(fx.index.document_count("node").await, 3);
    let stored = fx
        .index
        .document("node", &document_id(fx.nodes[0].node_uuid, "en"))
        .await
        .unwrap();
    assert_eq!(stored.doc_type, "article-2");
}

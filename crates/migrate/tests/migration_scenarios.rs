//! End-to-end schema update scenarios through `MigrationService` on the
//! in-memory store and index.

use std::sync::Arc;

use quire_migrate::{
    AssignOutcome, BroadcastEventBus, MemoryIndex, MigrationError, MigrationEvent,
    MigrationService, QuireConfig, SchemaUpdateOutcome,
};
use quire_schema::{ElementType, FieldSchema, FieldType, Schema, SchemaChange, SchemaVersion};
use quire_storage::{
    BranchRecord, ContainerRecord, ContentStore, EdgeMigrationStatus, HeadKey, JobStatus,
    MemoryStore, MigrationJobRecord,
};
use serde_json::{json, Map, Value};
use uuid::Uuid;

type Service = MigrationService<MemoryStore, MemoryIndex, BroadcastEventBus>;

struct Fixture {
    store: Arc<MemoryStore>,
    bus: Arc<BroadcastEventBus>,
    service: Service,
    branch: BranchRecord,
    v1: SchemaVersion,
}

fn article() -> Schema {
    Schema::new("article")
        .with_field(FieldSchema::new("title", FieldType::String).required())
        .with_field(FieldSchema::new("subtitle", FieldType::String).required())
        .with_field(FieldSchema::new("body", FieldType::Html))
        .with_display_field("title")
}

fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

async fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(BroadcastEventBus::default());
    let service = MigrationService::new(
        store.clone(),
        Arc::new(MemoryIndex::new()),
        bus.clone(),
        QuireConfig::default(),
    );
    let (_, branch) = service.create_project("demo", "main").await.unwrap();
    let v1 = service.create_schema(article()).await.unwrap();
    let outcome = service.assign_schema_version(branch.id, v1.id).await.unwrap();
    assert!(matches!(outcome, AssignOutcome::Activated(_)));
    Fixture {
        store,
        bus,
        service,
        branch,
        v1,
    }
}

async fn create_article(fx: &Fixture, language: &str, value: Value) -> ContainerRecord {
    fx.service
        .create_node(fx.branch.id, fx.v1.id, language, fields(value))
        .await
        .unwrap()
}

async fn head(fx: &Fixture, node: &ContainerRecord) -> ContainerRecord {
    fx.store
        .get_container_head(&HeadKey::new(node.node_uuid, node.language.clone(), fx.branch.id))
        .await
        .unwrap()
        .unwrap()
}

async fn single_job(fx: &Fixture, outcome: SchemaUpdateOutcome) -> MigrationJobRecord {
    let SchemaUpdateOutcome::MigrationInvoked { jobs, .. } = outcome else {
        panic!("expected a migration, got {:?}", outcome);
    };
    assert_eq!(jobs.len(), 1);
    fx.service.wait_for_job(jobs[0]).await.unwrap()
}

#[tokio::test]
async fn adding_a_list_field_gives_empty_lists() {
    let fx = fixture().await;
    let node = create_article(&fx, "en", json!({"title": "Hello", "subtitle": "World"})).await;

    let tags = FieldSchema::new("tags", FieldType::List(ElementType::String));
    let target = article().with_field(tags);
    let diff = fx.service.diff_schema(fx.v1.schema_id, &target).await.unwrap();
    assert_eq!(
        diff,
        vec![SchemaChange::AddField {
            field: FieldSchema::new("tags", FieldType::List(ElementType::String)),
        }]
    );

    let outcome = fx.service.update_schema(fx.v1.schema_id, target).await.unwrap();
    assert_eq!(outcome.message(), "migration_invoked");
    let job = single_job(&fx, outcome).await;
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.warnings.is_empty());
    let cause = job.cause.as_ref().unwrap();
    assert_eq!(cause.origin, "quire-node");
    assert_eq!(cause.branch.name, "main");
    assert_eq!(cause.to_version.version, 2);

    let migrated = head(&fx, &node).await;
    assert_eq!(migrated.fields["tags"], json!([]));
    assert_eq!(migrated.fields["title"], "Hello");
    assert_eq!(migrated.previous_id, Some(node.id));
    assert_eq!(migrated.schema_version_id, job.to_version_id);

    let edges = fx.store.list_branch_schema_edges(fx.branch.id).await.unwrap();
    let active: Vec<_> = edges.iter().filter(|e| e.active).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].version_id, job.to_version_id);
    assert_eq!(active[0].migration_status, EdgeMigrationStatus::Completed);
    assert_eq!(active[0].job_id, Some(job.id));
}

#[tokio::test]
async fn removing_required_field_with_data_warns() {
    let fx = fixture().await;
    let node = create_article(&fx, "en", json!({"title": "Hi", "subtitle": "Hello"})).await;

    let outcome = fx
        .service
        .apply_schema_changes(
            fx.v1.schema_id,
            vec![SchemaChange::RemoveField {
                name: "subtitle".to_string(),
            }],
        )
        .await
        .unwrap();
    let job = single_job(&fx, outcome).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.warnings.len(), 1);
    assert_eq!(job.warnings[0].field_name, "subtitle");
    assert_eq!(job.warnings[0].reason, "required field removed with data loss");
    assert_eq!(job.warnings[0].node_uuid, node.node_uuid);

    let migrated = head(&fx, &node).await;
    assert!(!migrated.fields.contains_key("subtitle"));
    let original = fx.store.get_container(node.id).await.unwrap();
    assert_eq!(original, node);

    let status = fx.service.job_status(job.id).await.unwrap();
    assert_eq!(status.status, JobStatus::Done);
    assert_eq!(status.warnings, job.warnings);
}

#[tokio::test]
async fn identical_schema_is_no_difference() {
    let fx = fixture().await;
    let outcome = fx.service.update_schema(fx.v1.schema_id, article()).await.unwrap();
    assert_eq!(outcome, SchemaUpdateOutcome::NoDifference);
    assert_eq!(outcome.message(), "schema_update_no_difference_detected");

    let versions = fx.store.list_schema_versions(fx.v1.schema_id).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert!(fx.service.list_jobs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_change_creates_no_job() {
    let fx = fixture().await;
    let err = fx
        .service
        .apply_schema_changes(
            fx.v1.schema_id,
            vec![SchemaChange::UpdateField {
                name: "missing".to_string(),
                new_type: Some(FieldType::Number),
                new_required: None,
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Validation(_)), "{err}");
    assert!(fx.service.list_jobs(None).await.unwrap().is_empty());
    let container = fx.store.get_schema_container(fx.v1.schema_id).await.unwrap();
    assert_eq!(container.latest_version_id, fx.v1.id);
}

#[tokio::test]
async fn unfinished_job_rejects_update() {
    let fx = fixture().await;
    let blocker =
        MigrationJobRecord::queued(fx.branch.id, fx.v1.schema_id, fx.v1.id, Uuid::new_v4());
    let mut snap = fx.store.begin_snapshot().await.unwrap();
    fx.store.insert_job(&mut snap, blocker).await.unwrap();
    fx.store.commit_snapshot(snap).await.unwrap();

    let err = fx
        .service
        .apply_schema_changes(
            fx.v1.schema_id,
            vec![SchemaChange::RemoveField {
                name: "body".to_string(),
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Conflict(_)), "{err}");
    let versions = fx.store.list_schema_versions(fx.v1.schema_id).await.unwrap();
    assert_eq!(versions.len(), 1);
}

#[tokio::test]
async fn rename_and_retype_across_languages() {
    let fx = fixture().await;
    let schema = Schema::new("product")
        .with_field(FieldSchema::new("name", FieldType::String))
        .with_field(FieldSchema::new("price", FieldType::String));
    let v1 = fx.service.create_schema(schema).await.unwrap();
    fx.service.assign_schema_version(fx.branch.id, v1.id).await.unwrap();

    let node = Uuid::new_v4();
    for (lang, price) in [("en", "12"), ("de", "zwölf")] {
        fx.service
            .store_content(
                fx.branch.id,
                node,
                lang,
                v1.id,
                fields(json!({"name": "Chair", "price": price})),
            )
            .await
            .unwrap();
    }

    let outcome = fx
        .service
        .apply_schema_changes(
            v1.schema_id,
            vec![
                SchemaChange::RenameField {
                    from: "name".to_string(),
                    to: "title".to_string(),
                },
                SchemaChange::UpdateField {
                    name: "price".to_string(),
                    new_type: Some(FieldType::Number),
                    new_required: None,
                },
            ],
        )
        .await
        .unwrap();
    let job = single_job(&fx, outcome).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.warnings.len(), 1);
    assert_eq!(job.warnings[0].language, "de");
    assert_eq!(job.warnings[0].field_name, "price");

    let en = fx
        .store
        .get_container_head(&HeadKey::new(node, "en", fx.branch.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(en.fields["title"], "Chair");
    assert_eq!(en.fields["price"], json!(12));
    let de = fx
        .store
        .get_container_head(&HeadKey::new(node, "de", fx.branch.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(de.fields["title"], "Chair");
    assert!(!de.fields.contains_key("price"));
}

#[tokio::test]
async fn assignment_outcomes() {
    let fx = fixture().await;
    let again = fx
        .service
        .assign_schema_version(fx.branch.id, fx.v1.id)
        .await
        .unwrap();
    assert!(matches!(again, AssignOutcome::AlreadyActive(_)));

    let outcome = fx
        .service
        .apply_schema_changes(
            fx.v1.schema_id,
            vec![SchemaChange::RemoveField {
                name: "body".to_string(),
            }],
        )
        .await
        .unwrap();
    let job = single_job(&fx, outcome).await;

    let feature = fx.service.create_branch(fx.branch.project_id, "feature").await.unwrap();
    fx.service
        .assign_schema_version(feature.id, fx.v1.id)
        .await
        .unwrap();
    create_article_in(&fx, feature.id).await;

    match fx
        .service
        .assign_schema_version(feature.id, job.to_version_id)
        .await
        .unwrap()
    {
        AssignOutcome::MigrationInvoked(job) => {
            let done = fx.service.wait_for_job(job.id).await.unwrap();
            assert_eq!(done.status, JobStatus::Done);
        }
        other => panic!("expected a migration, got {:?}", other),
    }

    let downgrade = fx
        .service
        .assign_schema_version(feature.id, fx.v1.id)
        .await
        .unwrap_err();
    assert!(matches!(downgrade, MigrationError::Conflict(_)));
}

async fn create_article_in(fx: &Fixture, branch_id: Uuid) -> ContainerRecord {
    fx.service
        .create_node(
            branch_id,
            fx.v1.id,
            "en",
            fields(json!({"title": "Feature", "subtitle": "Branch"})),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn missing_branch_fails_the_job() {
    let fx = fixture().await;
    let mut rx = fx.bus.subscribe();
    let job = MigrationJobRecord::queued(Uuid::new_v4(), fx.v1.schema_id, fx.v1.id, fx.v1.id);
    let job_id = job.id;
    let mut snap = fx.store.begin_snapshot().await.unwrap();
    fx.store.insert_job(&mut snap, job).await.unwrap();
    fx.store.commit_snapshot(snap).await.unwrap();

    let done = fx
        .service
        .runner()
        .run(job_id, quire_migrate::CancelToken::new())
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(
        done.error.as_deref(),
        Some(format!("Branch for job {} not found", job_id).as_str())
    );

    match rx.recv().await.unwrap() {
        MigrationEvent::MigrationFinished(model) => {
            assert_eq!(model.job_id, job_id);
            assert_eq!(model.status, JobStatus::Failed);
            assert!(model.error.is_some());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn events_follow_the_job_lifecycle() {
    let fx = fixture().await;
    create_article(&fx, "en", json!({"title": "a", "subtitle": "b"})).await;
    let mut rx = fx.bus.subscribe();

    let outcome = fx
        .service
        .apply_schema_changes(
            fx.v1.schema_id,
            vec![SchemaChange::RemoveField {
                name: "body".to_string(),
            }],
        )
        .await
        .unwrap();
    single_job(&fx, outcome).await;

    let mut names = Vec::new();
    let mut statuses = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let MigrationEvent::BranchSchemaAssign(model) = &event {
            statuses.push(model.status);
        }
        names.push(event.name());
    }
    assert_eq!(
        names,
        vec![
            "MIGRATION_START",
            "BRANCH_SCHEMA_ASSIGN",
            "BRANCH_SCHEMA_ASSIGN",
            "MIGRATION_FINISHED"
        ]
    );
    assert_eq!(
        statuses,
        vec![EdgeMigrationStatus::Pending, EdgeMigrationStatus::Completed]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_invoke_one_migration() {
    let fx = Arc::new(fixture().await);
    create_article(&fx, "en", json!({"title": "a", "subtitle": "b"})).await;

    let mut handles = Vec::new();
    for i in 0..4 {
        let fx = fx.clone();
        handles.push(tokio::spawn(async move {
            fx.service
                .apply_schema_changes(
                    fx.v1.schema_id,
                    vec![SchemaChange::AddField {
                        field: FieldSchema::new(format!("extra{}", i), FieldType::Number),
                    }],
                )
                .await
        }));
    }

    let mut invoked = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(SchemaUpdateOutcome::MigrationInvoked { jobs, .. }) => invoked.push(jobs),
            Ok(other) => panic!("unexpected outcome {:?}", other),
            Err(MigrationError::Conflict(_)) | Err(MigrationError::Storage(_)) => {}
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert_eq!(invoked.len(), 1);
    let job = fx.service.wait_for_job(invoked[0][0]).await.unwrap();
    assert_eq!(job.status, JobStatus::Done);
    let versions = fx.store.list_schema_versions(fx.v1.schema_id).await.unwrap();
    assert_eq!(versions.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_assignments_leave_one_active_edge() {
    let fx = Arc::new(fixture().await);
    let outcome = fx
        .service
        .apply_schema_changes(
            fx.v1.schema_id,
            vec![SchemaChange::RemoveField {
                name: "body".to_string(),
            }],
        )
        .await
        .unwrap();
    let job = single_job(&fx, outcome).await;
    let project = fx.branch.project_id;
    let fresh = fx.service.create_branch(project, "fresh").await.unwrap();

    let mut handles = Vec::new();
    for version in [fx.v1.id, job.to_version_id, fx.v1.id, job.to_version_id] {
        let fx = fx.clone();
        let branch = fresh.id;
        handles.push(tokio::spawn(async move {
            fx.service.assign_schema_version(branch, version).await
        }));
    }
    for handle in handles {
        if let Ok(AssignOutcome::MigrationInvoked(job)) = handle.await.unwrap() {
            fx.service.wait_for_job(job.id).await.unwrap();
        }
    }

    let edges = fx.store.list_branch_schema_edges(fresh.id).await.unwrap();
    assert_eq!(edges.iter().filter(|e| e.active).count(), 1);
    assert!(edges.iter().all(|e| !e.is_pending()));
}

//! CLI migrate subcommand.
//!
//! Loads a fixture (a schema, its requested successor or a change list, and
//! node content) into an in-memory store, runs the migration through
//! `MigrationService`, and reports the jobs and the migrated node heads.

use std::path::Path;
use std::process;
use std::sync::Arc;

use quire_migrate::{
    BroadcastEventBus, JobStatusView, MemoryIndex, MigrationError, MigrationService, QuireConfig,
    SchemaUpdateOutcome,
};
use quire_schema::{changes_to_text, Schema, SchemaChange};
use quire_storage::{ContentStore, HeadKey, JobStatus, MemoryStore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{load_json, print_json, report_error, OutputFormat};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Fixture {
    schema: Schema,
    /// Requested next schema; diffed against `schema`.
    #[serde(default)]
    target: Option<Schema>,
    #[serde(default)]
    changes: Option<Vec<SchemaChange>>,
    #[serde(default)]
    nodes: Vec<FixtureNode>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FixtureNode {
    #[serde(default = "default_language")]
    language: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

fn default_language() -> String {
    "en".to_string()
}

enum Update {
    Target(Schema),
    Changes(Vec<SchemaChange>),
}

#[derive(Debug, Serialize)]
struct MigrationReport {
    #[serde(flatten)]
    outcome: SchemaUpdateOutcome,
    changes: Vec<SchemaChange>,
    #[serde(rename = "jobStatus")]
    job_status: Vec<JobStatusView>,
    nodes: Vec<NodeReport>,
}

#[derive(Debug, Serialize)]
struct NodeReport {
    uuid: String,
    language: String,
    version: u32,
    fields: Map<String, Value>,
}

/// Run the fixture at `path` and report. Exits 1 when a job fails.
pub(crate) fn cmd_migrate(path: &Path, config: QuireConfig, output: OutputFormat, quiet: bool) {
    let fixture: Fixture = load_json(path, output, quiet);
    let update = match (fixture.target, fixture.changes) {
        (Some(target), None) => Update::Target(target),
        (None, Some(changes)) => Update::Changes(changes),
        _ => {
            let msg = format!(
                "fixture '{}' must contain exactly one of 'target' or 'changes'",
                path.display()
            );
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };
    tracing::info!(fixture = %path.display(), nodes = fixture.nodes.len(), "fixture loaded");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            report_error(&format!("failed to start runtime: {}", e), output, quiet);
            process::exit(1);
        }
    };
    let report = match runtime.block_on(run(fixture.schema, update, fixture.nodes, config)) {
        Ok(report) => report,
        Err(e) => {
            report_error(&format!("migration error: {}", e), output, quiet);
            process::exit(1);
        }
    };

    if !quiet {
        match output {
            OutputFormat::Json => print_json(&report),
            OutputFormat::Text => display_report_text(&report),
        }
    }

    let failed: Vec<&JobStatusView> = report
        .job_status
        .iter()
        .filter(|j| j.status == JobStatus::Failed)
        .collect();
    if !failed.is_empty() {
        for job in failed {
            let msg = format!(
                "job {} failed: {}",
                job.job_id,
                job.error.as_deref().unwrap_or("unknown error")
            );
            report_error(&msg, output, quiet);
        }
        process::exit(1);
    }
}

async fn run(
    schema: Schema,
    update: Update,
    nodes: Vec<FixtureNode>,
    config: QuireConfig,
) -> Result<MigrationReport, MigrationError> {
    let store = Arc::new(MemoryStore::new());
    let service = MigrationService::new(
        store.clone(),
        Arc::new(MemoryIndex::new()),
        Arc::new(BroadcastEventBus::default()),
        config,
    );

    let (_, branch) = service.create_project("fixture", "main").await?;
    let v1 = service.create_schema(schema).await?;
    service.assign_schema_version(branch.id, v1.id).await?;
    let mut keys: Vec<HeadKey> = Vec::with_capacity(nodes.len());
    for node in nodes {
        let container = service
            .create_node(branch.id, v1.id, &node.language, node.fields)
            .await?;
        keys.push(container.head_key());
    }

    let changes = match update {
        Update::Target(target) => service.diff_schema(v1.schema_id, &target).await?,
        Update::Changes(changes) => changes,
    };
    let outcome = service
        .apply_schema_changes(v1.schema_id, changes.clone())
        .await?;

    let mut job_status = Vec::new();
    if let SchemaUpdateOutcome::MigrationInvoked { jobs, .. } = &outcome {
        for job_id in jobs {
            service.wait_for_job(*job_id).await?;
            job_status.push(service.job_status(*job_id).await?);
        }
    }

    let mut reports = Vec::with_capacity(keys.len());
    for key in &keys {
        let Some(head) = store.get_container_head(key).await? else {
            continue;
        };
        let version = store.get_schema_version(head.schema_version_id).await?;
        reports.push(NodeReport {
            uuid: head.node_uuid.to_string(),
            language: head.language,
            version: version.version,
            fields: head.fields,
        });
    }
    service.shutdown().await;

    Ok(MigrationReport {
        outcome,
        changes,
        job_status,
        nodes: reports,
    })
}

fn display_report_text(report: &MigrationReport) {
    match &report.outcome {
        SchemaUpdateOutcome::NoDifference => {
            println!("{}", report.outcome.message());
            return;
        }
        SchemaUpdateOutcome::MigrationInvoked { version, .. } => {
            println!(
                "{}: {} version {}",
                report.outcome.message(),
                version.name,
                version.version
            );
        }
    }
    println!();
    println!("Changes ({}):", report.changes.len());
    for line in changes_to_text(&report.changes).lines() {
        println!("  {}", line);
    }
    println!();

    for job in &report.job_status {
        println!("Job {}: {}", job.job_id, job.status);
        if let Some(error) = &job.error {
            println!("  error: {}", error);
        }
        for warning in &job.warnings {
            println!("  warning: {}", warning);
        }
    }
    println!();

    println!("Nodes ({}):", report.nodes.len());
    for node in &report.nodes {
        println!(
            "  {}/{} v{} {}",
            node.uuid,
            node.language,
            node.version,
            Value::Object(node.fields.clone())
        );
    }
}

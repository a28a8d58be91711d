//! Migration lifecycle events.
//!
//! Events are published fire-and-forget after the transaction they describe
//! has committed. Publishing never fails a migration.

use quire_schema::VersionReference;
use quire_storage::{EdgeMigrationStatus, JobStatus, Reference};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Payload of `MIGRATION_START` and `MIGRATION_FINISHED`.
///
/// References are optional because a job may fail before they resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationEventModel {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub from_version: Option<VersionReference>,
    pub to_version: Option<VersionReference>,
    pub branch: Option<Reference>,
    pub project: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub warnings: usize,
}

/// Payload of `BRANCH_SCHEMA_ASSIGN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchAssignEventModel {
    pub project: Reference,
    pub branch: Reference,
    pub schema: VersionReference,
    pub status: EdgeMigrationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationEvent {
    MigrationStart(MigrationEventModel),
    MigrationFinished(MigrationEventModel),
    BranchSchemaAssign(BranchAssignEventModel),
}

impl MigrationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MigrationEvent::MigrationStart(_) => "MIGRATION_START",
            MigrationEvent::MigrationFinished(_) => "MIGRATION_FINISHED",
            MigrationEvent::BranchSchemaAssign(_) => "BRANCH_SCHEMA_ASSIGN",
        }
    }
}

/// Sink for migration events.
pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: MigrationEvent);
}

/// Event bus backed by a tokio broadcast channel. Events published while
/// nobody subscribes are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<MigrationEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: MigrationEvent) {
        tracing::debug!(event = event.name(), "publishing event");
        let _ = self.sender.send(event);
    }
}

use std::fmt;

use quire_schema::VersionReference;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

/// Current time as an RFC 3339 timestamp string.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Lightweight `{uuid, name}` reference carried by audit records and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: Uuid,
    pub name: String,
}

impl ProjectRecord {
    pub fn reference(&self) -> Reference {
        Reference {
            uuid: self.id,
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRecord {
    pub id: Uuid,
    pub name: String,
    pub project_id: Uuid,
}

impl BranchRecord {
    pub fn reference(&self) -> Reference {
        Reference {
            uuid: self.id,
            name: self.name.clone(),
        }
    }
}

/// A schema family: the stable identity that all versions of one schema share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaContainerRecord {
    pub id: Uuid,
    pub name: String,
    pub latest_version_id: Uuid,
}

/// Migration state of a branch → schema version edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeMigrationStatus {
    /// Created by a job that has not finished yet; the edge is mid-activation.
    Pending,
    Completed,
    Failed,
}

/// Join record binding a schema version to a branch.
///
/// At most one edge per (branch, schema family) is active. Inactive edges are
/// retained as history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchSchemaEdgeRecord {
    pub branch_id: Uuid,
    pub schema_id: Uuid,
    pub version_id: Uuid,
    pub active: bool,
    pub migration_status: EdgeMigrationStatus,
    pub job_id: Option<Uuid>,
}

impl BranchSchemaEdgeRecord {
    /// Edge is reserved by an unfinished job.
    pub fn is_pending(&self) -> bool {
        self.migration_status == EdgeMigrationStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Preparing,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    /// DONE and FAILED are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Preparing => "PREPARING",
            JobStatus::Running => "RUNNING",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationType {
    Schema,
}

/// Audit snapshot of why and where a migration ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationCause {
    pub job_id: Uuid,
    /// Name of the node that executed the job.
    pub origin: String,
    pub from_version: VersionReference,
    pub to_version: VersionReference,
    pub branch: Reference,
    pub project: Reference,
    pub started_at: String,
}

/// A per-node problem found during migration. Never fails the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictWarning {
    pub node_uuid: Uuid,
    pub language: String,
    pub field_name: String,
    pub reason: String,
}

impl fmt::Display for ConflictWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} field '{}': {}",
            self.node_uuid, self.language, self.field_name, self.reason
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationJobRecord {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub migration_type: MigrationType,
    pub branch_id: Uuid,
    pub schema_id: Uuid,
    pub from_version_id: Uuid,
    pub to_version_id: Uuid,
    pub status: JobStatus,
    #[serde(default)]
    pub warnings: Vec<ConflictWarning>,
    pub cause: Option<MigrationCause>,
    pub error: Option<String>,
    /// RFC 3339 timestamp string.
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl MigrationJobRecord {
    /// A fresh QUEUED schema migration job.
    pub fn queued(
        branch_id: Uuid,
        schema_id: Uuid,
        from_version_id: Uuid,
        to_version_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            migration_type: MigrationType::Schema,
            branch_id,
            schema_id,
            from_version_id,
            to_version_id,
            status: JobStatus::Queued,
            warnings: Vec::new(),
            cause: None,
            error: None,
            created_at: now_rfc3339(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// One immutable, versioned content container of a node in one language on
/// one branch. Containers are append-only; a head pointer per
/// (node, language, branch) names the current one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub id: Uuid,
    pub node_uuid: Uuid,
    pub language: String,
    pub branch_id: Uuid,
    pub schema_version_id: Uuid,
    #[serde(default)]
    pub fields: Map<String, Value>,
    pub previous_id: Option<Uuid>,
    /// Migration job that created this container, if any.
    pub job_id: Option<Uuid>,
    #[serde(default)]
    pub warnings: Vec<ConflictWarning>,
    pub created_at: String,
}

/// Key of a container head pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeadKey {
    pub node_uuid: Uuid,
    pub language: String,
    pub branch_id: Uuid,
}

impl HeadKey {
    pub fn new(node_uuid: Uuid, language: impl Into<String>, branch_id: Uuid) -> Self {
        Self {
            node_uuid,
            language: language.into(),
            branch_id,
        }
    }
}

impl ContainerRecord {
    pub fn head_key(&self) -> HeadKey {
        HeadKey::new(self.node_uuid, self.language.clone(), self.branch_id)
    }
}

/// Search index work that has not been delivered yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PendingIndexAction {
    /// Replace the document of the container's (node, language).
    Store {
        #[serde(rename = "containerId")]
        container_id: Uuid,
    },
    Delete {
        #[serde(rename = "nodeUuid")]
        node_uuid: Uuid,
        language: String,
    },
    ReindexAll {
        #[serde(rename = "branchId")]
        branch_id: Uuid,
    },
}

/// Queue entry for index work that failed after its in-request retries.
/// Removed once the index accepts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingIndexEntryRecord {
    pub id: Uuid,
    pub action: PendingIndexAction,
    /// Failed deliveries so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: String,
}

impl PendingIndexEntryRecord {
    pub fn new(action: PendingIndexAction, error: impl ToString) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            attempts: 1,
            last_error: Some(error.to_string()),
            created_at: now_rfc3339(),
        }
    }
}

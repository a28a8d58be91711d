//! Search index synchronization.
//!
//! The coordinator runs after a migration has committed. For every container
//! a job created it deletes the stale document of that (node, language) and
//! stores a fresh one under the new document type. Index failures are logged
//! and retried; they are never reported back into the job. Entries that
//! still fail are kept in the store's pending index queue and delivered by a
//! later sync, at startup, or by the retry loop.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use quire_schema::{ElementType, FieldType, SchemaVersion};
use quire_storage::{
    retry_with_backoff, with_store_retry, ContainerRecord, ContentStore, PendingIndexAction,
    PendingIndexEntryRecord, Reference, StorageError,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::IndexConfig;
use crate::error::IndexError;

// ──────────────────────────────────────────────
// DocumentIndex
// ──────────────────────────────────────────────

/// A document store addressed by index name, document type and id.
#[async_trait]
pub trait DocumentIndex: Send + Sync + 'static {
    /// Register the mapping of one document type.
    async fn put_mapping(&self, index: &str, doc_type: &str, mapping: Value)
        -> Result<(), IndexError>;

    /// Delete every document matching `query`. Returns the number deleted.
    async fn delete_by_query(&self, index: &str, query: Value) -> Result<u64, IndexError>;

    async fn store_document(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        document: Map<String, Value>,
    ) -> Result<(), IndexError>;

    async fn refresh_index(&self, index: &str) -> Result<(), IndexError>;
}

/// Action of a queued index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexAction {
    Store,
    Delete,
    ReindexAll,
}

impl IndexAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexAction::Store => "store",
            IndexAction::Delete => "delete",
            IndexAction::ReindexAll => "reindex_all",
        }
    }
}

/// One unit of index work.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexEntry {
    /// Replace the document of the container's (node, language).
    Store(ContainerRecord),
    Delete { node_uuid: Uuid, language: String },
    /// Store every head of every active schema version in a branch.
    ReindexAll { branch_id: Uuid },
}

impl IndexEntry {
    pub fn action(&self) -> IndexAction {
        match self {
            IndexEntry::Store(_) => IndexAction::Store,
            IndexEntry::Delete { .. } => IndexAction::Delete,
            IndexEntry::ReindexAll { .. } => IndexAction::ReindexAll,
        }
    }

    /// The form in which this entry is queued after a failed delivery.
    pub fn pending_action(&self) -> PendingIndexAction {
        match self {
            IndexEntry::Store(container) => PendingIndexAction::Store {
                container_id: container.id,
            },
            IndexEntry::Delete {
                node_uuid,
                language,
            } => PendingIndexAction::Delete {
                node_uuid: *node_uuid,
                language: language.clone(),
            },
            IndexEntry::ReindexAll { branch_id } => PendingIndexAction::ReindexAll {
                branch_id: *branch_id,
            },
        }
    }
}

/// Id of the index document of one (node, language).
pub fn document_id(node_uuid: Uuid, language: &str) -> String {
    format!("{}-{}", node_uuid, language)
}

/// Query matching every document of one (node, language).
pub fn node_query(node_uuid: Uuid, language: &str) -> Value {
    json!({
        "query": {
            "bool": {
                "must": [
                    { "term": { "uuid": node_uuid.to_string() } },
                    { "term": { "language": language } }
                ]
            }
        }
    })
}

/// Build the index document of a container.
pub fn node_document(
    container: &ContainerRecord,
    version: &SchemaVersion,
    branch: &Reference,
    project: &Reference,
) -> Map<String, Value> {
    let mut fields = Map::new();
    for field in &version.schema.fields {
        let Some(value) = container.fields.get(&field.name) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        fields.insert(field.name.clone(), index_value(field.field_type, value));
    }

    let mut doc = Map::new();
    doc.insert("uuid".into(), json!(container.node_uuid.to_string()));
    doc.insert("language".into(), json!(container.language));
    doc.insert("branch".into(), json!({"uuid": branch.uuid, "name": branch.name}));
    doc.insert("project".into(), json!({"uuid": project.uuid, "name": project.name}));
    doc.insert(
        "schema".into(),
        json!({"name": version.name(), "uuid": version.id, "version": version.version}),
    );
    if let Some(key) = &version.schema.display_field {
        if let Some(value) = fields.get(key) {
            doc.insert("displayField".into(), json!({"key": key, "value": value}));
        }
    }
    doc.insert("fields".into(), Value::Object(fields));
    doc
}

fn index_value(field_type: FieldType, value: &Value) -> Value {
    match (field_type, value) {
        // Boolean lists are indexed as strings.
        (FieldType::List(ElementType::Boolean), Value::Array(items)) => Value::Array(
            items
                .iter()
                .map(|v| match v {
                    Value::Bool(b) => json!(b.to_string()),
                    other => other.clone(),
                })
                .collect(),
        ),
        (FieldType::Micronode, v) => micronode_value(v),
        (FieldType::List(ElementType::Micronode), Value::Array(items)) => {
            Value::Array(items.iter().map(micronode_value).collect())
        }
        (_, v) => v.clone(),
    }
}

/// Micronodes are nested with their microschema name next to their fields.
fn micronode_value(value: &Value) -> Value {
    let microschema = value
        .get("microschema")
        .and_then(|m| m.get("name").or(Some(m)))
        .cloned()
        .unwrap_or(Value::Null);
    let fields = value.get("fields").cloned().unwrap_or_else(|| value.clone());
    json!({"microschema": microschema, "fields": fields})
}

/// Mapping of one document type. Micronode lists are `nested`.
pub fn node_index_mapping(version: &SchemaVersion) -> Value {
    let mut properties = Map::new();
    for field in &version.schema.fields {
        match field.field_type {
            FieldType::List(ElementType::Micronode) => {
                properties.insert(field.name.clone(), json!({"type": "nested"}));
            }
            FieldType::Micronode => {
                properties.insert(field.name.clone(), json!({"type": "object"}));
            }
            _ => {}
        }
    }
    let mut mapping = Map::new();
    mapping.insert(
        version.document_type(),
        json!({
            "properties": {
                "uuid": {"type": "keyword"},
                "language": {"type": "keyword"},
                "fields": {"properties": properties}
            }
        }),
    );
    Value::Object(mapping)
}

// ──────────────────────────────────────────────
// IndexSyncCoordinator
// ──────────────────────────────────────────────

/// Outcome counters of one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexSyncReport {
    pub stored: usize,
    pub deleted: u64,
    /// Entries that failed in this run.
    pub failed: usize,
    /// Failed entries handed to the pending queue.
    pub queued: usize,
}

pub struct IndexSyncCoordinator<S, I> {
    store: Arc<S>,
    index: Arc<I>,
    config: IndexConfig,
    /// Document types whose mapping has been pushed.
    mapped: Mutex<BTreeSet<String>>,
    /// Serializes drains of the pending queue.
    draining: Mutex<()>,
}

impl<S, I> IndexSyncCoordinator<S, I>
where
    S: ContentStore,
    I: DocumentIndex,
{
    pub fn new(store: Arc<S>, index: Arc<I>, config: IndexConfig) -> Self {
        Self {
            store,
            index,
            config,
            mapped: Mutex::new(BTreeSet::new()),
            draining: Mutex::new(()),
        }
    }

    pub fn index_name(&self) -> &str {
        &self.config.name
    }

    /// Re-index every container created by `job_id`. Older pending entries
    /// are delivered first.
    pub async fn sync_job(&self, job_id: Uuid) -> IndexSyncReport {
        self.drain_pending().await;
        match self.store.list_containers_by_job(job_id).await {
            Ok(containers) => {
                let entries = containers.into_iter().map(IndexEntry::Store).collect();
                let report = self.process(entries).await;
                tracing::info!(
                    job = %job_id,
                    stored = report.stored,
                    deleted = report.deleted,
                    failed = report.failed,
                    "search index synchronized"
                );
                report
            }
            Err(e) => {
                tracing::error!(
                    job = %job_id,
                    error = %e,
                    "could not list containers for index sync"
                );
                IndexSyncReport {
                    failed: 1,
                    ..IndexSyncReport::default()
                }
            }
        }
    }

    /// Re-index every head of every active schema version in `branch_id`.
    pub async fn reindex_branch(&self, branch_id: Uuid) -> IndexSyncReport {
        self.process(vec![IndexEntry::ReindexAll { branch_id }]).await
    }

    /// Run `entries` in order, then refresh the index. Entries that still
    /// fail after their retries go to the pending queue.
    pub async fn process(&self, entries: Vec<IndexEntry>) -> IndexSyncReport {
        let mut report = IndexSyncReport::default();
        let mut sources = SourceCache::default();
        for entry in entries {
            let pending = entry.pending_action();
            let action = entry.action();
            if let Err(e) = self.apply(entry, &mut sources, &mut report).await {
                report.failed += 1;
                tracing::error!(action = action.as_str(), error = %e, "index entry failed");
                if self.enqueue(pending, &e).await {
                    report.queued += 1;
                }
            }
        }
        self.refresh().await;
        report
    }

    /// Deliver the pending queue, oldest first. Delivered entries leave the
    /// queue; failing ones stay with their attempt count raised.
    pub async fn drain_pending(&self) -> IndexSyncReport {
        let _guard = self.draining.lock().await;
        let mut report = IndexSyncReport::default();
        let pending = match self.store.list_pending_index_entries().await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(error = %e, "could not read pending index entries");
                return report;
            }
        };
        if pending.is_empty() {
            return report;
        }

        let mut sources = SourceCache::default();
        for mut record in pending {
            let result = match self.resolve(&record.action).await {
                Ok(Some(entry)) => self.apply(entry, &mut sources, &mut report).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            let outcome = match result {
                Ok(()) => self.dequeue(record.id).await,
                Err(e) => {
                    report.failed += 1;
                    record.attempts += 1;
                    record.last_error = Some(e.to_string());
                    tracing::warn!(
                        entry = %record.id,
                        attempts = record.attempts,
                        error = %e,
                        "pending index entry failed again"
                    );
                    self.requeue(record).await
                }
            };
            if let Err(e) = outcome {
                tracing::error!(error = %e, "could not update pending index queue");
            }
        }
        self.refresh().await;
        tracing::info!(
            stored = report.stored,
            failed = report.failed,
            "pending index entries delivered"
        );
        report
    }

    /// Drain the pending queue every `pending_retry_interval_ms` until the
    /// returned task is aborted.
    pub fn spawn_retry_loop(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.pending_retry_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.drain_pending().await;
            }
        })
    }

    async fn apply(
        &self,
        entry: IndexEntry,
        sources: &mut SourceCache,
        report: &mut IndexSyncReport,
    ) -> Result<(), IndexError> {
        match entry {
            IndexEntry::Store(c) => self.store_container(&c, sources, report).await,
            IndexEntry::Delete {
                node_uuid,
                language,
            } => {
                report.deleted += self.delete(node_uuid, &language).await?;
                Ok(())
            }
            IndexEntry::ReindexAll { branch_id } => {
                self.reindex_heads(branch_id, sources, report).await
            }
        }
    }

    /// Turn a queued action back into an entry. A store entry indexes the
    /// current head of its (node, language, branch); `None` when that head is
    /// gone.
    async fn resolve(
        &self,
        action: &PendingIndexAction,
    ) -> Result<Option<IndexEntry>, IndexError> {
        match action {
            PendingIndexAction::Store { container_id } => {
                let container = match self.store.get_container(*container_id).await {
                    Ok(c) => c,
                    Err(StorageError::NotFound { .. }) => return Ok(None),
                    Err(e) => return Err(source_error(e)),
                };
                let head = self
                    .store
                    .get_container_head(&container.head_key())
                    .await
                    .map_err(source_error)?;
                Ok(head.map(IndexEntry::Store))
            }
            PendingIndexAction::Delete {
                node_uuid,
                language,
            } => Ok(Some(IndexEntry::Delete {
                node_uuid: *node_uuid,
                language: language.clone(),
            })),
            PendingIndexAction::ReindexAll { branch_id } => Ok(Some(IndexEntry::ReindexAll {
                branch_id: *branch_id,
            })),
        }
    }

    /// Persist a failed entry. Returns `false` when the store refused it and
    /// the entry is lost.
    async fn enqueue(&self, action: PendingIndexAction, error: &IndexError) -> bool {
        let record = PendingIndexEntryRecord::new(action, error);
        match self.requeue(record).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "could not queue failed index entry");
                false
            }
        }
    }

    async fn requeue(&self, record: PendingIndexEntryRecord) -> Result<(), StorageError> {
        let store = self.store.as_ref();
        let record = &record;
        with_store_retry(self.config.retry_limit, || async move {
            let mut snap = store.begin_snapshot().await?;
            if let Err(e) = store.put_pending_index_entry(&mut snap, record.clone()).await {
                let _ = store.abort_snapshot(snap).await;
                return Err(e);
            }
            store.commit_snapshot(snap).await
        })
        .await
    }

    async fn dequeue(&self, id: Uuid) -> Result<(), StorageError> {
        let store = self.store.as_ref();
        with_store_retry(self.config.retry_limit, || async move {
            let mut snap = store.begin_snapshot().await?;
            if let Err(e) = store.delete_pending_index_entry(&mut snap, id).await {
                let _ = store.abort_snapshot(snap).await;
                return Err(e);
            }
            store.commit_snapshot(snap).await
        })
        .await
    }

    async fn refresh(&self) {
        let name = self.config.name.as_str();
        if let Err(e) = self.retry(|| self.index.refresh_index(name)).await {
            tracing::warn!(index = name, error = %e, "index refresh failed");
        }
    }

    /// Delete the stale document of the container's (node, language), then
    /// store the new one.
    async fn store_container(
        &self,
        container: &ContainerRecord,
        sources: &mut SourceCache,
        report: &mut IndexSyncReport,
    ) -> Result<(), IndexError> {
        let (version, branch, project) = sources.load(self.store.as_ref(), container).await?;
        report.deleted += self.delete(container.node_uuid, &container.language).await?;
        self.ensure_mapping(&version).await?;
        let doc = node_document(container, &version, &branch, &project);
        let id = document_id(container.node_uuid, &container.language);
        let doc_type = version.document_type();
        let name = self.config.name.as_str();
        self.retry(|| self.index.store_document(name, &doc_type, &id, doc.clone()))
            .await?;
        tracing::debug!(id = %id, doc_type = %doc_type, "document stored");
        report.stored += 1;
        Ok(())
    }

    /// Nodes that fail are queued one by one so the rest of the branch is
    /// still indexed.
    async fn reindex_heads(
        &self,
        branch_id: Uuid,
        sources: &mut SourceCache,
        report: &mut IndexSyncReport,
    ) -> Result<(), IndexError> {
        let edges = self
            .store
            .list_branch_schema_edges(branch_id)
            .await
            .map_err(source_error)?;
        for edge in edges.into_iter().filter(|e| e.active) {
            let heads = self
                .store
                .list_container_heads(branch_id, edge.version_id)
                .await
                .map_err(source_error)?;
            for container in &heads {
                if let Err(e) = self.store_container(container, sources, report).await {
                    report.failed += 1;
                    tracing::error!(
                        branch = %branch_id,
                        node = %container.node_uuid,
                        error = %e,
                        "reindex of node failed"
                    );
                    let action = PendingIndexAction::Store {
                        container_id: container.id,
                    };
                    if self.enqueue(action, &e).await {
                        report.queued += 1;
                    }
                }
            }
        }
        tracing::info!(branch = %branch_id, stored = report.stored, "branch reindexed");
        Ok(())
    }

    async fn delete(&self, node_uuid: Uuid, language: &str) -> Result<u64, IndexError> {
        let name = self.config.name.as_str();
        self.retry(|| self.index.delete_by_query(name, node_query(node_uuid, language)))
            .await
    }

    async fn ensure_mapping(&self, version: &SchemaVersion) -> Result<(), IndexError> {
        let doc_type = version.document_type();
        let mut mapped = self.mapped.lock().await;
        if mapped.contains(&doc_type) {
            return Ok(());
        }
        let name = self.config.name.as_str();
        let mapping = node_index_mapping(version);
        self.retry(|| self.index.put_mapping(name, &doc_type, mapping.clone()))
            .await?;
        mapped.insert(doc_type);
        Ok(())
    }

    async fn retry<T, F, Fut>(&self, op: F) -> Result<T, IndexError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, IndexError>>,
    {
        retry_with_backoff(self.config.retry_policy(), op).await
    }
}

fn source_error(e: StorageError) -> IndexError {
    IndexError::Source(e.to_string())
}

/// Versions, branches and projects already loaded during one run.
#[derive(Default)]
struct SourceCache {
    versions: HashMap<Uuid, SchemaVersion>,
    branches: HashMap<Uuid, (Reference, Reference)>,
}

impl SourceCache {
    async fn load<S: ContentStore>(
        &mut self,
        store: &S,
        container: &ContainerRecord,
    ) -> Result<(SchemaVersion, Reference, Reference), IndexError> {
        let version = match self.versions.get(&container.schema_version_id) {
            Some(v) => v.clone(),
            None => {
                let v = store
                    .get_schema_version(container.schema_version_id)
                    .await
                    .map_err(source_error)?;
                self.versions.insert(v.id, v.clone());
                v
            }
        };
        let (branch, project) = match self.branches.get(&container.branch_id) {
            Some(refs) => refs.clone(),
            None => {
                let branch = store
                    .get_branch(container.branch_id)
                    .await
                    .map_err(source_error)?;
                let project = store
                    .get_project(branch.project_id)
                    .await
                    .map_err(source_error)?;
                let refs = (branch.reference(), project.reference());
                self.branches.insert(container.branch_id, refs.clone());
                refs
            }
        };
        Ok((version, branch, project))
    }
}

// ──────────────────────────────────────────────
// MemoryIndex
// ──────────────────────────────────────────────

/// A request received by [`MemoryIndex`], in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOp {
    PutMapping { index: String, doc_type: String },
    DeleteByQuery { index: String, query: Value },
    Store { index: String, doc_type: String, id: String },
    Refresh { index: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub doc_type: String,
    pub document: Map<String, Value>,
}

#[derive(Default)]
struct IndexState {
    documents: BTreeMap<(String, String), StoredDocument>,
    mappings: BTreeMap<(String, String), Value>,
    ops: Vec<IndexOp>,
}

/// In-memory document index for tests and the CLI.
///
/// Queries support `term` clauses, alone or under `bool.must`; a document
/// matches when every term equals the document's top-level value.
#[derive(Default)]
pub struct MemoryIndex {
    state: Mutex<IndexState>,
    failing: AtomicUsize,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` requests fail with `IndexError::Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.failing.store(n, Ordering::SeqCst);
    }

    pub async fn ops(&self) -> Vec<IndexOp> {
        self.state.lock().await.ops.clone()
    }

    pub async fn document(&self, index: &str, id: &str) -> Option<StoredDocument> {
        self.state
            .lock()
            .await
            .documents
            .get(&(index.to_string(), id.to_string()))
            .cloned()
    }

    pub async fn document_count(&self, index: &str) -> usize {
        self.state
            .lock()
            .await
            .documents
            .keys()
            .filter(|(i, _)| i == index)
            .count()
    }

    pub async fn mapping(&self, index: &str, doc_type: &str) -> Option<Value> {
        self.state
            .lock()
            .await
            .mappings
            .get(&(index.to_string(), doc_type.to_string()))
            .cloned()
    }

    fn check_available(&self) -> Result<(), IndexError> {
        let taken = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(IndexError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

fn term_clauses(query: &Value) -> Vec<(&str, &Value)> {
    let root = query.get("query").unwrap_or(query);
    let clauses: Vec<&Value> = match root.pointer("/bool/must") {
        Some(Value::Array(items)) => items.iter().collect(),
        _ => vec![root],
    };
    clauses
        .into_iter()
        .filter_map(|c| c.get("term").and_then(Value::as_object))
        .flat_map(|term| term.iter().map(|(k, v)| (k.as_str(), v)))
        .collect()
}

#[async_trait]
impl DocumentIndex for MemoryIndex {
    async fn put_mapping(
        &self,
        index: &str,
        doc_type: &str,
        mapping: Value,
    ) -> Result<(), IndexError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.ops.push(IndexOp::PutMapping {
            index: index.to_string(),
            doc_type: doc_type.to_string(),
        });
        state
            .mappings
            .insert((index.to_string(), doc_type.to_string()), mapping);
        Ok(())
    }

    async fn delete_by_query(&self, index: &str, query: Value) -> Result<u64, IndexError> {
        self.check_available()?;
        let terms: Vec<(String, Value)> = term_clauses(&query)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        if terms.is_empty() {
            return Err(IndexError::Rejected {
                id: index.to_string(),
                reason: "query has no term clause".to_string(),
            });
        }
        let mut state = self.state.lock().await;
        state.ops.push(IndexOp::DeleteByQuery {
            index: index.to_string(),
            query,
        });
        let before = state.documents.len();
        state.documents.retain(|(i, _), stored| {
            i != index
                || !terms
                    .iter()
                    .all(|(k, v)| stored.document.get(k) == Some(v))
        });
        Ok((before - state.documents.len()) as u64)
    }

    async fn store_document(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        document: Map<String, Value>,
    ) -> Result<(), IndexError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.ops.push(IndexOp::Store {
            index: index.to_string(),
            doc_type: doc_type.to_string(),
            id: id.to_string(),
        });
        state.documents.insert(
            (index.to_string(), id.to_string()),
            StoredDocument {
                doc_type: doc_type.to_string(),
                document,
            },
        );
        Ok(())
    }

    async fn refresh_index(&self, index: &str) -> Result<(), IndexError> {
        self.check_available()?;
        self.state.lock().await.ops.push(IndexOp::Refresh {
            index: index.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_schema::{FieldSchema, Schema};
    use quire_storage::now_rfc3339;

    fn version() -> SchemaVersion {
        let schema = Schema::new("article")
            .with_field(FieldSchema::new("title", FieldType::String))
            .with_field(FieldSchema::new("flags", FieldType::List(ElementType::Boolean)))
            .with_field(FieldSchema::new(
                "blocks",
                FieldType::List(ElementType::Micronode),
            ))
            .with_display_field("title");
        SchemaVersion::initial(Uuid::new_v4(), schema).unwrap()
    }

    fn refs() -> (Reference, Reference) {
        (
            Reference {
                uuid: Uuid::new_v4(),
                name: "main".to_string(),
            },
            Reference {
                uuid: Uuid::new_v4(),
                name: "demo".to_string(),
            },
        )
    }

    fn container(version: &SchemaVersion, fields: Value) -> ContainerRecord {
        ContainerRecord {
            id: Uuid::new_v4(),
            node_uuid: Uuid::new_v4(),
            language: "en".to_string(),
            branch_id: Uuid::new_v4(),
            schema_version_id: version.id,
            fields: fields.as_object().cloned().unwrap_or_default(),
            previous_id: None,
            job_id: None,
            warnings: Vec::new(),
            created_at: now_rfc3339(),
        }
    }

    #[test]
    fn document_shape() {
        let v = version();
        let (branch, project) = refs();
        let c = container(
            &v,
            json!({
                "title": "Hello",
                "flags": [true, false],
                "blocks": [{"microschema": {"name": "quote"}, "fields": {"text": "hi"}}]
            }),
        );
        let doc = node_document(&c, &v, &branch, &project);
        assert_eq!(doc["uuid"], json!(c.node_uuid.to_string()));
        assert_eq!(doc["language"], "en");
        assert_eq!(doc["schema"]["name"], "article");
        assert_eq!(doc["schema"]["version"], 1);
        assert_eq!(doc["displayField"], json!({"key": "title", "value": "Hello"}));
        assert_eq!(doc["fields"]["flags"], json!(["true", "false"]));
        assert_eq!(
            doc["fields"]["blocks"],
            json!([{"microschema": "quote", "fields": {"text": "hi"}}])
        );
        assert_eq!(doc["project"]["name"], "demo");
    }

    #[test]
    fn micronode_lists_are_nested_in_mapping() {
        let v = version();
        let mapping = node_index_mapping(&v);
        assert_eq!(
            mapping["article-1"]["properties"]["fields"]["properties"]["blocks"]["type"],
            "nested"
        );
        assert!(mapping["article-1"]["properties"]["fields"]["properties"]
            .get("title")
            .is_none());
    }

    #[test]
    fn actions_serialize_in_snake_case() {
        assert_eq!(
            serde_json::to_value(IndexAction::ReindexAll).unwrap(),
            json!("reindex_all")
        );
        assert_eq!(IndexAction::Store.as_str(), "store");
    }

    #[tokio::test]
    async fn memory_index_deletes_by_term_query() {
        let index = MemoryIndex::new();
        let node = Uuid::new_v4();
        for lang in ["en", "de"] {
            let mut doc = Map::new();
            doc.insert("uuid".into(), json!(node.to_string()));
            doc.insert("language".into(), json!(lang));
            index
                .store_document("node", "article-1", &document_id(node, lang), doc)
                .await
                .unwrap();
        }
        let deleted = index
            .delete_by_query("node", node_query(node, "en"))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(index.document_count("node").await, 1);
        assert!(index.document("node", &document_id(node, "de")).await.is_some());
    }

    #[tokio::test]
    async fn injected_failures_are_unavailable() {
        let index = MemoryIndex::new();
        index.fail_next(1);
        assert!(matches!(
            index.refresh_index("node").await,
            Err(IndexError::Unavailable(_))
        ));
        index.refresh_index("node").await.unwrap();
    }
}

//! Schema versions and the per-schema version chain.
//!
//! Every schema family owns a singly linked history of immutable versions,
//! numbered from 1. Versions are addressed by deterministic ids so that
//! cutting the same version twice yields the same identifier.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::change::SchemaChange;
use crate::error::SchemaValidationError;
use crate::model::Schema;

/// Deterministic id of version `number` of the schema family `schema_id`.
pub fn version_id(schema_id: &Uuid, number: u32) -> Uuid {
    Uuid::new_v5(schema_id, format!("version-{}", number).as_bytes())
}

/// One immutable snapshot in a schema's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersion {
    pub id: Uuid,
    pub schema_id: Uuid,
    pub version: u32,
    pub schema: Schema,
    /// Changes that turn the previous version into this one.
    #[serde(default)]
    pub changes: Vec<SchemaChange>,
    pub previous: Option<Uuid>,
    /// Back-reference for lookup only; ownership runs through `previous`.
    pub next: Option<Uuid>,
}

impl SchemaVersion {
    /// Version 1 of a new schema family.
    pub fn initial(schema_id: Uuid, schema: Schema) -> Result<Self, SchemaValidationError> {
        schema.validate()?;
        Ok(Self {
            id: version_id(&schema_id, 1),
            schema_id,
            version: 1,
            schema,
            changes: Vec::new(),
            previous: None,
            next: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Search index document type for nodes stored under this version.
    pub fn document_type(&self) -> String {
        format!("{}-{}", self.schema.name, self.version)
    }

    pub fn reference(&self) -> VersionReference {
        VersionReference {
            uuid: self.id,
            name: self.schema.name.clone(),
            version: self.version,
        }
    }
}

/// Lightweight reference to a schema version, as carried by events and
/// audit records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReference {
    pub uuid: Uuid,
    pub name: String,
    pub version: u32,
}

/// The version history of one schema family, held as an arena indexed by
/// `version - 1`.
#[derive(Debug, Clone)]
pub struct VersionChain {
    schema_id: Uuid,
    versions: Vec<SchemaVersion>,
}

impl VersionChain {
    pub fn new(initial: SchemaVersion) -> Self {
        Self {
            schema_id: initial.schema_id,
            versions: vec![initial],
        }
    }

    /// Rebuild a chain from stored versions in any order.
    pub fn from_versions(mut versions: Vec<SchemaVersion>) -> Result<Self, SchemaValidationError> {
        versions.sort_by_key(|v| v.version);
        let mut iter = versions.into_iter();
        let first = iter.next().ok_or(SchemaValidationError::BrokenChain {
            expected_after: 0,
            found: 0,
        })?;
        if first.version != 1 {
            return Err(SchemaValidationError::BrokenChain {
                expected_after: 0,
                found: first.version,
            });
        }
        let mut chain = VersionChain::new(first);
        for v in iter {
            chain.push(v)?;
        }
        Ok(chain)
    }

    pub fn schema_id(&self) -> Uuid {
        self.schema_id
    }

    pub fn latest(&self) -> &SchemaVersion {
        // The arena is never empty: `new` seeds it with the initial version.
        &self.versions[self.versions.len() - 1]
    }

    pub fn get(&self, number: u32) -> Option<&SchemaVersion> {
        let index = usize::try_from(number).ok()?.checked_sub(1)?;
        self.versions.get(index)
    }

    pub fn by_id(&self, id: Uuid) -> Option<&SchemaVersion> {
        self.versions.iter().find(|v| v.id == id)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaVersion> {
        self.versions.iter()
    }

    /// Append the successor of the latest version, linking both directions.
    pub fn push(&mut self, mut version: SchemaVersion) -> Result<(), SchemaValidationError> {
        let latest = self.latest();
        if version.version != latest.version + 1 || version.schema_id != self.schema_id {
            return Err(SchemaValidationError::BrokenChain {
                expected_after: latest.version,
                found: version.version,
            });
        }
        version.previous = Some(latest.id);
        let id = version.id;
        let last = self.versions.len() - 1;
        self.versions[last].next = Some(id);
        self.versions.push(version);
        Ok(())
    }

    /// All changes needed to go from `from` to `to`, concatenated in order.
    ///
    /// Returns `None` when `to` is not a successor of `from`.
    pub fn changes_between(&self, from: Uuid, to: Uuid) -> Option<Vec<SchemaChange>> {
        let start = self.by_id(from)?.version;
        let end = self.by_id(to)?.version;
        if end < start {
            return None;
        }
        Some(
            self.versions[start as usize..end as usize]
                .iter()
                .flat_map(|v| v.changes.iter().cloned())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldSchema, FieldType};

    fn article() -> Schema {
        Schema::new("article").with_field(FieldSchema::new("title", FieldType::String).required())
    }

    fn successor(prev: &SchemaVersion, changes: Vec<SchemaChange>) -> SchemaVersion {
        SchemaVersion {
            id: version_id(&prev.schema_id, prev.version + 1),
            schema_id: prev.schema_id,
            version: prev.version + 1,
            schema: prev.schema.clone(),
            changes,
            previous: None,
            next: None,
        }
    }

    #[test]
    fn version_ids_are_deterministic() {
        let schema_id = Uuid::new_v4();
        assert_eq!(version_id(&schema_id, 3), version_id(&schema_id, 3));
        assert_ne!(version_id(&schema_id, 3), version_id(&schema_id, 4));
    }

    #[test]
    fn push_links_previous_and_next() {
        let v1 = SchemaVersion::initial(Uuid::new_v4(), article()).unwrap();
        let v2 = successor(&v1, vec![]);
        let mut chain = VersionChain::new(v1.clone());
        chain.push(v2.clone()).unwrap();

        assert_eq!(chain.get(1).unwrap().next, Some(v2.id));
        assert_eq!(chain.latest().previous, Some(v1.id));
        assert_eq!(chain.latest().version, 2);
        assert!(chain.get(0).is_none());
        assert!(chain.get(3).is_none());
    }

    #[test]
    fn push_rejects_gaps() {
        let v1 = SchemaVersion::initial(Uuid::new_v4(), article()).unwrap();
        let mut v3 = successor(&v1, vec![]);
        v3.version = 3;
        let mut chain = VersionChain::new(v1);
        assert!(matches!(
            chain.push(v3),
            Err(SchemaValidationError::BrokenChain {
                expected_after: 1,
                found: 3
            })
        ));
    }

    #[test]
    fn changes_between_concatenates_hops() {
        let v1 = SchemaVersion::initial(Uuid::new_v4(), article()).unwrap();
        let add = SchemaChange::AddField {
            field: FieldSchema::new("body", FieldType::Html),
        };
        let remove = SchemaChange::RemoveField {
            name: "body".to_string(),
        };
        let v2 = successor(&v1, vec![add.clone()]);
        let v3 = successor(&v2, vec![remove.clone()]);
        let chain = VersionChain::from_versions(vec![v3.clone(), v1.clone(), v2.clone()]).unwrap();

        assert_eq!(
            chain.changes_between(v1.id, v3.id),
            Some(vec![add.clone(), remove])
        );
        assert_eq!(chain.changes_between(v1.id, v2.id), Some(vec![add]));
        assert_eq!(chain.changes_between(v2.id, v2.id), Some(vec![]));
        assert_eq!(chain.changes_between(v3.id, v1.id), None);
    }

    #[test]
    fn document_type_joins_name_and_number() {
        let v1 = SchemaVersion::initial(Uuid::new_v4(), article()).unwrap();
        assert_eq!(v1.document_type(), "article-1");
    }
}

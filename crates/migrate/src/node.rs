//! Per-node content migration.
//!
//! A [`NodeMigrator`] turns one container bound to the source version into a
//! new container bound to the target version, following the transform rules
//! derived for the job. The source container is never touched. Values that
//! cannot survive the step are reported as [`ConflictWarning`]s; they never
//! fail the node.

use quire_schema::{FieldType, SchemaVersion, TransformRule, TransformRules};
use quire_storage::{now_rfc3339, ConflictWarning, ContainerRecord};
use serde_json::{Map, Number, Value};
use uuid::Uuid;

/// Id of the container a job creates from `source_id`.
///
/// Deterministic, so re-running a job after a crash cannot append a second
/// successor for the same source container.
pub fn migrated_container_id(job_id: Uuid, source_id: Uuid) -> Uuid {
    Uuid::new_v5(&job_id, source_id.as_bytes())
}

/// Result of migrating one container.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeMigration {
    pub container: ContainerRecord,
    pub warnings: Vec<ConflictWarning>,
}

pub struct NodeMigrator<'a> {
    target: &'a SchemaVersion,
    rules: &'a TransformRules,
    job_id: Uuid,
}

impl<'a> NodeMigrator<'a> {
    pub fn new(target: &'a SchemaVersion, rules: &'a TransformRules, job_id: Uuid) -> Self {
        Self {
            target,
            rules,
            job_id,
        }
    }

    pub fn migrate(&self, source: &ContainerRecord) -> NodeMigration {
        let mut fields = Map::new();
        let mut warnings = Vec::new();
        let warn = |warnings: &mut Vec<ConflictWarning>, field: &str, reason: String| {
            warnings.push(ConflictWarning {
                node_uuid: source.node_uuid,
                language: source.language.clone(),
                field_name: field.to_string(),
                reason,
            });
        };

        for field in &self.target.schema.fields {
            let name = field.name.as_str();
            let rule = self
                .rules
                .rule_for(name)
                .unwrap_or(&TransformRule::InitDefault);
            let value = match rule {
                TransformRule::Copy { source: from } => source
                    .fields
                    .get(from)
                    .filter(|v| !v.is_null())
                    .cloned(),
                TransformRule::InitDefault => {
                    field.field_type.is_list().then(|| Value::Array(Vec::new()))
                }
                TransformRule::Retype {
                    source: from,
                    from: from_type,
                    to: to_type,
                } => match source.fields.get(from) {
                    None => None,
                    Some(old) => match convert(old, *from_type, *to_type) {
                        Converted::Value(v) => Some(v),
                        Converted::Empty => None,
                        Converted::Impossible => {
                            let reason =
                                format!("value cannot be converted from {from_type} to {to_type}");
                            warn(&mut warnings, name, reason);
                            None
                        }
                    },
                },
                TransformRule::Drop => None,
            };

            if field.required && !value.as_ref().is_some_and(has_data) {
                warn(&mut warnings, name, "required field has no value".to_string());
            }
            if let Some(value) = value {
                fields.insert(name.to_string(), value);
            }
        }

        for (name, definition) in &self.rules.dropped {
            if source.fields.get(name).is_some_and(has_data) {
                let reason = if definition.required {
                    "required field removed with data loss"
                } else {
                    "field removed with data loss"
                };
                warn(&mut warnings, name, reason.to_string());
            }
        }

        let container = ContainerRecord {
            id: migrated_container_id(self.job_id, source.id),
            node_uuid: source.node_uuid,
            language: source.language.clone(),
            branch_id: source.branch_id,
            schema_version_id: self.target.id,
            fields,
            previous_id: Some(source.id),
            job_id: Some(self.job_id),
            warnings: warnings.clone(),
            created_at: now_rfc3339(),
        };
        NodeMigration {
            container,
            warnings,
        }
    }
}

/// Null and empty lists carry no data.
fn has_data(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

enum Converted {
    Value(Value),
    Empty,
    Impossible,
}

fn convert(value: &Value, from: FieldType, to: FieldType) -> Converted {
    if value.is_null() {
        return Converted::Empty;
    }
    match (from.element(), to.element()) {
        (Some(from_elem), Some(to_elem)) => {
            let Value::Array(items) = value else {
                return Converted::Impossible;
            };
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match convert(item, from_elem.as_field_type(), to_elem.as_field_type()) {
                    Converted::Value(v) => out.push(v),
                    Converted::Empty => {}
                    Converted::Impossible => return Converted::Impossible,
                }
            }
            Converted::Value(Value::Array(out))
        }
        (None, Some(to_elem)) => match convert_scalar(value, from, to_elem.as_field_type()) {
            Some(v) => Converted::Value(Value::Array(vec![v])),
            None => Converted::Impossible,
        },
        (Some(from_elem), None) => match value {
            Value::Array(items) if items.is_empty() => Converted::Empty,
            Value::Array(items) if items.len() == 1 => {
                convert(&items[0], from_elem.as_field_type(), to)
            }
            _ => Converted::Impossible,
        },
        (None, None) => match convert_scalar(value, from, to) {
            Some(v) => Converted::Value(v),
            None => Converted::Impossible,
        },
    }
}

fn convert_scalar(value: &Value, from: FieldType, to: FieldType) -> Option<Value> {
    use FieldType::*;

    if from == to {
        return Some(value.clone());
    }
    match (from, to, value) {
        (String | Html | Date, String | Html, Value::String(_)) => Some(value.clone()),
        (String | Html, Number, Value::String(s)) => parse_number(s.trim()),
        (Number, String | Html, Value::Number(n)) => Some(Value::String(n.to_string())),
        (String, Boolean, Value::String(s)) => match s.trim() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        (Boolean, String, Value::Bool(b)) => Some(Value::String(b.to_string())),
        _ => None,
    }
}

/// Only text that prints back unchanged is a number; anything else would
/// lose or invent digits.
fn parse_number(s: &str) -> Option<Value> {
    let number = match s.parse::<i64>() {
        Ok(i) => Number::from(i),
        Err(_) => s.parse::<f64>().ok().and_then(Number::from_f64)?,
    };
    (number.to_string() == s).then_some(Value::Number(number))
}

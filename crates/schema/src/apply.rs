//! Change application: builds the next schema version from a change list and
//! derives the per-field transform rules that node migration consumes.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::change::{SchemaAttributes, SchemaChange};
use crate::error::SchemaValidationError;
use crate::model::{FieldSchema, FieldType, Schema};
use crate::version::{version_id, SchemaVersion};

/// How the value of one target field is produced from a source container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformRule {
    /// Same type: take the value of `source` unchanged.
    Copy { source: String },
    /// Source field whose value does not survive.
    Drop,
    /// New field without a prior value.
    InitDefault,
    /// Type changed: convert the value of `source` from `from` to `to`.
    Retype {
        source: String,
        from: FieldType,
        to: FieldType,
    },
}

/// Transform rules for one source → target step.
///
/// `fields` is keyed by target field name; `dropped` holds the source fields
/// whose values do not survive, with their source definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformRules {
    pub fields: BTreeMap<String, TransformRule>,
    pub dropped: BTreeMap<String, FieldSchema>,
}

impl TransformRules {
    pub fn rule_for(&self, target_field: &str) -> Option<&TransformRule> {
        self.fields.get(target_field)
    }

    pub fn is_dropped(&self, source_field: &str) -> bool {
        self.dropped.contains_key(source_field)
    }

    /// Every rule: target fields first, then one `Drop` per dropped source
    /// field. A field that was removed and re-added appears twice.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TransformRule)> {
        const DROP: &TransformRule = &TransformRule::Drop;
        self.fields
            .iter()
            .map(|(name, rule)| (name.as_str(), rule))
            .chain(self.dropped.keys().map(|name| (name.as_str(), DROP)))
    }

    /// True when every target field is a same-named copy and nothing is dropped.
    pub fn is_identity(&self) -> bool {
        self.dropped.is_empty()
            && self.fields.iter().all(|(name, rule)| match rule {
                TransformRule::Copy { source } => source == name,
                _ => false,
            })
    }
}

/// The outcome of applying a change list to a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChanges {
    pub schema: Schema,
    pub rules: TransformRules,
}

#[derive(Debug, Clone)]
struct Origin {
    source: String,
    source_type: FieldType,
}

#[derive(Debug, Clone)]
struct WorkingField {
    field: FieldSchema,
    origin: Option<Origin>,
}

/// Whether a rename whose source is gone but whose target exists is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Apply,
    Replay,
}

/// Apply `changes` in order to a copy of `schema`.
///
/// The result is validated as a whole; on any error nothing is produced.
/// Adding an identical field again or removing an absent field are no-ops.
/// Renaming a field that does not exist is an error.
pub fn apply_changes(
    schema: &Schema,
    changes: &[SchemaChange],
) -> Result<AppliedChanges, SchemaValidationError> {
    apply_in(schema, changes, Mode::Apply)
}

/// Apply change lists recorded on a version chain.
///
/// Like [`apply_changes`], except that a rename already reflected in `schema`
/// (source missing, target present) is skipped, so a list can run again over
/// its own result.
pub fn replay_changes(
    schema: &Schema,
    changes: &[SchemaChange],
) -> Result<AppliedChanges, SchemaValidationError> {
    apply_in(schema, changes, Mode::Replay)
}

fn apply_in(
    schema: &Schema,
    changes: &[SchemaChange],
    mode: Mode,
) -> Result<AppliedChanges, SchemaValidationError> {
    let mut working: Vec<WorkingField> = schema
        .fields
        .iter()
        .map(|f| WorkingField {
            field: f.clone(),
            origin: Some(Origin {
                source: f.name.clone(),
                source_type: f.field_type,
            }),
        })
        .collect();
    let mut target = schema.clone();

    for change in changes {
        match change {
            SchemaChange::AddField { field } => {
                if field.name.trim().is_empty() {
                    return Err(SchemaValidationError::InvalidField {
                        field: field.name.clone(),
                        reason: "field name must not be empty".to_string(),
                    });
                }
                match working.iter().find(|w| w.field.name == field.name) {
                    Some(existing) if existing.field == *field => {}
                    Some(_) => {
                        return Err(SchemaValidationError::DuplicateField(field.name.clone()));
                    }
                    None => working.push(WorkingField {
                        field: field.clone(),
                        origin: None,
                    }),
                }
            }
            SchemaChange::RemoveField { name } => {
                working.retain(|w| w.field.name != *name);
            }
            SchemaChange::UpdateField {
                name,
                new_type,
                new_required,
            } => {
                let w = working
                    .iter_mut()
                    .find(|w| w.field.name == *name)
                    .ok_or_else(|| SchemaValidationError::UnknownField(name.clone()))?;
                if let Some(t) = new_type {
                    w.field.field_type = *t;
                }
                if let Some(r) = new_required {
                    w.field.required = *r;
                }
            }
            SchemaChange::RenameField { from, to } => {
                rename_field(&mut working, &mut target, from, to, mode)?;
            }
            SchemaChange::UpdateSchema(attrs) => {
                update_attributes(&mut working, &mut target, attrs)?;
            }
        }
    }

    target.fields = working.iter().map(|w| w.field.clone()).collect();
    target.validate()?;

    let rules = derive_rules(schema, &working);
    Ok(AppliedChanges {
        schema: target,
        rules,
    })
}

/// Apply `changes` to `version`, cutting its successor.
pub fn apply_to_version(
    version: &SchemaVersion,
    changes: &[SchemaChange],
) -> Result<(SchemaVersion, TransformRules), SchemaValidationError> {
    let applied = apply_changes(&version.schema, changes)?;
    let number = version.version + 1;
    let next = SchemaVersion {
        id: version_id(&version.schema_id, number),
        schema_id: version.schema_id,
        version: number,
        schema: applied.schema,
        changes: changes.to_vec(),
        previous: Some(version.id),
        next: None,
    };
    Ok((next, applied.rules))
}

fn rename_field(
    working: &mut [WorkingField],
    target: &mut Schema,
    from: &str,
    to: &str,
    mode: Mode,
) -> Result<(), SchemaValidationError> {
    if from == to {
        return Ok(());
    }
    let has_to = working.iter().any(|w| w.field.name == to);
    let Some(w) = working.iter_mut().find(|w| w.field.name == from) else {
        // A replayed list may already have renamed it.
        return if has_to && mode == Mode::Replay {
            Ok(())
        } else {
            Err(SchemaValidationError::UnknownField(from.to_string()))
        };
    };
    if has_to {
        return Err(SchemaValidationError::DuplicateField(to.to_string()));
    }
    w.field.name = to.to_string();
    for attr in [&mut target.display_field, &mut target.segment_field] {
        if attr.as_deref() == Some(from) {
            *attr = Some(to.to_string());
        }
    }
    Ok(())
}

fn update_attributes(
    working: &mut Vec<WorkingField>,
    target: &mut Schema,
    attrs: &SchemaAttributes,
) -> Result<(), SchemaValidationError> {
    if let Some(v) = &attrs.display_field {
        target.display_field = v.clone();
    }
    if let Some(v) = &attrs.segment_field {
        target.segment_field = v.clone();
    }
    if let Some(v) = attrs.container {
        target.container = v;
    }
    if let Some(v) = &attrs.description {
        target.description = v.clone();
    }
    if let Some(order) = &attrs.field_order {
        let current: BTreeSet<&str> = working.iter().map(|w| w.field.name.as_str()).collect();
        let requested: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        if order.len() != working.len() || current != requested {
            return Err(SchemaValidationError::InvalidFieldOrder(format!(
                "expected a permutation of [{}], got [{}]",
                current.into_iter().collect::<Vec<_>>().join(", "),
                order.join(", ")
            )));
        }
        let mut reordered = Vec::with_capacity(working.len());
        for name in order {
            if let Some(pos) = working.iter().position(|w| w.field.name == *name) {
                reordered.push(working.remove(pos));
            }
        }
        *working = reordered;
    }
    Ok(())
}

fn derive_rules(source: &Schema, working: &[WorkingField]) -> TransformRules {
    let mut rules = TransformRules::default();
    let mut consumed = BTreeSet::new();

    for w in working {
        let rule = match &w.origin {
            None => TransformRule::InitDefault,
            Some(origin) => {
                consumed.insert(origin.source.as_str());
                if origin.source_type == w.field.field_type {
                    TransformRule::Copy {
                        source: origin.source.clone(),
                    }
                } else {
                    TransformRule::Retype {
                        source: origin.source.clone(),
                        from: origin.source_type,
                        to: w.field.field_type,
                    }
                }
            }
        };
        rules.fields.insert(w.field.name.clone(), rule);
    }

    for field in &source.fields {
        if !consumed.contains(field.name.as_str()) {
            rules.dropped.insert(field.name.clone(), field.clone());
        }
    }

    rules
}

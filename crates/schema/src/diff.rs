use std::collections::{BTreeMap, BTreeSet};

use crate::change::{SchemaAttributes, SchemaChange};
use crate::model::{FieldSchema, Schema};

/// Compute the ordered change list that turns `old` into `new`.
///
/// Fields are identified by name only. A field that disappears while a
/// differently named one appears is reported as `REMOVE_FIELD` + `ADD_FIELD`;
/// renames are never inferred.
///
/// Output order: additions and updates in `new`'s field order, then removals
/// in `old`'s field order, then at most one trailing `UPDATE_SCHEMA`. An
/// empty list means no migration is required.
pub fn diff_schemas(old: &Schema, new: &Schema) -> Vec<SchemaChange> {
    let old_index: BTreeMap<&str, &FieldSchema> =
        old.fields.iter().map(|f| (f.name.as_str(), f)).collect();
    let new_names: BTreeSet<&str> = new.fields.iter().map(|f| f.name.as_str()).collect();

    let mut changes = Vec::new();

    for field in &new.fields {
        match old_index.get(field.name.as_str()) {
            None => changes.push(SchemaChange::AddField {
                field: field.clone(),
            }),
            Some(before) => {
                let new_type = (before.field_type != field.field_type).then_some(field.field_type);
                let new_required = (before.required != field.required).then_some(field.required);
                if new_type.is_some() || new_required.is_some() {
                    changes.push(SchemaChange::UpdateField {
                        name: field.name.clone(),
                        new_type,
                        new_required,
                    });
                }
            }
        }
    }

    for field in &old.fields {
        if !new_names.contains(field.name.as_str()) {
            changes.push(SchemaChange::RemoveField {
                name: field.name.clone(),
            });
        }
    }

    let attributes = diff_attributes(old, new, &new_names);
    if !attributes.is_empty() {
        changes.push(SchemaChange::UpdateSchema(attributes));
    }

    changes
}

fn diff_attributes(old: &Schema, new: &Schema, new_names: &BTreeSet<&str>) -> SchemaAttributes {
    let mut attrs = SchemaAttributes::default();
    if old.display_field != new.display_field {
        attrs.display_field = Some(new.display_field.clone());
    }
    if old.segment_field != new.segment_field {
        attrs.segment_field = Some(new.segment_field.clone());
    }
    if old.container != new.container {
        attrs.container = Some(new.container);
    }
    if old.description != new.description {
        attrs.description = Some(new.description.clone());
    }

    // Applying the field changes keeps surviving fields in their old order and
    // appends additions; only emit an explicit order when that differs.
    let old_names: BTreeSet<&str> = old.fields.iter().map(|f| f.name.as_str()).collect();
    let implied: Vec<&str> = old
        .fields
        .iter()
        .map(|f| f.name.as_str())
        .filter(|n| new_names.contains(n))
        .chain(
            new.fields
                .iter()
                .map(|f| f.name.as_str())
                .filter(|n| !old_names.contains(n)),
        )
        .collect();
    let target = new.field_names();
    if implied != target {
        attrs.field_order = Some(target.into_iter().map(str::to_string).collect());
    }

    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ElementType, FieldType};

    fn article() -> Schema {
        Schema::new("article")
            .with_field(FieldSchema::new("title", FieldType::String).required())
            .with_field(FieldSchema::new("body", FieldType::Html))
            .with_display_field("title")
    }

    #[test]
    fn identical_schemas_produce_empty_diff() {
        assert!(diff_schemas(&article(), &article()).is_empty());
        let empty = Schema::new("empty");
        assert!(diff_schemas(&empty, &empty).is_empty());
    }

    #[test]
    fn added_list_field() {
        let new = article().with_field(FieldSchema::new(
            "tags",
            FieldType::List(ElementType::String),
        ));
        let diff = diff_schemas(&article(), &new);
        assert_eq!(
            diff,
            vec![SchemaChange::AddField {
                field: FieldSchema::new("tags", FieldType::List(ElementType::String)),
            }]
        );
    }

    #[test]
    fn removed_field() {
        let mut new = article();
        new.fields.retain(|f| f.name != "body");
        assert_eq!(
            diff_schemas(&article(), &new),
            vec![SchemaChange::RemoveField {
                name: "body".to_string()
            }]
        );
    }

    #[test]
    fn rename_is_reported_as_remove_and_add() {
        let mut new = article();
        new.fields[1].name = "content".to_string();
        let diff = diff_schemas(&article(), &new);
        assert_eq!(diff.len(), 2);
        assert!(matches!(&diff[0], SchemaChange::AddField { field } if field.name == "content"));
        assert!(matches!(&diff[1], SchemaChange::RemoveField { name } if name == "body"));
    }

    #[test]
    fn type_and_required_changes_are_one_update() {
        let mut new = article();
        new.fields[1].field_type = FieldType::String;
        new.fields[1].required = true;
        assert_eq!(
            diff_schemas(&article(), &new),
            vec![SchemaChange::UpdateField {
                name: "body".to_string(),
                new_type: Some(FieldType::String),
                new_required: Some(true),
            }]
        );
    }

    #[test]
    fn list_element_change_is_an_update() {
        let old = Schema::new("a").with_field(FieldSchema::new(
            "refs",
            FieldType::List(ElementType::Node),
        ));
        let new = Schema::new("a").with_field(FieldSchema::new(
            "refs",
            FieldType::List(ElementType::String),
        ));
        let diff = diff_schemas(&old, &new);
        assert!(matches!(
            &diff[0],
            SchemaChange::UpdateField {
                new_type: Some(FieldType::List(ElementType::String)),
                new_required: None,
                ..
            }
        ));
    }

    #[test]
    fn schema_attributes_collapse_into_one_update() {
        let mut new = article();
        new.display_field = None;
        new.segment_field = Some("title".to_string());
        new.container = true;
        let diff = diff_schemas(&article(), &new);
        assert_eq!(diff.len(), 1);
        match &diff[0] {
            SchemaChange::UpdateSchema(attrs) => {
                assert_eq!(attrs.display_field, Some(None));
                assert_eq!(attrs.segment_field, Some(Some("title".to_string())));
                assert_eq!(attrs.container, Some(true));
                assert_eq!(attrs.field_order, None);
            }
            other => panic!("expected UPDATE_SCHEMA, got {other:?}"),
        }
    }

    #[test]
    fn reordering_emits_field_order() {
        let mut new = article();
        new.fields.reverse();
        let diff = diff_schemas(&article(), &new);
        match diff.as_slice() {
            [SchemaChange::UpdateSchema(attrs)] => {
                assert_eq!(
                    attrs.field_order,
                    Some(vec!["body".to_string(), "title".to_string()])
                );
            }
            other => panic!("expected a single UPDATE_SCHEMA, got {other:?}"),
        }
    }

    #[test]
    fn field_inserted_in_the_middle_needs_an_order() {
        let mut new = article();
        new.fields
            .insert(1, FieldSchema::new("teaser", FieldType::String));
        let diff = diff_schemas(&article(), &new);
        assert_eq!(diff.len(), 2);
        assert!(matches!(&diff[1], SchemaChange::UpdateSchema(a) if a.field_order.is_some()));
    }
}

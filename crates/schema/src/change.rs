use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::model::{FieldSchema, FieldType};

/// A single structural change between two schema versions.
///
/// Change lists are ordered: they are applied front to back, in the order the
/// diff produced them (or the caller supplied them).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaChange {
    /// Append a new field.
    AddField { field: FieldSchema },
    /// Remove a field and its data.
    RemoveField { name: String },
    /// Change the type and/or the required flag of a field.
    UpdateField {
        name: String,
        #[serde(rename = "newType", default, skip_serializing_if = "Option::is_none")]
        new_type: Option<FieldType>,
        #[serde(
            rename = "newRequired",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        new_required: Option<bool>,
    },
    /// Rename a field, keeping its values. Never produced by the diff.
    RenameField { from: String, to: String },
    /// Change schema-level attributes.
    UpdateSchema(SchemaAttributes),
}

/// Schema-level attribute updates. `None` leaves an attribute untouched;
/// `Some(None)` clears an optional attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaAttributes {
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub display_field: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub segment_field: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<bool>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<Option<String>>,
    /// Complete field order after all preceding changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_order: Option<Vec<String>>,
}

impl SchemaAttributes {
    pub fn is_empty(&self) -> bool {
        self.display_field.is_none()
            && self.segment_field.is_none()
            && self.container.is_none()
            && self.description.is_none()
            && self.field_order.is_none()
    }
}

/// Distinguish an absent key (`None`) from an explicit `null` (`Some(None)`).
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl SchemaChange {
    /// Name of the field this change is about, if it is a field-level change.
    pub fn field_name(&self) -> Option<&str> {
        match self {
            SchemaChange::AddField { field } => Some(&field.name),
            SchemaChange::RemoveField { name } | SchemaChange::UpdateField { name, .. } => {
                Some(name)
            }
            SchemaChange::RenameField { to, .. } => Some(to),
            SchemaChange::UpdateSchema(_) => None,
        }
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaChange::AddField { field } => {
                write!(f, "+ {}: {}", field.name, field.field_type)?;
                if field.required {
                    write!(f, " (required)")?;
                }
                Ok(())
            }
            SchemaChange::RemoveField { name } => write!(f, "- {}", name),
            SchemaChange::UpdateField {
                name,
                new_type,
                new_required,
            } => {
                write!(f, "~ {}", name)?;
                if let Some(t) = new_type {
                    write!(f, " type -> {}", t)?;
                }
                if let Some(r) = new_required {
                    write!(f, " required -> {}", r)?;
                }
                Ok(())
            }
            SchemaChange::RenameField { from, to } => write!(f, "> {} -> {}", from, to),
            SchemaChange::UpdateSchema(attrs) => {
                let mut parts = Vec::new();
                if let Some(v) = &attrs.display_field {
                    parts.push(format!("displayField = {}", v.as_deref().unwrap_or("(none)")));
                }
                if let Some(v) = &attrs.segment_field {
                    parts.push(format!("segmentField = {}", v.as_deref().unwrap_or("(none)")));
                }
                if let Some(v) = attrs.container {
                    parts.push(format!("container = {}", v));
                }
                if let Some(v) = &attrs.description {
                    parts.push(format!("description = {}", v.as_deref().unwrap_or("(none)")));
                }
                if let Some(order) = &attrs.field_order {
                    parts.push(format!("order = [{}]", order.join(", ")));
                }
                write!(f, "* schema {}", parts.join(", "))
            }
        }
    }
}

/// Render a change list as human-readable text, one change per line.
pub fn changes_to_text(changes: &[SchemaChange]) -> String {
    changes
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a change list as the JSON document returned by a dry-run diff.
pub fn changes_to_json(changes: &[SchemaChange]) -> Value {
    serde_json::json!({
        "changes": changes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ElementType;
    use serde_json::json;

    #[test]
    fn change_is_tagged_by_operation() {
        let change = SchemaChange::AddField {
            field: FieldSchema::new("tags", FieldType::List(ElementType::String)),
        };
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["operation"], "ADD_FIELD");
        assert_eq!(value["field"]["listType"], "string");
    }

    #[test]
    fn update_field_omits_unchanged_parts() {
        let change = SchemaChange::UpdateField {
            name: "count".to_string(),
            new_type: Some(FieldType::String),
            new_required: None,
        };
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(
            value,
            json!({"operation": "UPDATE_FIELD", "name": "count", "newType": "string"})
        );
    }

    #[test]
    fn update_schema_distinguishes_clear_from_absent() {
        let cleared: SchemaChange = serde_json::from_value(json!({
            "operation": "UPDATE_SCHEMA",
            "displayField": null
        }))
        .unwrap();
        match cleared {
            SchemaChange::UpdateSchema(attrs) => {
                assert_eq!(attrs.display_field, Some(None));
                assert_eq!(attrs.segment_field, None);
            }
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn rename_is_accepted_as_input() {
        let change: SchemaChange = serde_json::from_value(json!({
            "operation": "RENAME_FIELD",
            "from": "headline",
            "to": "title"
        }))
        .unwrap();
        assert_eq!(change.field_name(), Some("title"));
        assert_eq!(change.to_string(), "> headline -> title");
    }

    #[test]
    fn text_output_lists_every_change() {
        let changes = vec![
            SchemaChange::AddField {
                field: FieldSchema::new("tags", FieldType::List(ElementType::String)),
            },
            SchemaChange::RemoveField {
                name: "subtitle".to_string(),
            },
            SchemaChange::UpdateSchema(SchemaAttributes {
                display_field: Some(Some("title".to_string())),
                ..Default::default()
            }),
        ];
        let text = changes_to_text(&changes);
        assert!(text.contains("+ tags: list<string>"));
        assert!(text.contains("- subtitle"));
        assert!(text.contains("* schema displayField = title"));
    }
}

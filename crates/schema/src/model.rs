use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SchemaValidationError;

/// Element type of a list field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    String,
    Html,
    Boolean,
    Date,
    Number,
    Node,
    Micronode,
}

impl ElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::String => "string",
            ElementType::Html => "html",
            ElementType::Boolean => "boolean",
            ElementType::Date => "date",
            ElementType::Number => "number",
            ElementType::Node => "node",
            ElementType::Micronode => "micronode",
        }
    }

    /// The scalar field type a single list element has.
    pub fn as_field_type(&self) -> FieldType {
        match self {
            ElementType::String => FieldType::String,
            ElementType::Html => FieldType::Html,
            ElementType::Boolean => FieldType::Boolean,
            ElementType::Date => FieldType::Date,
            ElementType::Number => FieldType::Number,
            ElementType::Node => FieldType::Node,
            ElementType::Micronode => FieldType::Micronode,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "string" => ElementType::String,
            "html" => ElementType::Html,
            "boolean" => ElementType::Boolean,
            "date" => ElementType::Date,
            "number" => ElementType::Number,
            "node" => ElementType::Node,
            "micronode" => ElementType::Micronode,
            _ => return None,
        })
    }
}

/// The type of a schema field.
///
/// Serialized as a lowercase name; list types carry their element type as
/// `list<string>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldType {
    String,
    Html,
    Boolean,
    Date,
    Number,
    Node,
    Micronode,
    List(ElementType),
}

impl FieldType {
    /// The base type name without the list element (`"list"` for lists).
    pub fn base_name(&self) -> &'static str {
        match self {
            FieldType::List(_) => "list",
            FieldType::String => "string",
            FieldType::Html => "html",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Number => "number",
            FieldType::Node => "node",
            FieldType::Micronode => "micronode",
        }
    }

    pub fn element(&self) -> Option<ElementType> {
        match self {
            FieldType::List(e) => Some(*e),
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, FieldType::List(_))
    }

    fn from_parts(base: &str, element: Option<ElementType>) -> Result<Self, SchemaValidationError> {
        if base == "list" {
            return element
                .map(FieldType::List)
                .ok_or_else(|| SchemaValidationError::UnknownFieldType("list".to_string()));
        }
        ElementType::parse(base)
            .map(|e| e.as_field_type())
            .ok_or_else(|| SchemaValidationError::UnknownFieldType(base.to_string()))
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::List(e) => write!(f, "list<{}>", e.as_str()),
            other => write!(f, "{}", other.base_name()),
        }
    }
}

impl FromStr for FieldType {
    type Err = SchemaValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(inner) = s.strip_prefix("list<").and_then(|r| r.strip_suffix('>')) {
            let element = ElementType::parse(inner)
                .ok_or_else(|| SchemaValidationError::UnknownFieldType(s.to_string()))?;
            return Ok(FieldType::List(element));
        }
        FieldType::from_parts(s, None)
    }
}

impl TryFrom<String> for FieldType {
    type Error = SchemaValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FieldType> for String {
    fn from(value: FieldType) -> Self {
        value.to_string()
    }
}

/// One field of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFieldSchema", into = "RawFieldSchema")]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Builder-style variant of [`FieldSchema::new`] that marks the field required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Wire form of a field: `{"name", "type", "listType"?, "required"}`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFieldSchema {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    list_type: Option<ElementType>,
    #[serde(default)]
    required: bool,
}

impl TryFrom<RawFieldSchema> for FieldSchema {
    type Error = SchemaValidationError;

    fn try_from(raw: RawFieldSchema) -> Result<Self, Self::Error> {
        if raw.kind != "list" && raw.list_type.is_some() {
            return Err(SchemaValidationError::InvalidField {
                field: raw.name,
                reason: "listType is only allowed on list fields".to_string(),
            });
        }
        let field_type = FieldType::from_parts(&raw.kind, raw.list_type).map_err(|_| {
            SchemaValidationError::InvalidField {
                field: raw.name.clone(),
                reason: match raw.kind.as_str() {
                    "list" => "list field is missing listType".to_string(),
                    other => format!("unknown type '{}'", other),
                },
            }
        })?;
        Ok(FieldSchema {
            name: raw.name,
            field_type,
            required: raw.required,
        })
    }
}

impl From<FieldSchema> for RawFieldSchema {
    fn from(field: FieldSchema) -> Self {
        RawFieldSchema {
            name: field.name,
            kind: field.field_type.base_name().to_string(),
            list_type: field.field_type.element(),
            required: field.required,
        }
    }
}

/// The structural definition of a content type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_field: Option<String>,
    #[serde(default)]
    pub container: bool,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            fields: Vec::new(),
            display_field: None,
            segment_field: None,
            container: false,
        }
    }

    pub fn with_field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_display_field(mut self, name: impl Into<String>) -> Self {
        self.display_field = Some(name.into());
        self
    }

    pub fn with_segment_field(mut self, name: impl Into<String>) -> Self {
        self.segment_field = Some(name.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Check internal consistency: a name, unique non-empty field names, and
    /// display/segment fields that point at existing fields.
    pub fn validate(&self) -> Result<(), SchemaValidationError> {
        if self.name.trim().is_empty() {
            return Err(SchemaValidationError::MissingName);
        }
        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(SchemaValidationError::InvalidField {
                    field: field.name.clone(),
                    reason: "field name must not be empty".to_string(),
                });
            }
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaValidationError::DuplicateField(field.name.clone()));
            }
        }
        for (attribute, value) in [
            ("displayField", &self.display_field),
            ("segmentField", &self.segment_field),
        ] {
            if let Some(name) = value {
                if !seen.contains(name.as_str()) {
                    return Err(SchemaValidationError::DanglingReference {
                        attribute,
                        field: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Structural equality: everything except the schema name, which
    /// identifies the schema family rather than its shape.
    pub fn structurally_eq(&self, other: &Schema) -> bool {
        self.fields == other.fields
            && self.display_field == other.display_field
            && self.segment_field == other.segment_field
            && self.container == other.container
            && self.description == other.description
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fields: {{{}}}", self.name, self.field_names().join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_type_parses_list_notation() {
        assert_eq!(
            "list<string>".parse::<FieldType>().unwrap(),
            FieldType::List(ElementType::String)
        );
        assert_eq!("html".parse::<FieldType>().unwrap(), FieldType::Html);
        assert!("list".parse::<FieldType>().is_err());
        assert!("list<list>".parse::<FieldType>().is_err());
        assert!("binary".parse::<FieldType>().is_err());
    }

    #[test]
    fn field_schema_wire_form_uses_list_type() {
        let field = FieldSchema::new("tags", FieldType::List(ElementType::String));
        let value = serde_json::to_value(&field).unwrap();
        assert_eq!(
            value,
            json!({"name": "tags", "type": "list", "listType": "string", "required": false})
        );
        let back: FieldSchema = serde_json::from_value(value).unwrap();
        assert_eq!(back, field);
    }

    #[test]
    fn list_field_without_list_type_is_rejected() {
        let result: Result<FieldSchema, _> =
            serde_json::from_value(json!({"name": "tags", "type": "list"}));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("listType"), "unexpected error: {err}");
    }

    #[test]
    fn scalar_field_with_list_type_is_rejected() {
        let result: Result<FieldSchema, _> = serde_json::from_value(
            json!({"name": "title", "type": "string", "listType": "string"}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn schema_deserializes_camel_case_attributes() {
        let schema: Schema = serde_json::from_value(json!({
            "name": "article",
            "displayField": "title",
            "segmentField": "slug",
            "container": true,
            "fields": [
                {"name": "title", "type": "string", "required": true},
                {"name": "slug", "type": "string"}
            ]
        }))
        .unwrap();
        assert_eq!(schema.display_field.as_deref(), Some("title"));
        assert_eq!(schema.segment_field.as_deref(), Some("slug"));
        assert!(schema.container);
        assert!(schema.fields[0].required);
        assert!(schema.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicates_and_dangling_references() {
        let dup = Schema::new("a")
            .with_field(FieldSchema::new("x", FieldType::String))
            .with_field(FieldSchema::new("x", FieldType::Number));
        assert_eq!(
            dup.validate(),
            Err(SchemaValidationError::DuplicateField("x".to_string()))
        );

        let dangling = Schema::new("a")
            .with_field(FieldSchema::new("x", FieldType::String))
            .with_display_field("y");
        assert!(matches!(
            dangling.validate(),
            Err(SchemaValidationError::DanglingReference {
                attribute: "displayField",
                ..
            })
        ));

        assert_eq!(
            Schema::new(" ").validate(),
            Err(SchemaValidationError::MissingName)
        );
    }

    #[test]
    fn display_lists_field_names() {
        let schema = Schema::new("article")
            .with_field(FieldSchema::new("title", FieldType::String))
            .with_field(FieldSchema::new("body", FieldType::Html));
        assert_eq!(schema.to_string(), "article fields: {title,body}");
    }
}

/// Errors raised while parsing, validating or evolving a schema.
///
/// A change list that fails validation never produces a partial schema
/// version: `apply_changes` either returns the complete result or one of
/// these errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaValidationError {
    /// Two fields share the same name.
    #[error("duplicate field '{0}'")]
    DuplicateField(String),

    /// A change or attribute refers to a field the schema does not have.
    #[error("unknown field '{0}'")]
    UnknownField(String),

    /// `displayField` or `segmentField` names a field that does not exist.
    #[error("{attribute} references unknown field '{field}'")]
    DanglingReference {
        attribute: &'static str,
        field: String,
    },

    /// A single field definition is malformed.
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    /// A type name that is not part of the field type vocabulary.
    #[error("unknown field type '{0}'")]
    UnknownFieldType(String),

    /// An explicit field order that is not a permutation of the schema's fields.
    #[error("invalid field order: {0}")]
    InvalidFieldOrder(String),

    /// A schema without a name.
    #[error("schema name must not be empty")]
    MissingName,

    /// A version appended to a chain out of sequence.
    #[error("version {found} does not follow version {expected_after}")]
    BrokenChain { expected_after: u32, found: u32 },
}

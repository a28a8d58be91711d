//! Quire schema model -- content type definitions, their version history,
//! the structural diff between two schemas, and the application of change
//! lists that produces the next version plus per-field transform rules.
//!
//! Nothing in this crate touches storage; it is pure data and functions.

pub mod apply;
pub mod change;
pub mod diff;
pub mod error;
pub mod model;
pub mod version;

pub use apply::{
    apply_changes, apply_to_version, replay_changes, AppliedChanges, TransformRule,
    TransformRules,
};
pub use change::{changes_to_json, changes_to_text, SchemaAttributes, SchemaChange};
pub use diff::diff_schemas;
pub use error::SchemaValidationError;
pub use model::{ElementType, FieldSchema, FieldType, Schema};
pub use version::{version_id, SchemaVersion, VersionChain, VersionReference};

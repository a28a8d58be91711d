//! CLI diff and apply subcommands.

use std::path::Path;
use std::process;

use quire_schema::{
    apply_changes, changes_to_json, changes_to_text, diff_schemas, Schema, SchemaChange,
    TransformRule, TransformRules,
};

use crate::{load_json, print_json, report_error, OutputFormat};

/// Print the changes that turn the schema at `old_path` into the one at
/// `new_path`.
pub(crate) fn cmd_diff(old_path: &Path, new_path: &Path, output: OutputFormat, quiet: bool) {
    let old = load_schema(old_path, output, quiet);
    let new = load_schema(new_path, output, quiet);

    let changes = diff_schemas(&old, &new);
    tracing::debug!(changes = changes.len(), "schemas diffed");
    if quiet {
        return;
    }
    match output {
        OutputFormat::Json => print_json(&changes_to_json(&changes)),
        OutputFormat::Text => {
            if changes.is_empty() {
                println!("no differences");
            } else {
                println!("{}", changes_to_text(&changes));
                println!();
                println!("{} change(s)", changes.len());
            }
        }
    }
}

/// Apply the change list at `changes_path` to the schema at `schema_path`.
pub(crate) fn cmd_apply(
    schema_path: &Path,
    changes_path: &Path,
    output: OutputFormat,
    quiet: bool,
) {
    let schema = load_schema(schema_path, output, quiet);
    let changes: Vec<SchemaChange> = load_json(changes_path, output, quiet);

    let applied = match apply_changes(&schema, &changes) {
        Ok(a) => a,
        Err(e) => {
            report_error(&format!("invalid change list: {}", e), output, quiet);
            process::exit(1);
        }
    };
    if quiet {
        return;
    }
    match output {
        OutputFormat::Json => print_json(&serde_json::json!({
            "schema": applied.schema,
            "rules": applied.rules,
        })),
        OutputFormat::Text => {
            println!("Schema: {}", applied.schema.name);
            for field in &applied.schema.fields {
                let required = if field.required { " (required)" } else { "" };
                println!("  {}: {}{}", field.name, field.field_type, required);
            }
            println!();
            println!("Transform rules:");
            print_rules(&applied.rules);
        }
    }
}

fn load_schema(path: &Path, output: OutputFormat, quiet: bool) -> Schema {
    let schema: Schema = load_json(path, output, quiet);
    if let Err(e) = schema.validate() {
        let msg = format!("invalid schema in '{}': {}", path.display(), e);
        report_error(&msg, output, quiet);
        process::exit(1);
    }
    schema
}

fn print_rules(rules: &TransformRules) {
    for (target, rule) in &rules.fields {
        match rule {
            TransformRule::Copy { source } if source == target => println!("  {}: copy", target),
            TransformRule::Copy { source } => println!("  {}: copy from '{}'", target, source),
            TransformRule::InitDefault => println!("  {}: default", target),
            TransformRule::Retype { source, from, to } => {
                println!("  {}: convert '{}' {} -> {}", target, source, from, to)
            }
            TransformRule::Drop => println!("  {}: drop", target),
        }
    }
    for name in rules.dropped.keys() {
        println!("  {}: removed", name);
    }
}

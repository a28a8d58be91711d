//! CLI integration tests for the `quire` binary.
//!
//! Uses `assert_cmd` to spawn the binary and verify exit codes, stdout
//! content, and stderr content. Input files are written to a temp dir.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn quire() -> Command {
    cargo_bin_cmd!("quire")
}

fn write_json(dir: &TempDir, name: &str, value: &Value) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    path
}

fn article() -> Value {
    json!({
        "name": "article",
        "displayField": "title",
        "fields": [
            {"name": "title", "type": "string", "required": true},
            {"name": "subtitle", "type": "string", "required": true},
            {"name": "views", "type": "string"}
        ]
    })
}

fn article_v2() -> Value {
    json!({
        "name": "article",
        "displayField": "title",
        "fields": [
            {"name": "title", "type": "string", "required": true},
            {"name": "views", "type": "number"},
            {"name": "tags", "type": "list", "listType": "string"}
        ]
    })
}

// ──────────────────────────────────────────────
// 1. Help and version
// ──────────────────────────────────────────────

#[test]
fn help_exits_0_with_description() {
    quire()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Quire schema migration toolkit"));
}

#[test]
fn version_exits_0() {
    quire()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("quire"));
}

// ──────────────────────────────────────────────
// 2. diff
// ──────────────────────────────────────────────

#[test]
fn diff_text_lists_changes() {
    let dir = TempDir::new().unwrap();
    let old = write_json(&dir, "old.json", &article());
    let new = write_json(&dir, "new.json", &article_v2());

    quire()
        .args(["diff"])
        .arg(&old)
        .arg(&new)
        .assert()
        .success()
        .stdout(predicate::str::contains("- subtitle"))
        .stdout(predicate::str::contains("~ views type -> number"))
        .stdout(predicate::str::contains("+ tags: list<string>"))
        .stdout(predicate::str::contains("3 change(s)"));
}

#[test]
fn diff_json_is_tagged_by_operation() {
    let dir = TempDir::new().unwrap();
    let old = write_json(&dir, "old.json", &article());
    let new = write_json(&dir, "new.json", &article_v2());

    let out = quire()
        .args(["--output", "json", "diff"])
        .arg(&old)
        .arg(&new)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let doc: Value = serde_json::from_slice(&out).unwrap();
    let ops: Vec<&str> = doc["changes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["operation"].as_str().unwrap())
        .collect();
    assert!(ops.contains(&"REMOVE_FIELD"));
    assert!(ops.contains(&"UPDATE_FIELD"));
    assert!(ops.contains(&"ADD_FIELD"));
}

#[test]
fn diff_identical_schemas_reports_no_differences() {
    let dir = TempDir::new().unwrap();
    let old = write_json(&dir, "old.json", &article());

    quire()
        .arg("diff")
        .arg(&old)
        .arg(&old)
        .assert()
        .success()
        .stdout(predicate::str::contains("no differences"));
}

#[test]
fn diff_invalid_schema_exits_1() {
    let dir = TempDir::new().unwrap();
    let old = write_json(&dir, "old.json", &article());
    let bad = write_json(
        &dir,
        "bad.json",
        &json!({
            "name": "article",
            "fields": [
                {"name": "title", "type": "string"},
                {"name": "title", "type": "html"}
            ]
        }),
    );

    quire()
        .arg("diff")
        .arg(&old)
        .arg(&bad)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid schema"));
}

#[test]
fn missing_file_reports_json_error() {
    quire()
        .args(["--output", "json", "diff", "does-not-exist.json", "other.json"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("\"error\""));
}

#[test]
fn quiet_suppresses_error_output() {
    quire()
        .args(["--quiet", "diff", "does-not-exist.json", "other.json"])
        .assert()
        .failure()
        .stderr(predicate::str::is_empty());
}

// ──────────────────────────────────────────────
// 3. apply
// ──────────────────────────────────────────────

#[test]
fn apply_prints_schema_and_rules() {
    let dir = TempDir::new().unwrap();
    let schema = write_json(&dir, "schema.json", &article());
    let changes = write_json(
        &dir,
        "changes.json",
        &json!([
            {"operation": "RENAME_FIELD", "from": "subtitle", "to": "teaser"},
            {"operation": "UPDATE_FIELD", "name": "views", "newType": "number"}
        ]),
    );

    quire()
        .arg("apply")
        .arg(&schema)
        .arg(&changes)
        .assert()
        .success()
        .stdout(predicate::str::contains("teaser: string (required)"))
        .stdout(predicate::str::contains("teaser: copy from 'subtitle'"))
        .stdout(predicate::str::contains("views: convert 'views' string -> number"));
}

#[test]
fn apply_json_contains_rules() {
    let dir = TempDir::new().unwrap();
    let schema = write_json(&dir, "schema.json", &article());
    let changes = write_json(
        &dir,
        "changes.json",
        &json!([{"operation": "REMOVE_FIELD", "name": "views"}]),
    );

    let out = quire()
        .args(["--output", "json", "apply"])
        .arg(&schema)
        .arg(&changes)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let doc: Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(doc["schema"]["fields"].as_array().unwrap().len(), 2);
    assert_eq!(doc["rules"]["fields"]["title"]["kind"], "COPY");
    assert!(doc["rules"]["dropped"].get("views").is_some());
}

#[test]
fn apply_unknown_field_exits_1() {
    let dir = TempDir::new().unwrap();
    let schema = write_json(&dir, "schema.json", &article());
    let changes = write_json(
        &dir,
        "changes.json",
        &json!([{"operation": "UPDATE_FIELD", "name": "missing", "newRequired": true}]),
    );

    quire()
        .arg("apply")
        .arg(&schema)
        .arg(&changes)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid change list"));
}

// ──────────────────────────────────────────────
// 4. migrate
// ──────────────────────────────────────────────

fn fixture() -> Value {
    json!({
        "schema": article(),
        "target": article_v2(),
        "nodes": [
            {"language": "en", "fields": {"title": "Hello", "subtitle": "World", "views": "42"}},
            {"language": "de", "fields": {"title": "Hallo", "subtitle": "Welt", "views": "viele"}}
        ]
    })
}

#[test]
fn migrate_text_reports_job_and_warnings() {
    let dir = TempDir::new().unwrap();
    let path = write_json(&dir, "fixture.json", &fixture());

    quire()
        .arg("migrate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("migration_invoked: article version 2"))
        .stdout(predicate::str::contains(": DONE"))
        .stdout(predicate::str::contains("required field removed with data loss"))
        .stdout(predicate::str::contains("value cannot be converted from string to number"));
}

#[test]
fn migrate_json_reports_migrated_nodes() {
    let dir = TempDir::new().unwrap();
    let path = write_json(&dir, "fixture.json", &fixture());

    let out = quire()
        .args(["--output", "json", "migrate"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let doc: Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(doc["outcome"], "migration_invoked");
    assert_eq!(doc["jobStatus"][0]["status"], "DONE");
    assert_eq!(doc["jobStatus"][0]["warnings"].as_array().unwrap().len(), 3);

    let nodes = doc["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 2);
    let en = nodes.iter().find(|n| n["language"] == "en").unwrap();
    assert_eq!(en["version"], 2);
    assert_eq!(en["fields"]["views"], 42);
    assert_eq!(en["fields"]["tags"], json!([]));
    assert!(en["fields"].get("subtitle").is_none());
}

#[test]
fn migrate_without_difference() {
    let dir = TempDir::new().unwrap();
    let path = write_json(
        &dir,
        "fixture.json",
        &json!({"schema": article(), "target": article(), "nodes": []}),
    );

    quire()
        .arg("migrate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("schema_update_no_difference_detected"));
}

#[test]
fn migrate_with_change_list_and_config() {
    let dir = TempDir::new().unwrap();
    let path = write_json(
        &dir,
        "fixture.json",
        &json!({
            "schema": article(),
            "changes": [{"operation": "REMOVE_FIELD", "name": "views"}],
            "nodes": [{"fields": {"title": "a", "subtitle": "b"}}]
        }),
    );
    let config = dir.path().join("quire.toml");
    fs::write(&config, "[migration]\nworker_pool_size = 1\norigin = \"cli-test\"\n").unwrap();

    quire()
        .arg("--config")
        .arg(&config)
        .arg("migrate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains(": DONE"));
}

#[test]
fn migrate_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    let path = write_json(&dir, "fixture.json", &fixture());
    let config = dir.path().join("quire.toml");
    fs::write(&config, "[migration]\nworker_pool_size = 0\n").unwrap();

    quire()
        .arg("--config")
        .arg(&config)
        .arg("migrate")
        .arg(&path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("worker_pool_size"));
}

#[test]
fn migrate_requires_target_or_changes() {
    let dir = TempDir::new().unwrap();
    let path = write_json(&dir, "fixture.json", &json!({"schema": article()}));

    quire()
        .arg("migrate")
        .arg(&path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("exactly one of 'target' or 'changes'"));
}

#[test]
fn migrate_rejects_unknown_node_field() {
    let dir = TempDir::new().unwrap();
    let path = write_json(
        &dir,
        "fixture.json",
        &json!({
            "schema": article(),
            "target": article_v2(),
            "nodes": [{"fields": {"title": "a", "bogus": 1}}]
        }),
    );

    quire()
        .arg("migrate")
        .arg(&path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("migration error"));
}

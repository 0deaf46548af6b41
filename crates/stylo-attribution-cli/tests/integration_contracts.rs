use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use serde_json::{json, Map, Value};
use stylo_attribution_core::{
    parse_rfc3339_utc, MemoryStorage, PageContext, SecurityLog, TagCommand, TagEvent, TagKind,
};

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn schema_dir() -> PathBuf {
    repo_root().join("contracts/v1/schemas")
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn compile(schema_path: &Path) -> JSONSchema {
    let schema = read_json(schema_path);
    JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()))
}

fn assert_schema(schema_path: &Path, value: &Value) {
    let compiled = compile(schema_path);
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

#[test]
fn every_schema_compiles_with_an_absolute_id() {
    let entries = fs::read_dir(schema_dir())
        .unwrap_or_else(|err| panic!("failed to list schema dir: {err}"));

    let mut compiled = 0;
    for entry in entries {
        let path = entry
            .unwrap_or_else(|err| panic!("failed to read schema dir entry: {err}"))
            .path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }

        let id = read_json(&path)["$id"].as_str().map(str::to_string);
        assert!(
            id.as_deref().is_some_and(|id| id.starts_with("https://")),
            "{} MUST carry an absolute $id, got {id:?}",
            path.display()
        );
        compile(&path);
        compiled += 1;
    }

    assert_eq!(compiled, 2);
}

#[test]
fn stored_security_log_matches_schema() {
    let now = parse_rfc3339_utc("2026-10-17T12:00:00Z")
        .unwrap_or_else(|err| panic!("failed to parse fixture time: {err}"));
    let page = PageContext::new("https://stylo.example/#contato").with_user_agent("contract/1.0");

    let mut log = SecurityLog::new(MemoryStorage::new());
    log.report(&page, "Form validation failed", Some(&json!({"errors": ["x"]})), now)
        .unwrap_or_else(|err| panic!("failed to report: {err}"));
    log.report(&page, "Form submission error", None, now)
        .unwrap_or_else(|err| panic!("failed to report: {err}"));

    let entries = serde_json::to_value(log.entries())
        .unwrap_or_else(|err| panic!("failed to encode entries: {err}"));
    assert_schema(&schema_dir().join("security-log.schema.json"), &entries);
}

#[test]
fn tag_events_match_schema_and_unknown_fields_are_rejected() {
    let schema_path = schema_dir().join("tag-event.schema.json");
    let mut params = Map::new();
    params.insert("contact_method".to_string(), json!("whatsapp"));

    for event in [
        TagEvent::new(TagKind::GoogleTag, TagCommand::Event, "contact_whatsapp", params),
        TagEvent::new(TagKind::FacebookPixel, TagCommand::TrackCustom, "CustomEvent", Map::new()),
    ] {
        let value = serde_json::to_value(&event)
            .unwrap_or_else(|err| panic!("failed to encode event: {err}"));
        assert_schema(&schema_path, &value);
    }

    let extra = json!({
        "tag": "google_tag",
        "command": "event",
        "name": "page_view",
        "params": {},
        "user_email": "maria@empresa.com.br"
    });
    assert!(!compile(&schema_path).is_valid(&extra));
}

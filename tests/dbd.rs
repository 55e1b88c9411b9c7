//! DBD schema files: includes, the JSON schema cache, and validation through a loaded schema.

use dbmsi::{validate_record, DbdError, FieldType, Record, Schema, ValidationError, ValueError};
use std::fs;
use std::path::{Path, PathBuf};

const MENUS: &str = r#"
menu(menuOnOff) {
    choice(menuOnOffOFF, "Off")
    choice(menuOnOffON, "On")
}
"#;

const BASE: &str = r#"
include "menus.dbd"
recordtype(ai) {
    field(DESC, DBF_STRING) { prompt("Descriptor") size(41) }
    field(SW, DBF_MENU) { menu(menuOnOff) }
    field(U8, DBF_UCHAR) { }
    field(I8, DBF_CHAR) { }
    field(DTYP, DBF_DEVICE) { }
}
recordtype(bo) {
    field(VAL, DBF_ENUM) { }
}
device(ai, CONSTANT, devAiSoft, "Soft Channel")
"#;

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write fixture");
    path
}

fn fixture() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    write(dir.path(), "menus.dbd", MENUS);
    let base = write(dir.path(), "base.dbd", BASE);
    (dir, base)
}

fn check(schema: &Schema, field: &str, value: &str) -> Result<(), ValidationError> {
    let record = Record::new("ai", "r", vec![(field.to_string(), value.to_string())], "t.db", 1).expect("record");
    validate_record(schema, &record)
}

#[test]
fn include_is_resolved_next_to_including_file() {
    let (_dir, base) = fixture();
    let (schema, opened) = Schema::parse_file_with_deps(&base, &[]).expect("parse");
    assert_eq!(opened.len(), 2);
    assert!(opened[1].ends_with("menus.dbd"));
    assert!(schema.menu("menuOnOff").is_some());
    let ai = schema.record_type("ai").expect("ai");
    assert_eq!(ai.field("SW").map(|f| f.field_type), Some(FieldType::Menu));
    assert_eq!(ai.field("DESC").and_then(|f| f.size), Some(41));
}

#[test]
fn include_found_through_search_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let shared = dir.path().join("shared");
    let app = dir.path().join("app");
    fs::create_dir_all(&shared).unwrap();
    fs::create_dir_all(&app).unwrap();
    write(&shared, "menus.dbd", MENUS);
    let base = write(&app, "base.dbd", BASE);

    assert!(matches!(
        Schema::parse_file(&base, &[]),
        Err(DbdError::MissingInclude { ref name, .. }) if name == "menus.dbd"
    ));
    let schema = Schema::parse_file(&base, &[shared]).expect("parse");
    assert_eq!(schema.record_types.len(), 2);
}

#[test]
fn include_inside_record_type_adds_fields() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(
        dir.path(),
        "common.dbd",
        "%#include \"epicsTypes.h\"\nfield(NAME, DBF_STRING) { size(61) }\nfield(DESC, DBF_STRING) { size(41) }\n",
    );
    let top = write(
        dir.path(),
        "ai.dbd",
        "recordtype(ai) {\n    include \"common.dbd\"\n    field(VAL, DBF_DOUBLE) { }\n}\n",
    );
    let (schema, opened) = Schema::parse_file_with_deps(&top, &[]).expect("parse");
    assert!(opened[1].ends_with("common.dbd"));
    let ai = schema.record_type("ai").expect("ai");
    let names: Vec<&str> = ai.fields.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["NAME", "DESC", "VAL"]);
    assert_eq!(ai.field("NAME").and_then(|f| f.size), Some(61));

    let broken = write(dir.path(), "bad.dbd", "recordtype(x) { include \"absent.dbd\" }\n");
    assert!(matches!(
        Schema::parse_file(&broken, &[]),
        Err(DbdError::MissingInclude { ref name, .. }) if name == "absent.dbd"
    ));
}

#[test]
fn missing_dbd_is_io_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = Schema::parse_file(&dir.path().join("absent.dbd"), &[]).unwrap_err();
    assert!(matches!(err, DbdError::Io { .. }));
}

#[test]
fn validation_through_loaded_schema() {
    let (_dir, base) = fixture();
    let schema = Schema::parse_file(&base, &[]).expect("parse");

    assert!(check(&schema, "U8", "255").is_ok());
    assert!(check(&schema, "U8", "256").is_err());
    assert!(check(&schema, "U8", "-1").is_err());
    assert!(check(&schema, "I8", "-128").is_ok());
    assert!(check(&schema, "I8", "129").is_err());

    assert!(check(&schema, "SW", "On").is_ok());
    assert!(check(&schema, "SW", "1").is_ok());
    match check(&schema, "SW", "Maybe") {
        Err(ValidationError::InvalidValue { reason, .. }) => assert_eq!(
            reason,
            ValueError::NotInMenu {
                menu: "menuOnOff".to_string()
            }
        ),
        other => panic!("expected menu error, got {:?}", other),
    }

    assert!(check(&schema, "DTYP", "Soft Channel").is_ok());
    assert!(check(&schema, "DTYP", "Other").is_err());
}

#[test]
fn cache_is_written_and_reused() {
    let (dir, base) = fixture();
    let cache = dir.path().join("base.dbd.cache");
    let first = Schema::load(&base, Some(&cache), &[]).expect("load");
    assert!(cache.exists());

    // Tamper with the cached schema; a fresh cache must be trusted as-is.
    let text = fs::read_to_string(&cache).unwrap();
    let mut json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["format_version"], 1);
    json["schema"]["record_types"]
        .as_object_mut()
        .expect("record_types map")
        .remove("bo");
    fs::write(&cache, serde_json::to_string(&json).unwrap()).unwrap();

    let cached = Schema::load(&base, Some(&cache), &[]).expect("load from cache");
    assert!(cached.record_type("bo").is_none());
    assert_eq!(cached.record_type("ai"), first.record_type("ai"));
    let sw = cached.record_type("ai").unwrap().field("SW").unwrap();
    assert!(sw.menu.as_ref().unwrap().contains_label("Off"));
}

#[test]
fn stale_cache_is_refreshed() {
    let (dir, base) = fixture();
    let cache = dir.path().join("base.cache");
    Schema::load(&base, Some(&cache), &[]).expect("load");

    let mut source = fs::read_to_string(&base).unwrap();
    source.push_str("recordtype(calc) { field(CALC, DBF_STRING) { size(80) } }\n");
    fs::write(&base, source).unwrap();

    let schema = Schema::load(&base, Some(&cache), &[]).expect("reload");
    assert!(schema.record_type("calc").is_some());
    let again = Schema::load(&base, Some(&cache), &[]).expect("cached reload");
    assert_eq!(again, schema);
}

#[test]
fn unreadable_cache_is_ignored() {
    let (dir, base) = fixture();
    let cache = write(dir.path(), "garbage.cache", "this is not json");
    let schema = Schema::load(&base, Some(&cache), &[]).expect("load");
    assert_eq!(schema.record_types.len(), 2);
    let rewritten = fs::read_to_string(&cache).unwrap();
    assert!(rewritten.starts_with('{'));

    let foreign = write(dir.path(), "foreign.cache", "{\"format_version\": 999}");
    let schema = Schema::load(&base, Some(&foreign), &[]).expect("load");
    assert_eq!(schema.record_types.len(), 2);
}

#[test]
fn load_without_cache_parses() {
    let (_dir, base) = fixture();
    let schema = Schema::load(&base, None, &[]).expect("load");
    assert!(schema.record_type("bo").is_some());
}

//! Migration ledger persistence tests

use address_pipeline::{
    ColumnType, CteCompiler, InputTable, MigrationLedger, MigrationStatus, PipelineError, Schema,
    SqlStep, StepRegistry,
};
use tempfile::TempDir;

fn input() -> InputTable {
    InputTable::new("raw", Schema::new().with("address", ColumnType::String))
}

fn trim(sql: &str) -> SqlStep {
    SqlStep::new("trim", sql).requires(["address"]).emits(["address"])
}

#[test]
fn test_save_and_load_json() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("ledger.json");

    let pipeline = StepRegistry::new()
        .with_step(trim("SELECT * EXCLUDE (address), trim(address) AS address FROM {input}"))
        .unwrap()
        .into_pipeline();

    let mut ledger = MigrationLedger::new();
    ledger.track(&pipeline);
    ledger.mark_ported("trim").unwrap();
    ledger.set_notes("trim", "matches legacy output on sample").unwrap();
    ledger.save(&path).unwrap();

    let loaded = MigrationLedger::load(&path).unwrap();
    assert_eq!(loaded, ledger);
    assert_eq!(loaded.status("trim"), Some(MigrationStatus::Ported));
}

#[test]
fn test_load_missing_file() {
    let temp = TempDir::new().unwrap();
    let err = MigrationLedger::load(&temp.path().join("nope.json")).unwrap_err();
    assert!(matches!(err, PipelineError::FileNotFound(_)));
}

#[test]
fn test_yaml_round_trip() {
    let mut ledger = MigrationLedger::from_yaml(
        r#"
steps:
  trim:
    status: verified
    updated_at: 2024-05-01T12:00:00Z
    fingerprint: abc
  upper:
    status: pending
    updated_at: 2024-05-01T12:00:00Z
"#,
    )
    .unwrap();
    assert_eq!(ledger.status("trim"), Some(MigrationStatus::Verified));
    assert_eq!(ledger.summary().verified, 1);

    ledger.mark_ported("upper").unwrap();
    let again = MigrationLedger::from_yaml(&ledger.to_yaml().unwrap()).unwrap();
    assert_eq!(again, ledger);
}

#[test]
fn test_changed_sql_marks_verified_step_stale() {
    let original = StepRegistry::new()
        .with_step(trim("SELECT * EXCLUDE (address), trim(address) AS address FROM {input}"))
        .unwrap()
        .into_pipeline();
    let plan = CteCompiler::default().plan(&original, &input()).unwrap();

    let mut ledger = MigrationLedger::new();
    ledger.track(&original);
    ledger.mark_ported("trim").unwrap();
    ledger.verify_in("trim", &plan).unwrap();
    assert!(ledger.stale_steps(&plan).unwrap().is_empty());

    let reworked = StepRegistry::new()
        .with_step(trim("SELECT * EXCLUDE (address), ltrim(rtrim(address)) AS address FROM {input}"))
        .unwrap()
        .into_pipeline();
    let plan = CteCompiler::default().plan(&reworked, &input()).unwrap();
    assert_eq!(ledger.stale_steps(&plan).unwrap(), vec!["trim"]);

    ledger.verify_in("trim", &plan).unwrap();
    assert!(ledger.stale_steps(&plan).unwrap().is_empty());
}

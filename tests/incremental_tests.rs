mod common;

use common::TestProject;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use trex_materialize::{
    Logger, MaterializationHandler, MaterializationKind, MaterializeOutcome, ModelMetadata,
    Strategy,
};

const MERGE_AUTO_ID: &str = r#"
schema:
  - name: id
    datatype: BIGINT
    autoIncremental: true
  - name: name
    datatype: VARCHAR
  - name: updated_at
    datatype: TIMESTAMP
incremental:
  strategy: merge
  merge:
    filter_column: updated_at
    start_value: auto
    unique_key: name
"#;

const APPEND: &str = r#"
incremental:
  strategy: append
  append:
    filter_column: ts
"#;

const DELETE_INSERT: &str = r#"
incremental:
  strategy: delete_insert
  delete_insert:
    filter_column: ts
    unique_key: id
"#;

const MERGE: &str = r#"
incremental:
  strategy: merge
  merge:
    filter_column: ts
    start_value: '2024-01-01'
    unique_key: id
"#;

const STRATEGIES: [(&str, &str, Strategy); 3] = [
    ("a", APPEND, Strategy::Append),
    ("m", MERGE, Strategy::Merge),
    ("d", DELETE_INSERT, Strategy::DeleteInsert),
];

fn seed_names(project: &TestProject) {
    project.exec(
        "CREATE TABLE src AS \
         SELECT 'k' || lpad(CAST(i AS VARCHAR), 2, '0') AS name, TIMESTAMP '2999-01-01 00:00:00' AS updated_at \
         FROM range(1, 21) t(i)",
    );
}

fn seed_events(project: &TestProject) {
    project.exec(
        "CREATE TABLE events_src AS \
         SELECT CAST(i AS INTEGER) AS id, 'v' || CAST(i AS VARCHAR) AS v, TIMESTAMP '2999-06-01 00:00:00' AS ts \
         FROM range(1, 4) t(i)",
    );
}

#[test]
fn test_deleted_key_gets_next_id() {
    let project = TestProject::new();
    seed_names(&project);
    let sql = "SELECT name, updated_at FROM src";

    assert_eq!(project.materialize("dim_names", sql, MERGE_AUTO_ID), MaterializeOutcome::FullLoad);
    assert_eq!(project.count("dim_names"), 20);
    assert_eq!(project.scalar("SELECT MAX(id) FROM dim_names").as_deref(), Some("20"));
    assert_eq!(
        project.scalar("SELECT id FROM dim_names WHERE name = 'k13'").as_deref(),
        Some("13")
    );

    project.exec("DELETE FROM dim_names WHERE name = 'k13'");
    assert_eq!(
        project.materialize("dim_names", sql, MERGE_AUTO_ID),
        MaterializeOutcome::Incremental { strategy: Strategy::Merge }
    );
    assert_eq!(project.count("dim_names"), 20);
    assert_eq!(
        project.scalar("SELECT id FROM dim_names WHERE name = 'k13'").as_deref(),
        Some("21")
    );
    assert_eq!(
        project.scalar("SELECT COUNT(DISTINCT id) FROM dim_names").as_deref(),
        Some("20")
    );
}

#[test]
fn test_rerun_without_changes_keeps_ids() {
    let project = TestProject::new();
    seed_names(&project);
    let sql = "SELECT name, updated_at FROM src";

    project.materialize("dim_names", sql, MERGE_AUTO_ID);
    let before = project.pairs("SELECT name, CAST(id AS VARCHAR) FROM dim_names ORDER BY name");
    project.materialize("dim_names", sql, MERGE_AUTO_ID);
    project.materialize("dim_names", sql, MERGE_AUTO_ID);
    let after = project.pairs("SELECT name, CAST(id AS VARCHAR) FROM dim_names ORDER BY name");
    assert_eq!(before, after);
}

#[test]
fn test_new_source_rows_are_numbered_after_existing() {
    let project = TestProject::new();
    seed_names(&project);
    let sql = "SELECT name, updated_at FROM src";
    project.materialize("dim_names", sql, MERGE_AUTO_ID);

    project.exec("INSERT INTO src VALUES ('a00', TIMESTAMP '2999-01-02 00:00:00')");
    project.materialize("dim_names", sql, MERGE_AUTO_ID);
    assert_eq!(project.count("dim_names"), 21);
    assert_eq!(
        project.scalar("SELECT id FROM dim_names WHERE name = 'a00'").as_deref(),
        Some("21")
    );
}

#[test]
fn test_append_reinserts_matching_rows() {
    let project = TestProject::new();
    seed_events(&project);
    let sql = "SELECT id, v, ts FROM events_src";

    assert_eq!(project.materialize("events", sql, APPEND), MaterializeOutcome::FullLoad);
    assert_eq!(project.count("events"), 3);
    assert_eq!(
        project.materialize("events", sql, APPEND),
        MaterializeOutcome::Incremental { strategy: Strategy::Append }
    );
    project.materialize("events", sql, APPEND);
    assert_eq!(project.count("events"), 9);
}

#[test]
fn test_delete_insert_replaces_matching_keys() {
    let project = TestProject::new();
    seed_events(&project);
    let sql = "SELECT id, v, ts FROM events_src";

    project.materialize("events", sql, DELETE_INSERT);
    project.exec("UPDATE events_src SET v = 'changed' WHERE id = 2");
    assert_eq!(
        project.materialize("events", sql, DELETE_INSERT),
        MaterializeOutcome::Incremental { strategy: Strategy::DeleteInsert }
    );
    assert_eq!(project.count("events"), 3);
    assert_eq!(
        project.pairs("SELECT CAST(id AS VARCHAR), v FROM events ORDER BY id"),
        vec![
            ("1".to_string(), "v1".to_string()),
            ("2".to_string(), "changed".to_string()),
            ("3".to_string(), "v3".to_string()),
        ]
    );
}

#[test]
fn test_delete_insert_where_condition_uses_vars() {
    let project = TestProject::new();
    project.exec(
        "CREATE TABLE daily AS \
         SELECT CAST(DATE '2999-01-01' + CAST(i AS INTEGER) AS DATE) AS d, 'old' AS v FROM range(5) t(i)",
    );
    let yaml = r#"
incremental:
  strategy: delete_insert
  delete_insert:
    filter_column: d
    unique_key: d
    where_condition: "d >= '${since}'"
"#;
    let metadata = ModelMetadata::from_yaml("daily_copy", yaml).unwrap();
    let vars = HashMap::from([("since".to_string(), "2999-01-01".to_string())]);
    let handler = MaterializationHandler::new(&project.db, &project.state, Logger::default())
        .with_vars(vars);
    let sql = "SELECT d, v FROM daily";

    handler
        .materialize("daily_copy", sql, MaterializationKind::Incremental, &metadata)
        .unwrap();
    project.exec("UPDATE daily SET v = 'new'");
    handler
        .materialize("daily_copy", sql, MaterializationKind::Incremental, &metadata)
        .unwrap();
    assert_eq!(project.count("daily_copy"), 5);
    assert_eq!(
        project.scalar("SELECT COUNT(*) FROM daily_copy WHERE v = 'new'").as_deref(),
        Some("5")
    );

    // same model without the variable is a configuration error
    let err = MaterializationHandler::new(&project.db, &project.state, Logger::default())
        .materialize("daily_copy", sql, MaterializationKind::Incremental, &metadata)
        .unwrap_err();
    assert!(err.to_string().contains("since"));
}

#[test]
fn test_first_run_is_full_load_for_every_strategy() {
    let project = TestProject::new();
    seed_events(&project);
    let sql = "SELECT id, v, ts FROM events_src";
    for (name, yaml, _) in STRATEGIES {
        assert_eq!(project.materialize(name, sql, yaml), MaterializeOutcome::FullLoad);
        assert_eq!(project.count(name), 3);
        let state = project.state.get_state(name).unwrap().unwrap();
        assert!(state.last_processed_value.is_some());
    }
}

#[test]
fn test_changed_sql_or_config_forces_full_load() {
    let project = TestProject::new();
    seed_events(&project);
    let sql = "SELECT id, v, ts FROM events_src";
    project.materialize("events", sql, APPEND);
    project.materialize("events", sql, APPEND);
    assert_eq!(project.count("events"), 6);

    let narrowed = "SELECT id, v, ts FROM events_src WHERE id < 3";
    assert_eq!(project.materialize("events", narrowed, APPEND), MaterializeOutcome::FullLoad);
    assert_eq!(project.count("events"), 2);

    let with_lookback = "incremental:\n  strategy: append\n  append:\n    filter_column: ts\n    lookback: 1 day\n";
    assert_eq!(
        project.materialize("events", narrowed, with_lookback),
        MaterializeOutcome::FullLoad
    );
    assert_eq!(project.count("events"), 2);
}

#[test]
fn test_unknown_or_changed_hash_forces_full_load_for_every_strategy() {
    let project = TestProject::new();
    seed_events(&project);
    let sql = "SELECT id, v, ts FROM events_src";
    let narrowed = "SELECT id, v, ts FROM events_src WHERE id < 3";

    for (name, yaml, strategy) in STRATEGIES {
        project.materialize(name, sql, yaml);

        // adopted without history: hashes are "unknown"
        project.state.delete_state(name).unwrap();
        let adopted = project.state.rebuild_from_database(&project.db, name).unwrap().unwrap();
        assert!(adopted.is_unknown());
        assert_eq!(project.materialize(name, sql, yaml), MaterializeOutcome::FullLoad, "{name}");
        assert_eq!(project.count(name), 3);
        assert_eq!(
            project.materialize(name, sql, yaml),
            MaterializeOutcome::Incremental { strategy },
            "{name}"
        );

        assert_eq!(project.materialize(name, narrowed, yaml), MaterializeOutcome::FullLoad, "{name}");
        assert_eq!(project.count(name), 2);
    }
}

#[test]
fn test_dropped_destination_is_rebuilt() {
    let project = TestProject::new();
    seed_events(&project);
    let sql = "SELECT id, v, ts FROM events_src";
    project.materialize("events", sql, DELETE_INSERT);
    project.exec("DROP TABLE events");
    assert_eq!(project.materialize("events", sql, DELETE_INSERT), MaterializeOutcome::FullLoad);
    assert_eq!(project.count("events"), 3);
}

#[test]
fn test_merge_without_unique_key_is_rejected() {
    let project = TestProject::new();
    let yaml = "incremental:\n  strategy: merge\n  merge:\n    filter_column: ts\n";
    let err = project.try_materialize("events", "SELECT 1", yaml).unwrap_err();
    assert!(err.to_string().contains("unique_key"));
}

#[test]
fn test_state_survives_reopen() {
    let project = TestProject::new();
    seed_events(&project);
    let dir = tempfile::tempdir().unwrap();
    let settings = trex_materialize::Settings::from_toml_str(&format!(
        "state_path = '{}'\n[vars]\nsince = '2999-01-01'\n",
        dir.path().join("state.duckdb").display()
    ))
    .unwrap();
    let metadata = ModelMetadata::from_yaml(
        "events",
        "incremental:\n  strategy: merge\n  merge:\n    filter_column: ts\n    start_value: '${since}'\n    unique_key: id\n",
    )
    .unwrap();
    let sql = "SELECT id, v, ts FROM events_src";

    let state = trex_materialize::StateManager::from_settings(&settings, Logger::default());
    let outcome = MaterializationHandler::from_settings(&project.db, &state, &settings, Logger::default())
        .materialize("events", sql, MaterializationKind::Incremental, &metadata)
        .unwrap();
    assert_eq!(outcome, MaterializeOutcome::FullLoad);
    state.close().unwrap();

    let reopened = trex_materialize::StateManager::from_settings(&settings, Logger::default());
    let outcome = MaterializationHandler::from_settings(&project.db, &reopened, &settings, Logger::default())
        .materialize("events", sql, MaterializationKind::Incremental, &metadata)
        .unwrap();
    assert_eq!(outcome, MaterializeOutcome::Incremental { strategy: Strategy::Merge });
    assert_eq!(project.count("events"), 3);
}

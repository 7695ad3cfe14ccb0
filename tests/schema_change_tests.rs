mod common;

use common::TestProject;
use pretty_assertions::assert_eq;
use trex_materialize::{Adapter, Error, MaterializeOutcome, Strategy};

fn append_with_policy(policy: &str) -> String {
    format!(
        "incremental:\n  strategy: append\n  on_schema_change: {policy}\n  append:\n    filter_column: ts\n"
    )
}

fn seed(project: &TestProject) {
    project.exec(
        "CREATE TABLE raw_events AS \
         SELECT CAST(i AS INTEGER) AS id, TIMESTAMP '2999-01-01 00:00:00' AS ts FROM range(3) t(i)",
    );
}

fn columns(project: &TestProject, table: &str) -> Vec<String> {
    project
        .db
        .query(&format!(
            "SELECT column_name FROM information_schema.columns WHERE table_name = '{table}' ORDER BY ordinal_position"
        ))
        .unwrap()
        .iter()
        .filter_map(|r| r.get(0).map(str::to_string))
        .collect()
}

#[test]
fn test_append_new_columns_widens_destination() {
    let project = TestProject::new();
    seed(&project);
    let yaml = append_with_policy("append_new_columns");
    let sql = "SELECT * FROM raw_events";
    project.materialize("events", sql, &yaml);

    project.exec("ALTER TABLE raw_events ADD COLUMN channel VARCHAR DEFAULT 'web'");
    assert_eq!(
        project.materialize("events", sql, &yaml),
        MaterializeOutcome::Incremental { strategy: Strategy::Append }
    );
    assert_eq!(columns(&project, "events"), vec!["id", "ts", "channel"]);
    assert_eq!(project.count("events"), 6);
    assert_eq!(
        project.scalar("SELECT COUNT(*) FROM events WHERE channel IS NULL").as_deref(),
        Some("3")
    );
}

#[test]
fn test_ignored_new_column_keeps_appending() {
    let project = TestProject::new();
    seed(&project);
    let yaml = "incremental:\n  strategy: append\n  append:\n    filter_column: ts\n";
    let sql = "SELECT * FROM raw_events";
    project.materialize("events", sql, yaml);

    project.exec("ALTER TABLE raw_events ADD COLUMN channel VARCHAR DEFAULT 'web'");
    assert_eq!(
        project.materialize("events", sql, yaml),
        MaterializeOutcome::Incremental { strategy: Strategy::Append }
    );
    assert_eq!(columns(&project, "events"), vec!["id", "ts"]);
    assert_eq!(project.count("events"), 6);
}

#[test]
fn test_ignored_new_column_keeps_delete_insert_running() {
    let project = TestProject::new();
    seed(&project);
    let yaml = "incremental:\n  strategy: delete_insert\n  on_schema_change: ignore\n  delete_insert:\n    filter_column: ts\n    unique_key: id\n";
    let sql = "SELECT * FROM raw_events";
    project.materialize("events", sql, yaml);

    project.exec("ALTER TABLE raw_events ADD COLUMN channel VARCHAR DEFAULT 'web'");
    assert_eq!(
        project.materialize("events", sql, yaml),
        MaterializeOutcome::Incremental { strategy: Strategy::DeleteInsert }
    );
    assert_eq!(columns(&project, "events"), vec!["id", "ts"]);
    assert_eq!(project.count("events"), 3);
}

#[test]
fn test_fail_policy_leaves_state_untouched() {
    let project = TestProject::new();
    seed(&project);
    let yaml = append_with_policy("fail");
    let sql = "SELECT * FROM raw_events";
    project.materialize("events", sql, &yaml);
    let before = project.state.get_state("events").unwrap().unwrap();

    project.exec("ALTER TABLE raw_events ADD COLUMN channel VARCHAR");
    let err = project.try_materialize("events", sql, &yaml).unwrap_err();
    match err {
        Error::SchemaDrift { model, diff } => {
            assert_eq!(model, "events");
            assert_eq!(diff.new_columns.len(), 1);
            assert_eq!(diff.new_columns[0].name, "channel");
        }
        other => panic!("expected schema drift, got {other}"),
    }
    let after = project.state.get_state("events").unwrap().unwrap();
    assert_eq!(before.last_processed_value, after.last_processed_value);
    assert_eq!(project.count("events"), 3);
}

#[test]
fn test_full_refresh_rebuilds_with_new_shape() {
    let project = TestProject::new();
    seed(&project);
    let yaml = append_with_policy("full_refresh");
    let sql = "SELECT * FROM raw_events";
    project.materialize("events", sql, &yaml);
    project.materialize("events", sql, &yaml);
    assert_eq!(project.count("events"), 6);

    project.exec("ALTER TABLE raw_events ADD COLUMN channel VARCHAR DEFAULT 'web'");
    assert_eq!(project.materialize("events", sql, &yaml), MaterializeOutcome::Refreshed);
    assert_eq!(project.count("events"), 3);
    assert_eq!(columns(&project, "events"), vec!["id", "ts", "channel"]);
}

#[test]
fn test_recreate_empty_then_loads_window() {
    let project = TestProject::new();
    seed(&project);
    let yaml = append_with_policy("recreate_empty");
    let sql = "SELECT * FROM raw_events";
    project.materialize("events", sql, &yaml);

    project.exec("ALTER TABLE raw_events ADD COLUMN channel VARCHAR DEFAULT 'web'");
    assert_eq!(
        project.materialize("events", sql, &yaml),
        MaterializeOutcome::Incremental { strategy: Strategy::Append }
    );
    assert_eq!(columns(&project, "events"), vec!["id", "ts", "channel"]);
    assert_eq!(project.count("events"), 3);
}

const CHUNKED: &str = r#"
incremental:
  strategy: delete_insert
  on_schema_change: full_incremental_refresh
  delete_insert:
    filter_column: d
    unique_key: d
full_incremental_refresh:
  parameters:
    - name: day
      start_value: '2024-01-01'
      end_value: '2024-01-15'
      step: 1 day
"#;

fn seed_daily(project: &TestProject) {
    project.exec(
        "CREATE TABLE daily AS \
         SELECT CAST(DATE '2024-01-01' + CAST(i AS INTEGER) AS DATE) AS d, CAST(i AS INTEGER) AS n \
         FROM range(20) t(i)",
    );
}

#[test]
fn test_templated_model_loads_in_fifteen_chunks() {
    let project = TestProject::new();
    seed_daily(&project);
    let sql = "SELECT * FROM daily WHERE d >= '{{ day }}' AND d < '{{ day_end }}'";

    assert_eq!(
        project.materialize("daily_agg", sql, CHUNKED),
        MaterializeOutcome::Backfilled { chunks: 15 }
    );
    assert_eq!(project.count("daily_agg"), 15);
    assert_eq!(
        project.scalar("SELECT CAST(MAX(d) AS VARCHAR) FROM daily_agg").as_deref(),
        Some("2024-01-15")
    );
    let state = project.state.get_state("daily_agg").unwrap().unwrap();
    assert_eq!(state.strategy, Some(Strategy::DeleteInsert));

    assert_eq!(
        project.materialize("daily_agg", sql, CHUNKED),
        MaterializeOutcome::Incremental { strategy: Strategy::DeleteInsert }
    );
    assert_eq!(project.count("daily_agg"), 15);
}

#[test]
fn test_full_incremental_refresh_on_drift() {
    let project = TestProject::new();
    seed_daily(&project);
    let sql = "SELECT * FROM daily WHERE d >= '{{ day }}' AND d < '{{ day_end }}'";
    project.materialize("daily_agg", sql, CHUNKED);

    project.exec("ALTER TABLE daily ADD COLUMN label VARCHAR DEFAULT 'x'");
    assert_eq!(
        project.materialize("daily_agg", sql, CHUNKED),
        MaterializeOutcome::Backfilled { chunks: 15 }
    );
    assert_eq!(columns(&project, "daily_agg"), vec!["d", "n", "label"]);
    assert_eq!(
        project.scalar("SELECT COUNT(*) FROM daily_agg WHERE label = 'x'").as_deref(),
        Some("15")
    );
}

fn people_dim(policy: &str) -> String {
    format!(
        r#"
schema:
  - name: id
    datatype: BIGINT
    autoIncremental: true
  - name: name
    datatype: VARCHAR
  - name: email
    datatype: VARCHAR
incremental:
  strategy: merge
  on_schema_change: {policy}
  merge:
    filter_column: updated_at
    start_value: '2024-01-01'
    unique_key: name
"#
    )
}

fn seed_people(project: &TestProject) {
    project.exec(
        "CREATE TABLE people AS \
         SELECT 'p' || CAST(i AS VARCHAR) AS name, 'p' || CAST(i AS VARCHAR) || '@example.com' AS full_email, \
         TIMESTAMP '2999-01-01 00:00:00' AS updated_at \
         FROM range(1, 4) t(i)",
    );
}

#[test]
fn test_renamed_column_is_not_drift_under_fail() {
    let project = TestProject::new();
    seed_people(&project);
    let yaml = people_dim("fail");
    let sql = "SELECT name, full_email FROM people";

    assert_eq!(project.materialize("dim_people", sql, &yaml), MaterializeOutcome::FullLoad);
    assert_eq!(columns(&project, "dim_people"), vec!["id", "name", "email"]);
    assert_eq!(
        project.materialize("dim_people", sql, &yaml),
        MaterializeOutcome::Incremental { strategy: Strategy::Merge }
    );
    assert_eq!(project.count("dim_people"), 3);
}

#[test]
fn test_sync_all_columns_keeps_renamed_column() {
    let project = TestProject::new();
    seed_people(&project);
    let yaml = people_dim("sync_all_columns");
    let sql = "SELECT name, full_email FROM people";
    project.materialize("dim_people", sql, &yaml);

    project.exec("INSERT INTO people VALUES ('p9', 'p9@example.com', TIMESTAMP '2999-01-02 00:00:00')");
    assert_eq!(
        project.materialize("dim_people", sql, &yaml),
        MaterializeOutcome::Incremental { strategy: Strategy::Merge }
    );
    assert_eq!(columns(&project, "dim_people"), vec!["id", "name", "email"]);
    assert_eq!(project.count("dim_people"), 4);
    assert_eq!(
        project.scalar("SELECT email FROM dim_people WHERE name = 'p9'").as_deref(),
        Some("p9@example.com")
    );
    assert_eq!(
        project.scalar("SELECT COUNT(*) FROM dim_people WHERE email IS NULL").as_deref(),
        Some("0")
    );
}

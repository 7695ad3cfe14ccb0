#![allow(dead_code)]

use std::sync::Once;
use trex_materialize::{
    Adapter, DuckDbAdapter, Logger, MaterializationHandler, MaterializationKind,
    MaterializeOutcome, ModelMetadata, StateManager,
};

static INIT: Once = Once::new();

/// Initialize logging once per test binary; `RUST_LOG` controls verbosity.
pub fn init_test_env() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// In-memory warehouse plus an in-memory state store.
pub struct TestProject {
    pub db: DuckDbAdapter,
    pub state: StateManager,
}

impl TestProject {
    pub fn new() -> Self {
        init_test_env();
        Self {
            db: DuckDbAdapter::in_memory().expect("Failed to open DuckDB"),
            state: StateManager::in_memory(Logger::default()),
        }
    }

    pub fn exec(&self, sql: &str) {
        if let Err(e) = self.db.execute(sql) {
            panic!("SQL failed: {sql}\nError: {e}");
        }
    }

    pub fn scalar(&self, sql: &str) -> Option<String> {
        let rows = self.db.query(sql).unwrap_or_else(|e| panic!("query failed: {sql}\n{e}"));
        rows.first().and_then(|r| r.get(0)).map(str::to_string)
    }

    pub fn count(&self, table: &str) -> i64 {
        self.scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1)
    }

    /// `(col0, col1)` of every row, ordered by the first column.
    pub fn pairs(&self, sql: &str) -> Vec<(String, String)> {
        self.db
            .query(sql)
            .unwrap_or_else(|e| panic!("query failed: {sql}\n{e}"))
            .iter()
            .map(|r| {
                (
                    r.get(0).unwrap_or("NULL").to_string(),
                    r.get(1).unwrap_or("NULL").to_string(),
                )
            })
            .collect()
    }

    pub fn materialize(&self, name: &str, sql: &str, yaml: &str) -> MaterializeOutcome {
        let metadata = ModelMetadata::from_yaml(name, yaml).expect("Invalid model metadata");
        MaterializationHandler::new(&self.db, &self.state, Logger::default())
            .materialize(name, sql, MaterializationKind::Incremental, &metadata)
            .unwrap_or_else(|e| panic!("materialize {name} failed: {e}"))
    }

    pub fn try_materialize(&self, name: &str, sql: &str, yaml: &str) -> trex_materialize::Result<MaterializeOutcome> {
        let metadata = ModelMetadata::from_yaml(name, yaml)?;
        MaterializationHandler::new(&self.db, &self.state, Logger::default())
            .materialize(name, sql, MaterializationKind::Incremental, &metadata)
    }
}

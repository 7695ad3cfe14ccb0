//! Incremental materialization core for trexsql transform models.
//!
//! `MaterializationHandler::materialize` is the entry point: it decides between
//! a full and an incremental load, rewrites auto-incremental columns, reconciles
//! schema drift and records per-model state.

pub mod adapter;
pub mod chunk;
pub mod config;
pub mod error;
pub mod incremental;
pub mod logging;
pub mod materialize;
pub mod project;
pub mod schema;
pub mod schema_change;
pub mod sql;
pub mod state;
pub mod wrapper;

pub use adapter::{Adapter, Capabilities, DuckDbAdapter, QueryRow, TableInfo};
pub use config::Settings;
pub use error::{Error, Result};
pub use incremental::IncrementalExecutor;
pub use logging::Logger;
pub use materialize::{MaterializationHandler, MaterializeOutcome};
pub use project::{
    ColumnSpec, IncrementalConfig, MaterializationKind, ModelMetadata, SchemaChangePolicy,
    StartValue, Strategy,
};
pub use schema::{ColumnInfo, SchemaComparator, SchemaDiff};
pub use schema_change::{SchemaChangeHandler, SchemaChangeOutcome};
pub use sql::SqlRewriter;
pub use state::{ModelState, StateManager};
pub use wrapper::AutoIncrementalWrapper;

// ── SQL Helpers ──────────────────────────────────────────────────────────────

pub fn escape_sql_ident(s: &str) -> String {
    s.replace('"', "\"\"")
}

pub fn escape_sql_str(s: &str) -> String {
    s.replace('\'', "''")
}

pub fn quote_ident(s: &str) -> String {
    format!("\"{}\"", escape_sql_ident(s))
}

/// Quote each dot-separated part of `name`: `raw.events` -> `"raw"."events"`.
pub fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(|part| quote_ident(part.trim_matches('"')))
        .collect::<Vec<_>>()
        .join(".")
}

/// Split `schema.table` into its schema (if any) and relation name.
pub fn split_qualified(name: &str) -> (Option<&str>, &str) {
    match name.rsplit_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, name),
    }
}

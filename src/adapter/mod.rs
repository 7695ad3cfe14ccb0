//! Capability interface over a warehouse connection.
//!
//! Required methods cover what every backend can do. Optional methods default
//! to `Error::Unsupported`; components read `capabilities()` once when they are
//! constructed and branch on that instead of probing per call.

pub mod duckdb;

use crate::error::{Error, Result};
use crate::project::{ExternalConfig, ModelMetadata};
use crate::schema::ColumnInfo;
use crate::{quote_ident, quote_qualified};
use std::collections::HashSet;

pub use self::duckdb::DuckDbAdapter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub incremental_append: bool,
    pub incremental_merge: bool,
    pub incremental_delete_insert: bool,
    pub describe_query_schema: bool,
    pub qualify_object_name: bool,
    pub add_column: bool,
    pub drop_column: bool,
    pub materialized_views: bool,
    pub external_tables: bool,
    pub comments: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Capabilities {
            incremental_append: true,
            incremental_merge: true,
            incremental_delete_insert: true,
            describe_query_schema: true,
            qualify_object_name: true,
            add_column: true,
            drop_column: true,
            materialized_views: true,
            external_tables: true,
            comments: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableInfo {
    pub schema: Vec<ColumnInfo>,
    pub row_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub columns: Vec<Option<String>>,
}

impl QueryRow {
    pub fn get(&self, idx: usize) -> Option<&str> {
        self.columns.get(idx).and_then(|c| c.as_deref())
    }
}

fn unsupported<T>(capability: &'static str) -> Result<T> {
    Err(Error::Unsupported { capability })
}

pub trait Adapter {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    fn table_exists(&self, name: &str) -> Result<bool>;

    /// Create (or replace) `name` from the result of `sql`.
    fn create_table(&self, name: &str, sql: &str, metadata: Option<&ModelMetadata>) -> Result<()>;

    fn create_view(&self, name: &str, sql: &str) -> Result<()>;

    fn drop_table(&self, name: &str) -> Result<()>;

    fn drop_view(&self, name: &str) -> Result<()>;

    fn get_table_info(&self, name: &str) -> Result<TableInfo>;

    fn execute(&self, sql: &str) -> Result<()>;

    fn query(&self, sql: &str) -> Result<Vec<QueryRow>>;

    fn execute_incremental_append(&self, _table: &str, _sql: &str) -> Result<()> {
        unsupported("execute_incremental_append")
    }

    /// Upsert rows of `sql` into `table`, matching on every `unique_key` column.
    fn execute_incremental_merge(&self, _table: &str, _sql: &str, _unique_key: &[String]) -> Result<()> {
        unsupported("execute_incremental_merge")
    }

    fn execute_incremental_delete_insert(
        &self,
        _table: &str,
        _delete_condition: &str,
        _sql: &str,
    ) -> Result<()> {
        unsupported("execute_incremental_delete_insert")
    }

    /// Result shape of `sql` without materializing rows.
    fn describe_query_schema(&self, _sql: &str) -> Result<Vec<ColumnInfo>> {
        unsupported("describe_query_schema")
    }

    /// Fully qualified, quoted relation name ready to splice into SQL.
    fn qualify_object_name(&self, _name: &str) -> Result<String> {
        unsupported("qualify_object_name")
    }

    fn add_column(&self, _table: &str, _column: &ColumnInfo) -> Result<()> {
        unsupported("add_column")
    }

    fn drop_column(&self, _table: &str, _column: &str) -> Result<()> {
        unsupported("drop_column")
    }

    fn create_materialized_view(&self, _name: &str, _sql: &str) -> Result<()> {
        unsupported("create_materialized_view")
    }

    fn create_external_table(&self, _name: &str, _external: &ExternalConfig) -> Result<()> {
        unsupported("create_external_table")
    }

    fn set_comment(&self, _name: &str, _comment: &str) -> Result<()> {
        unsupported("set_comment")
    }
}

/// Columns of `sql` that `table` also has, in query order.
///
/// `None` when the adapter cannot describe the query. Columns the query gained
/// since the table was built are left out so inserts survive an ignored drift.
pub fn insertable_columns(adapter: &dyn Adapter, table: &str, sql: &str) -> Result<Option<Vec<String>>> {
    if !adapter.capabilities().describe_query_schema {
        return Ok(None);
    }
    let source = adapter.describe_query_schema(sql)?;
    if source.is_empty() {
        return Ok(None);
    }
    let existing: HashSet<String> = adapter
        .get_table_info(table)?
        .schema
        .into_iter()
        .map(|c| c.name.to_lowercase())
        .collect();
    let columns: Vec<String> = source
        .into_iter()
        .map(|c| c.name)
        .filter(|c| existing.contains(&c.to_lowercase()))
        .collect();
    if columns.is_empty() {
        return Err(Error::config(table, "query shares no columns with the destination"));
    }
    Ok(Some(columns))
}

/// `INSERT INTO table` from `sql`, naming only the table's existing columns.
pub fn insert_statement(adapter: &dyn Adapter, table: &str, sql: &str) -> Result<String> {
    let target = quote_qualified(table);
    Ok(match insertable_columns(adapter, table, sql)? {
        Some(columns) => {
            let list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
            format!("INSERT INTO {target} ({list}) SELECT {list} FROM ({sql}) AS __src__")
        }
        None => format!("INSERT INTO {target} {sql}"),
    })
}

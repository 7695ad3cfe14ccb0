use crate::adapter::{Adapter, Capabilities};
use crate::error::Result;
use crate::logging::Logger;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: &str, data_type: &str) -> Self {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
        }
    }
}

impl fmt::Display for ColumnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.data_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMismatch {
    pub column: String,
    pub table_type: String,
    pub query_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    /// Projected by the query, absent from the table.
    pub new_columns: Vec<ColumnInfo>,
    /// Present in the table, no longer projected by the query.
    pub missing_columns: Vec<ColumnInfo>,
    pub type_mismatches: Vec<TypeMismatch>,
    pub has_changes: bool,
}

impl fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes {
            return f.write_str("no changes");
        }
        let mut parts = Vec::new();
        if !self.new_columns.is_empty() {
            parts.push(format!(
                "new columns: {}",
                self.new_columns.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(", ")
            ));
        }
        if !self.missing_columns.is_empty() {
            parts.push(format!(
                "missing columns: {}",
                self.missing_columns.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(", ")
            ));
        }
        if !self.type_mismatches.is_empty() {
            parts.push(format!(
                "type mismatches: {}",
                self.type_mismatches
                    .iter()
                    .map(|m| format!("{} ({} -> {})", m.column, m.table_type, m.query_type))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        f.write_str(&parts.join("; "))
    }
}

/// Collapse dialect spellings of the same type, dropping length/precision.
///
/// `VARCHAR(255)` -> `VARCHAR`, `INT8` -> `BIGINT`, `DECIMAL(10,2)` -> `DECIMAL`,
/// `TIMESTAMP_NTZ` -> `TIMESTAMP`.
pub fn canonical_type(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    let base = match upper.find('(') {
        Some(pos) => {
            // keep anything after the closing paren, e.g. `TIMESTAMP(3) WITH TIME ZONE`
            let tail = upper[pos..].find(')').map(|end| &upper[pos + end + 1..]).unwrap_or("");
            format!("{}{}", &upper[..pos], tail)
        }
        None => upper,
    };
    let base = base.split_whitespace().collect::<Vec<_>>().join(" ");

    if base.starts_with("TIMESTAMP") || base == "DATETIME" {
        return "TIMESTAMP".to_string();
    }
    match base.as_str() {
        "INT" | "INT4" | "INTEGER" | "SIGNED" => "INTEGER",
        "INT8" | "BIGINT" | "LONG" => "BIGINT",
        "INT2" | "SMALLINT" | "SHORT" => "SMALLINT",
        "INT1" | "TINYINT" => "TINYINT",
        "FLOAT" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" => "DOUBLE",
        "FLOAT4" | "REAL" => "REAL",
        "CHAR" | "TEXT" | "STRING" | "VARCHAR" | "BPCHAR" | "NVARCHAR" | "NCHAR"
        | "CHARACTER" | "CHARACTER VARYING" => "VARCHAR",
        "NUMERIC" | "DECIMAL" | "NUMBER" => "DECIMAL",
        "BOOL" | "BOOLEAN" | "LOGICAL" => "BOOLEAN",
        other => return other.to_string(),
    }
    .to_string()
}

/// Compare a query's projected schema with a table's, case-insensitively by name.
pub fn compare_schemas(query: &[ColumnInfo], table: &[ColumnInfo]) -> SchemaDiff {
    let table_by_name: HashMap<String, &ColumnInfo> =
        table.iter().map(|c| (c.name.to_lowercase(), c)).collect();
    let query_by_name: HashMap<String, &ColumnInfo> =
        query.iter().map(|c| (c.name.to_lowercase(), c)).collect();

    let mut diff = SchemaDiff::default();
    for col in query {
        match table_by_name.get(&col.name.to_lowercase()) {
            None => diff.new_columns.push(col.clone()),
            Some(existing) => {
                if canonical_type(&existing.data_type) != canonical_type(&col.data_type) {
                    diff.type_mismatches.push(TypeMismatch {
                        column: existing.name.clone(),
                        table_type: existing.data_type.clone(),
                        query_type: col.data_type.clone(),
                    });
                }
            }
        }
    }
    for col in table {
        if !query_by_name.contains_key(&col.name.to_lowercase()) {
            diff.missing_columns.push(col.clone());
        }
    }
    diff.has_changes = !diff.new_columns.is_empty()
        || !diff.missing_columns.is_empty()
        || !diff.type_mismatches.is_empty();
    diff
}

pub struct SchemaComparator<'a> {
    adapter: &'a dyn Adapter,
    capabilities: Capabilities,
    logger: Logger,
}

impl<'a> SchemaComparator<'a> {
    pub fn new(adapter: &'a dyn Adapter, logger: Logger) -> Self {
        SchemaComparator {
            adapter,
            capabilities: adapter.capabilities(),
            logger: logger.with_category("schema"),
        }
    }

    /// Result shape of `sql`; empty when the adapter cannot describe queries.
    pub fn infer_query_schema(&self, sql: &str) -> Vec<ColumnInfo> {
        if !self.capabilities.describe_query_schema {
            self.logger.debug(&format!(
                "{} adapter cannot describe queries, returning empty schema",
                self.adapter.name()
            ));
            return Vec::new();
        }
        match self.adapter.describe_query_schema(sql) {
            Ok(cols) => cols,
            Err(e) => {
                self.logger.warn(&format!("could not infer query schema: {e}"));
                Vec::new()
            }
        }
    }

    pub fn get_table_schema(&self, name: &str) -> Result<Vec<ColumnInfo>> {
        Ok(self.adapter.get_table_info(name)?.schema)
    }

    pub fn compare_schemas(&self, query: &[ColumnInfo], table: &[ColumnInfo]) -> SchemaDiff {
        compare_schemas(query, table)
    }

    /// Diff between `sql`'s projection and the current `table`.
    ///
    /// `None` when the query shape is unknown; an empty inference must never be
    /// read as "every column was removed".
    pub fn diff_query_against_table(&self, sql: &str, table: &str) -> Result<Option<SchemaDiff>> {
        let query_schema = self.infer_query_schema(sql);
        if query_schema.is_empty() {
            return Ok(None);
        }
        let table_schema = self.get_table_schema(table)?;
        Ok(Some(compare_schemas(&query_schema, &table_schema)))
    }
}

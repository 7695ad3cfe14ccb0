use super::{insert_statement, Adapter, Capabilities, QueryRow, TableInfo};
use crate::error::{Error, Result};
use crate::project::{ExternalConfig, ModelMetadata};
use crate::schema::ColumnInfo;
use crate::{escape_sql_ident, escape_sql_str, quote_ident, quote_qualified, split_qualified};
use ::duckdb::types::{TimeUnit, Value};
use ::duckdb::Connection;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Reference adapter over an embedded DuckDB connection.
pub struct DuckDbAdapter {
    conn: Mutex<Connection>,
    default_schema: String,
}

impl DuckDbAdapter {
    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        DuckDbAdapter {
            conn: Mutex::new(conn),
            default_schema: "main".to_string(),
        }
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::State("DuckDB connection mutex poisoned".into()))
    }

    fn schema_and_table<'a>(&'a self, name: &'a str) -> (&'a str, &'a str) {
        match split_qualified(name) {
            (Some(schema), table) => (schema, table),
            (None, table) => (self.default_schema.as_str(), table),
        }
    }

    fn ensure_schema(&self, name: &str) -> Result<()> {
        if let (Some(schema), _) = split_qualified(name) {
            self.execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS \"{}\"",
                escape_sql_ident(schema)
            ))?;
        }
        Ok(())
    }

    fn describe(&self, sql: &str) -> Result<Vec<ColumnInfo>> {
        let rows = self.query(&format!("DESCRIBE SELECT * FROM ({sql}) AS __describe__"))?;
        Ok(rows
            .iter()
            .filter_map(|r| Some(ColumnInfo::new(r.get(0)?, r.get(1).unwrap_or(""))))
            .collect())
    }

    /// Runs `statements` in one transaction, rolling back on the first failure.
    fn in_transaction(&self, statements: &[String]) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch("BEGIN TRANSACTION")?;
        for stmt in statements {
            if let Err(e) = conn.execute_batch(stmt) {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e.into());
            }
        }
        conn.execute_batch("COMMIT")?;
        Ok(())
    }
}

impl Adapter for DuckDbAdapter {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            materialized_views: false,
            ..Capabilities::all()
        }
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let (schema, table) = self.schema_and_table(name);
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = ? AND table_name = ?",
            ::duckdb::params![schema, table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn create_table(&self, name: &str, sql: &str, _metadata: Option<&ModelMetadata>) -> Result<()> {
        self.ensure_schema(name)?;
        self.execute(&format!(
            "CREATE OR REPLACE TABLE {} AS {sql}",
            quote_qualified(name)
        ))
    }

    fn create_view(&self, name: &str, sql: &str) -> Result<()> {
        self.ensure_schema(name)?;
        self.execute(&format!(
            "CREATE OR REPLACE VIEW {} AS {sql}",
            quote_qualified(name)
        ))
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        self.execute(&format!("DROP TABLE IF EXISTS {}", quote_qualified(name)))
    }

    fn drop_view(&self, name: &str) -> Result<()> {
        self.execute(&format!("DROP VIEW IF EXISTS {}", quote_qualified(name)))
    }

    fn get_table_info(&self, name: &str) -> Result<TableInfo> {
        let (schema, table) = self.schema_and_table(name);
        let rows = self.query(&format!(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = '{}' AND table_name = '{}' ORDER BY ordinal_position",
            escape_sql_str(schema),
            escape_sql_str(table)
        ))?;
        let columns = rows
            .iter()
            .filter_map(|r| Some(ColumnInfo::new(r.get(0)?, r.get(1).unwrap_or(""))))
            .collect();
        let count_rows = self.query(&format!("SELECT COUNT(*) FROM {}", quote_qualified(name)))?;
        let row_count = count_rows
            .first()
            .and_then(|r| r.get(0))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(TableInfo {
            schema: columns,
            row_count,
        })
    }

    fn execute(&self, sql: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    fn query(&self, sql: &str) -> Result<Vec<QueryRow>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows_iter = stmt.query([])?;
        let column_count = rows_iter.as_ref().map_or(0, |s| s.column_count());

        let mut rows = Vec::new();
        while let Some(row) = rows_iter.next()? {
            let mut columns = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let val = row.get_ref(i).map(|v| v.to_owned()).unwrap_or(Value::Null);
                columns.push(value_to_string(&val));
            }
            rows.push(QueryRow { columns });
        }
        Ok(rows)
    }

    fn execute_incremental_append(&self, table: &str, sql: &str) -> Result<()> {
        self.execute(&insert_statement(self, table, sql)?)
    }

    fn execute_incremental_merge(&self, table: &str, sql: &str, unique_key: &[String]) -> Result<()> {
        let target = quote_qualified(table);
        let (_, bare) = split_qualified(table);
        let staging = quote_ident(&format!("__staging_{bare}__"));

        self.execute(&format!("CREATE OR REPLACE TEMPORARY TABLE {staging} AS {sql}"))?;

        let target_ref = quote_ident(bare);
        let result: Result<()> = (|| {
            let staged: Vec<String> = self
                .describe(&format!("SELECT * FROM {staging}"))?
                .into_iter()
                .map(|c| c.name)
                .collect();
            let existing: HashSet<String> = self
                .get_table_info(table)?
                .schema
                .into_iter()
                .map(|c| c.name.to_lowercase())
                .collect();
            let keys: HashSet<String> = unique_key.iter().map(|k| k.to_lowercase()).collect();
            let columns: Vec<&String> = staged
                .iter()
                .filter(|c| existing.contains(&c.to_lowercase()))
                .collect();

            let key_match = |left: &str, right: &str| -> String {
                unique_key
                    .iter()
                    .map(|k| {
                        let qk = quote_ident(k);
                        format!("{left}.{qk} = {right}.{qk}")
                    })
                    .collect::<Vec<_>>()
                    .join(" AND ")
            };

            let mut statements = Vec::new();
            let set_clause: Vec<String> = columns
                .iter()
                .filter(|c| !keys.contains(&c.to_lowercase()))
                .map(|c| {
                    let qc = quote_ident(c);
                    format!("{qc} = __stg__.{qc}")
                })
                .collect();
            if !set_clause.is_empty() {
                statements.push(format!(
                    "UPDATE {target} SET {} FROM {staging} AS __stg__ WHERE {}",
                    set_clause.join(", "),
                    key_match(&target_ref, "__stg__")
                ));
            }

            let col_list = columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            statements.push(format!(
                "INSERT INTO {target} ({col_list}) \
                 SELECT {col_list} FROM {staging} AS __stg__ \
                 WHERE NOT EXISTS (SELECT 1 FROM {target} WHERE {})",
                key_match(&target_ref, "__stg__")
            ));
            self.in_transaction(&statements)
        })();

        let _ = self.execute(&format!("DROP TABLE IF EXISTS {staging}"));
        result
    }

    fn execute_incremental_delete_insert(
        &self,
        table: &str,
        delete_condition: &str,
        sql: &str,
    ) -> Result<()> {
        let insert = insert_statement(self, table, sql)?;
        self.in_transaction(&[
            format!("DELETE FROM {} WHERE {delete_condition}", quote_qualified(table)),
            insert,
        ])
    }

    fn describe_query_schema(&self, sql: &str) -> Result<Vec<ColumnInfo>> {
        self.describe(sql)
    }

    fn qualify_object_name(&self, name: &str) -> Result<String> {
        let (schema, table) = self.schema_and_table(name);
        Ok(format!("{}.{}", quote_ident(schema), quote_ident(table)))
    }

    fn add_column(&self, table: &str, column: &ColumnInfo) -> Result<()> {
        self.execute(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_qualified(table),
            quote_ident(&column.name),
            column.data_type
        ))
    }

    fn drop_column(&self, table: &str, column: &str) -> Result<()> {
        self.execute(&format!(
            "ALTER TABLE {} DROP COLUMN {}",
            quote_qualified(table),
            quote_ident(column)
        ))
    }

    fn create_external_table(&self, name: &str, external: &ExternalConfig) -> Result<()> {
        let location = escape_sql_str(&external.location);
        let reader = match external.format.as_deref().map(|f| f.to_lowercase()) {
            Some(f) if f == "parquet" => format!("read_parquet('{location}')"),
            Some(f) if f == "csv" => format!("read_csv_auto('{location}')"),
            Some(f) if f == "json" => format!("read_json_auto('{location}')"),
            _ => format!("'{location}'"),
        };
        self.create_view(name, &format!("SELECT * FROM {reader}"))
    }

    fn set_comment(&self, name: &str, comment: &str) -> Result<()> {
        let target = quote_qualified(name);
        let comment = escape_sql_str(comment);
        self.execute(&format!("COMMENT ON TABLE {target} IS '{comment}'"))
            .or_else(|_| self.execute(&format!("COMMENT ON VIEW {target} IS '{comment}'")))
    }
}

fn timestamp_micros(unit: TimeUnit, v: i64) -> i64 {
    match unit {
        TimeUnit::Second => v.saturating_mul(1_000_000),
        TimeUnit::Millisecond => v.saturating_mul(1_000),
        TimeUnit::Microsecond => v,
        TimeUnit::Nanosecond => v / 1_000,
    }
}

fn value_to_string(v: &Value) -> Option<String> {
    let s = match v {
        Value::Null => return None,
        Value::Boolean(b) => b.to_string(),
        Value::TinyInt(i) => i.to_string(),
        Value::SmallInt(i) => i.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::HugeInt(i) => i.to_string(),
        Value::UTinyInt(i) => i.to_string(),
        Value::USmallInt(i) => i.to_string(),
        Value::UInt(i) => i.to_string(),
        Value::UBigInt(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Double(f) => f.to_string(),
        Value::Decimal(d) => format!("{d}"),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => hex::encode(b),
        Value::Timestamp(unit, t) => {
            match chrono::DateTime::from_timestamp_micros(timestamp_micros(*unit, *t)) {
                Some(dt) => dt.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string(),
                None => t.to_string(),
            }
        }
        Value::Date32(d) => match chrono::NaiveDate::from_num_days_from_ce_opt(*d + 719_163) {
            Some(date) => date.format("%Y-%m-%d").to_string(),
            None => d.to_string(),
        },
        Value::Time64(_, t) => t.to_string(),
        _ => format!("{v:?}"),
    };
    Some(s)
}

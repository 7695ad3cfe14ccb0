use crate::adapter::{Adapter, Capabilities};
use crate::chunk::{substitute_placeholders, ChunkParameter, EndValue, ParamValue, MAX_CHUNKS};
use crate::error::{Error, Result};
use crate::logging::Logger;
use crate::project::{ModelMetadata, SchemaChangePolicy};
use crate::schema::{ColumnInfo, SchemaComparator, SchemaDiff};
use crate::sql::SqlRewriter;
use crate::wrapper::{map_columns, AutoIncrementalWrapper};
use crate::{quote_ident, quote_qualified};
use std::cmp::Ordering;

/// Loads the schema change handler delegates to when a policy rebuilds data.
pub trait RefreshRunner {
    /// Populate the (dropped) destination from the full query.
    fn full_load(&mut self, sql: &str) -> Result<()>;

    /// One incremental iteration over a chunk. `values` holds the placeholder
    /// substitutions already applied to `sql`, for templated delete conditions.
    fn run_chunk(&mut self, sql: &str, values: &[(String, String)]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChangeOutcome {
    /// No drift, or the query shape could not be inferred.
    Unchanged,
    Ignored(SchemaDiff),
    ColumnsAdded(Vec<String>),
    ColumnsSynced {
        added: Vec<String>,
        dropped: Vec<String>,
    },
    FullRefreshed,
    Backfilled { chunks: usize },
    RecreatedEmpty,
}

impl SchemaChangeOutcome {
    /// The destination was repopulated and the regular incremental run must be skipped.
    pub fn replaced_data(&self) -> bool {
        matches!(
            self,
            SchemaChangeOutcome::FullRefreshed | SchemaChangeOutcome::Backfilled { .. }
        )
    }
}

pub struct SchemaChangeHandler<'a> {
    adapter: &'a dyn Adapter,
    capabilities: Capabilities,
    comparator: SchemaComparator<'a>,
    wrapper: AutoIncrementalWrapper<'a>,
    rewriter: SqlRewriter,
    logger: Logger,
}

impl<'a> SchemaChangeHandler<'a> {
    pub fn new(adapter: &'a dyn Adapter, logger: Logger) -> Self {
        SchemaChangeHandler {
            adapter,
            capabilities: adapter.capabilities(),
            comparator: SchemaComparator::new(adapter, logger.clone()),
            wrapper: AutoIncrementalWrapper::new(adapter, logger.clone()),
            rewriter: SqlRewriter::new(logger.clone()),
            logger: logger.with_category("schema_change"),
        }
    }

    /// Diff `sql` against the existing destination `model`.
    ///
    /// Chunk placeholders are filled with their start values first, and the
    /// auto-incremental column is never reported as missing. When the wrapper
    /// builds that column, query columns are compared under the destination
    /// names it maps them to.
    pub fn detect(&self, model: &str, sql: &str, metadata: &ModelMetadata) -> Result<Option<SchemaDiff>> {
        let first_chunk = self.first_chunk_sql(sql, &metadata.full_incremental_refresh);
        let mut query_schema = self.comparator.infer_query_schema(&first_chunk);
        if query_schema.is_empty() {
            return Ok(None);
        }
        let table_schema = self.comparator.get_table_schema(model)?;

        let auto = metadata.auto_incremental_column(model)?;
        if let Some(auto) = auto {
            let projects_auto = query_schema
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&auto.name));
            if !projects_auto {
                self.rename_mapped(model, &auto.name, &mut query_schema, &table_schema);
            }
        }

        let mut diff = self.comparator.compare_schemas(&query_schema, &table_schema);
        if let Some(auto) = auto {
            diff.missing_columns
                .retain(|c| !c.name.eq_ignore_ascii_case(&auto.name));
            diff.type_mismatches
                .retain(|m| !m.column.eq_ignore_ascii_case(&auto.name));
            diff.has_changes = !diff.new_columns.is_empty()
                || !diff.missing_columns.is_empty()
                || !diff.type_mismatches.is_empty();
        }
        Ok(Some(diff))
    }

    /// Rename query columns to the destination columns the wrapper feeds them into.
    fn rename_mapped(&self, model: &str, auto: &str, query: &mut [ColumnInfo], table: &[ColumnInfo]) {
        let source: Vec<String> = query.iter().map(|c| c.name.clone()).collect();
        let target: Vec<String> = table
            .iter()
            .filter(|c| !c.name.eq_ignore_ascii_case(auto))
            .map(|c| c.name.clone())
            .collect();
        let mapping = match map_columns(model, &source, &target) {
            Ok(mapping) => mapping,
            Err(e) => {
                // the wrapper rejects the same shape when the run starts
                self.logger.scoped(model).debug(&format!("comparing unmapped columns: {e}"));
                return;
            }
        };
        for (column, m) in query.iter_mut().zip(mapping) {
            if column.name != m.target {
                self.logger
                    .scoped(model)
                    .debug(&format!("query column {} maps to {}", column.name, m.target));
                column.name = m.target;
            }
        }
    }

    /// Reconcile the destination with `sql` under the model's `on_schema_change` policy.
    pub fn handle(
        &self,
        model: &str,
        sql: &str,
        metadata: &ModelMetadata,
        runner: &mut dyn RefreshRunner,
    ) -> Result<SchemaChangeOutcome> {
        let logger = self.logger.scoped(model);
        let policy = metadata.on_schema_change;

        let diff = match self.detect(model, sql, metadata)? {
            Some(diff) if diff.has_changes => diff,
            Some(_) => return Ok(SchemaChangeOutcome::Unchanged),
            None => {
                logger.debug("query schema unavailable, skipping schema reconciliation");
                return Ok(SchemaChangeOutcome::Unchanged);
            }
        };
        logger.info(&format!("schema change detected ({diff}), applying {}", policy.as_str()));

        match policy {
            SchemaChangePolicy::Fail => Err(Error::SchemaDrift {
                model: model.to_string(),
                diff,
            }),
            SchemaChangePolicy::Ignore => {
                logger.info("on_schema_change=ignore, leaving destination as is");
                Ok(SchemaChangeOutcome::Ignored(diff))
            }
            SchemaChangePolicy::AppendNewColumns => {
                let added = self.add_columns(model, &diff.new_columns, &logger)?;
                Ok(SchemaChangeOutcome::ColumnsAdded(added))
            }
            SchemaChangePolicy::SyncAllColumns => {
                let added = self.add_columns(model, &diff.new_columns, &logger)?;
                let dropped = self.drop_columns(model, &diff.missing_columns, &logger)?;
                for m in &diff.type_mismatches {
                    logger.warn(&format!(
                        "column {} changed type {} -> {}; existing column kept",
                        m.column, m.table_type, m.query_type
                    ));
                }
                Ok(SchemaChangeOutcome::ColumnsSynced { added, dropped })
            }
            SchemaChangePolicy::FullRefresh if !metadata.full_incremental_refresh.is_empty() => {
                logger.info("query is chunk-templated, rebuilding chunk by chunk");
                let chunks = self.rebuild_in_chunks(model, sql, metadata, runner)?;
                Ok(SchemaChangeOutcome::Backfilled { chunks })
            }
            SchemaChangePolicy::FullRefresh => {
                self.adapter.drop_table(model)?;
                runner.full_load(sql)?;
                logger.info("destination rebuilt from full query");
                Ok(SchemaChangeOutcome::FullRefreshed)
            }
            SchemaChangePolicy::FullIncrementalRefresh => {
                let chunks = self.rebuild_in_chunks(model, sql, metadata, runner)?;
                Ok(SchemaChangeOutcome::Backfilled { chunks })
            }
            SchemaChangePolicy::RecreateEmpty => {
                let first_chunk = self.first_chunk_sql(sql, &metadata.full_incremental_refresh);
                self.recreate_empty(model, &first_chunk, metadata)?;
                Ok(SchemaChangeOutcome::RecreatedEmpty)
            }
        }
    }

    /// Recreate `model` empty and replay `sql` over its chunk parameters.
    pub fn rebuild_in_chunks(
        &self,
        model: &str,
        sql: &str,
        metadata: &ModelMetadata,
        runner: &mut dyn RefreshRunner,
    ) -> Result<usize> {
        let first_chunk = self.first_chunk_sql(sql, &metadata.full_incremental_refresh);
        self.recreate_empty(model, &first_chunk, metadata)?;
        self.backfill(model, sql, &metadata.full_incremental_refresh, runner)
    }

    fn first_chunk_sql(&self, sql: &str, params: &[ChunkParameter]) -> String {
        if params.is_empty() {
            return sql.to_string();
        }
        let mut values = Vec::with_capacity(params.len() * 2);
        for p in params {
            let upper = p.start.advance(&p.step).unwrap_or_else(|_| p.start.clone());
            values.push((p.name.clone(), p.start.render()));
            values.push((format!("{}_end", p.name), upper.render()));
        }
        substitute_placeholders(sql, &values)
    }

    fn add_columns(&self, model: &str, columns: &[ColumnInfo], logger: &Logger) -> Result<Vec<String>> {
        let mut added = Vec::with_capacity(columns.len());
        for col in columns {
            if self.capabilities.add_column {
                self.adapter.add_column(model, col)?;
            } else {
                self.adapter.execute(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote_qualified(model),
                    quote_ident(&col.name),
                    col.data_type
                ))?;
            }
            logger.info(&format!("added column {col}"));
            added.push(col.name.clone());
        }
        Ok(added)
    }

    fn drop_columns(&self, model: &str, columns: &[ColumnInfo], logger: &Logger) -> Result<Vec<String>> {
        let mut dropped = Vec::with_capacity(columns.len());
        for col in columns {
            logger.warn(&format!(
                "dropping column {col}; its data will be lost"
            ));
            if self.capabilities.drop_column {
                self.adapter.drop_column(model, &col.name)?;
            } else {
                self.adapter.execute(&format!(
                    "ALTER TABLE {} DROP COLUMN {}",
                    quote_qualified(model),
                    quote_ident(&col.name)
                ))?;
            }
            dropped.push(col.name.clone());
        }
        Ok(dropped)
    }

    /// Drop `model` and recreate it with the query's shape and no rows.
    fn recreate_empty(&self, model: &str, sql: &str, metadata: &ModelMetadata) -> Result<()> {
        self.adapter.drop_table(model)?;
        let shape = if self.wrapper.should_wrap(metadata) {
            self.wrapper.wrap(model, sql, metadata, None)?
        } else {
            sql.to_string()
        };
        self.adapter.create_table(
            model,
            &format!("SELECT * FROM ({shape}) AS __empty__ WHERE 1 = 0"),
            Some(metadata),
        )?;
        self.logger.scoped(model).info("destination recreated empty");
        Ok(())
    }

    /// Evaluate an end expression against the first table `sql` reads from.
    fn evaluate_end(&self, model: &str, sql: &str, param: &ChunkParameter, expr: &str) -> Result<ParamValue> {
        let tables = self.rewriter.table_references(sql);
        let Some(table) = tables.first() else {
            return Err(Error::config(
                model,
                format!(
                    "cannot evaluate end_value `{expr}` of parameter '{}': no source table found in the query",
                    param.name
                ),
            ));
        };
        let rows = self.adapter.query(&format!(
            "SELECT CAST(({expr}) AS VARCHAR) FROM {} LIMIT 1",
            quote_qualified(table)
        ))?;
        let raw = rows
            .first()
            .and_then(|r| r.get(0))
            .ok_or_else(|| {
                Error::config(
                    model,
                    format!("end_value `{expr}` of parameter '{}' evaluated to NULL on {table}", param.name),
                )
            })?;
        let value = ParamValue::parse(raw).ok_or_else(|| {
            Error::config(
                model,
                format!("end_value `{expr}` of parameter '{}' produced unusable value '{raw}'", param.name),
            )
        })?;
        if param.start.compare(&value).is_none() {
            return Err(Error::config(
                model,
                format!(
                    "end_value `{expr}` = {value} is not comparable with start {} of parameter '{}'",
                    param.start, param.name
                ),
            ));
        }
        self.logger
            .scoped(model)
            .debug(&format!("end_value `{expr}` of '{}' evaluated to {value}", param.name));
        Ok(value)
    }

    fn resolve_ends(&self, model: &str, sql: &str, params: &[ChunkParameter]) -> Result<Vec<ParamValue>> {
        let first_chunk = self.first_chunk_sql(sql, params);
        let mut ends = Vec::with_capacity(params.len());
        for param in params {
            ends.push(match &param.end {
                EndValue::Literal(v) => v.clone(),
                EndValue::Expression(expr) => self.evaluate_end(model, &first_chunk, param, expr)?,
            });
        }
        Ok(ends)
    }

    /// `sql` with every parameter spanning its whole range, for regular runs
    /// of a chunk-templated model.
    pub fn full_range_sql(&self, model: &str, sql: &str, params: &[ChunkParameter]) -> Result<String> {
        if params.is_empty() {
            return Ok(sql.to_string());
        }
        let ends = self.resolve_ends(model, sql, params)?;
        let mut values = Vec::with_capacity(params.len() * 2);
        for (param, end) in params.iter().zip(&ends) {
            values.push((param.name.clone(), param.start.render()));
            values.push((format!("{}_end", param.name), end.advance(&param.step)?.render()));
        }
        Ok(substitute_placeholders(sql, &values))
    }

    /// Replay `sql` chunk by chunk, each chunk committed before the next.
    pub fn backfill(
        &self,
        model: &str,
        sql: &str,
        params: &[ChunkParameter],
        runner: &mut dyn RefreshRunner,
    ) -> Result<usize> {
        let logger = self.logger.scoped(model);
        let mut current: Vec<ParamValue> = params.iter().map(|p| p.start.clone()).collect();

        let ends = self.resolve_ends(model, sql, params)?;

        let mut chunks = 0;
        loop {
            let pending = current
                .iter()
                .zip(&ends)
                .any(|(value, end)| value.compare(end) != Some(Ordering::Greater));
            if !pending {
                break;
            }
            if chunks >= MAX_CHUNKS {
                logger.warn(&format!(
                    "stopping backfill after {MAX_CHUNKS} chunks; remaining ranges were not loaded"
                ));
                break;
            }

            let mut next = Vec::with_capacity(params.len());
            for (param, value) in params.iter().zip(&current) {
                next.push(value.advance(&param.step)?);
            }
            let mut values = Vec::with_capacity(params.len() * 2);
            for ((param, value), upper) in params.iter().zip(&current).zip(&next) {
                values.push((param.name.clone(), value.render()));
                values.push((format!("{}_end", param.name), upper.render()));
            }

            let chunk_sql = substitute_placeholders(sql, &values);
            logger.debug(&format!("chunk {}: {chunk_sql}", chunks + 1));
            runner.run_chunk(&chunk_sql, &values)?;
            chunks += 1;
            current = next;
        }
        logger.info(&format!("backfill finished after {chunks} chunk(s)"));
        Ok(chunks)
    }
}

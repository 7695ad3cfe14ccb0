use crate::adapter::{insert_statement, insertable_columns, Adapter, Capabilities};
use crate::chunk::substitute_placeholders;
use crate::error::{Error, Result};
use crate::logging::Logger;
use crate::project::{IncrementalConfig, MaterializationKind, ModelMetadata, StartValue, Strategy};
use crate::schema_change::RefreshRunner;
use crate::sql::SqlRewriter;
use crate::state::{format_timestamp, StateManager};
use crate::wrapper::AutoIncrementalWrapper;
use crate::{escape_sql_str, quote_ident, quote_qualified, split_qualified};
use chrono::Utc;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;

const DEFAULT_WINDOW: &str = "INTERVAL '7 days'";

fn var_re() -> &'static Regex {
    static VAR_RE: OnceLock<Regex> = OnceLock::new();
    VAR_RE.get_or_init(|| {
        Regex::new(
            r#"\{\{\s*var\(\s*['"]([A-Za-z_][A-Za-z0-9_]*)['"]\s*\)\s*\}\}|\$\{([A-Za-z_][A-Za-z0-9_]*)\}"#,
        )
        .expect("valid var regex")
    })
}

/// Wrap bare `'YYYY-MM-DD'` literals in `CAST(... AS DATE)`.
pub fn add_date_casts(condition: &str) -> String {
    static DATE_RE: OnceLock<Regex> = OnceLock::new();
    let re = DATE_RE.get_or_init(|| {
        Regex::new(r"(?i)(\bDATE\s+|\bTIMESTAMP\s+|\bCAST\s*\(\s*)?'(\d{4}-\d{2}-\d{2})'")
            .expect("valid date literal regex")
    });
    re.replace_all(condition, |caps: &Captures| match caps.get(1) {
        Some(_) => caps[0].to_string(),
        None => format!("CAST('{}' AS DATE)", &caps[2]),
    })
    .into_owned()
}

/// Decides between full and incremental loads and runs the three strategies.
pub struct IncrementalExecutor<'a> {
    adapter: &'a dyn Adapter,
    capabilities: Capabilities,
    state: &'a StateManager,
    wrapper: AutoIncrementalWrapper<'a>,
    rewriter: SqlRewriter,
    vars: HashMap<String, String>,
    logger: Logger,
}

impl<'a> IncrementalExecutor<'a> {
    pub fn new(adapter: &'a dyn Adapter, state: &'a StateManager, logger: Logger) -> Self {
        IncrementalExecutor {
            adapter,
            capabilities: adapter.capabilities(),
            state,
            wrapper: AutoIncrementalWrapper::new(adapter, logger.clone()),
            rewriter: SqlRewriter::new(logger.clone()),
            vars: HashMap::new(),
            logger: logger.with_category("incremental"),
        }
    }

    /// Externally supplied variables for `{{ var('x') }}` and `${x}` references.
    pub fn with_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.vars = vars;
        self
    }

    pub fn sql_hash(sql: &str) -> String {
        StateManager::compute_sql_hash(sql)
    }

    pub fn config_hash(metadata: &ModelMetadata) -> String {
        StateManager::compute_config_hash(&metadata.config_hash_input())
    }

    fn config<'m>(&self, name: &str, metadata: &'m ModelMetadata) -> Result<&'m IncrementalConfig> {
        metadata
            .incremental
            .as_ref()
            .ok_or_else(|| Error::config(name, "incremental materialization requires an 'incremental' section"))
    }

    fn variable_resolved(&self, start: Option<&StartValue>) -> bool {
        matches!(start, Some(StartValue::Variable(name)) if self.vars.contains_key(name))
    }

    /// `false` means the next run must be a full load.
    pub fn should_run_incremental(&self, name: &str, sql: &str, metadata: &ModelMetadata) -> Result<bool> {
        let logger = self.logger.scoped(name);
        let config = self.config(name, metadata)?;

        let Some(state) = self.state.get_state(name)? else {
            logger.info("no prior state, running full load");
            return Ok(false);
        };
        if state.is_unknown() {
            logger.info("state was rebuilt without a definition, running full load");
            return Ok(false);
        }
        if state.sql_hash != Self::sql_hash(sql) {
            logger.info("SQL changed since last run, running full load");
            return Ok(false);
        }
        if state.config_hash != Self::config_hash(metadata) {
            logger.info("incremental config changed since last run, running full load");
            return Ok(false);
        }
        if !self.adapter.table_exists(name)? {
            logger.info("destination is missing, running full load");
            return Ok(false);
        }

        let incremental = match config.strategy() {
            Strategy::Append => true,
            Strategy::Merge | Strategy::DeleteInsert => {
                matches!(config.start_value(), Some(StartValue::Auto))
                    || self.variable_resolved(config.start_value())
                    || state.last_processed_value.is_some()
            }
        };
        if !incremental {
            logger.info(&format!(
                "{} has no watermark and no auto/variable start, running full load",
                config.strategy().as_str()
            ));
        }
        Ok(incremental)
    }

    /// Condition selecting the rows this run should load.
    pub fn get_time_filter_condition(
        &self,
        name: &str,
        config: &IncrementalConfig,
        watermark: Option<&str>,
    ) -> String {
        let col = quote_ident(config.filter_column());
        if let Some(wm) = watermark {
            return format!("{col} > CAST('{}' AS TIMESTAMP)", escape_sql_str(wm));
        }
        match config.start_value() {
            Some(StartValue::Auto) => {
                let lookback = config
                    .lookback()
                    .map(|l| format!(" - {}", l.as_interval()))
                    .unwrap_or_default();
                format!(
                    "{col} > (SELECT COALESCE(MAX({col}), TIMESTAMP '1900-01-01'){lookback} FROM {})",
                    self.wrapper.qualify(name)
                )
            }
            Some(StartValue::CurrentDate) => format!("{col} >= CURRENT_DATE"),
            Some(StartValue::Literal(date)) => format!("{col} >= '{}'", escape_sql_str(date)),
            Some(StartValue::Variable(var)) => match self.vars.get(var) {
                Some(value) => format!("{col} >= '{}'", escape_sql_str(value)),
                None => {
                    self.logger.scoped(name).warn(&format!(
                        "variable '{var}' is not set, defaulting to the last 7 days"
                    ));
                    format!("{col} >= CURRENT_TIMESTAMP - {DEFAULT_WINDOW}")
                }
            },
            None => format!("{col} >= CURRENT_TIMESTAMP - {DEFAULT_WINDOW}"),
        }
    }

    /// Substitute variable references, failing on any that are not set.
    pub fn resolve_variables(&self, name: &str, text: &str) -> Result<String> {
        let mut missing = Vec::new();
        let resolved = var_re().replace_all(text, |caps: &Captures| {
            let var = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match self.vars.get(var) {
                Some(value) => value.clone(),
                None => {
                    missing.push(var.to_string());
                    caps[0].to_string()
                }
            }
        });
        if !missing.is_empty() {
            return Err(Error::config(
                name,
                format!("unresolved variable(s) in where_condition: {}", missing.join(", ")),
            ));
        }
        Ok(resolved.into_owned())
    }

    /// Wrap for auto-increment when declared, otherwise just apply the filter.
    fn prepare_sql(&self, name: &str, sql: &str, metadata: &ModelMetadata, filter: Option<&str>) -> Result<String> {
        if self.wrapper.should_wrap(metadata) {
            return self.wrapper.wrap(name, sql, metadata, filter);
        }
        match filter {
            Some(condition) => self.rewriter.inject_where(sql, condition),
            None => Ok(sql.to_string()),
        }
    }

    /// Rebuild the destination from the unfiltered query and record state.
    pub fn full_load(&self, name: &str, sql: &str, metadata: &ModelMetadata) -> Result<()> {
        let logger = self.logger.scoped(name);
        let started = format_timestamp(Utc::now());

        // ids restart from scratch, so the old destination must not feed the rewrite
        self.adapter.drop_table(name)?;
        let prepared = self.prepare_sql(name, sql, metadata, None)?;
        logger.debug(&format!("full load SQL: {prepared}"));
        self.adapter.create_table(name, &prepared, Some(metadata))?;

        self.record_load(name, sql, metadata, &started)?;
        logger.info(&format!("full load complete, watermark {started}"));
        Ok(())
    }

    /// Save state for a completed rebuild of `name` with watermark `started`.
    pub fn record_load(&self, name: &str, sql: &str, metadata: &ModelMetadata, started: &str) -> Result<()> {
        let config = self.config(name, metadata)?;
        self.state.save_state(
            name,
            MaterializationKind::Incremental,
            &Self::sql_hash(sql),
            &Self::config_hash(metadata),
            Some(started),
            Some(config.strategy()),
        )
    }

    /// One incremental run using the configured strategy.
    pub fn run_incremental(&self, name: &str, sql: &str, metadata: &ModelMetadata) -> Result<Strategy> {
        let strategy = self.config(name, metadata)?.strategy();
        match strategy {
            Strategy::Append => self.execute_append(name, sql, metadata)?,
            Strategy::Merge => self.execute_merge(name, sql, metadata)?,
            Strategy::DeleteInsert => self.execute_delete_insert(name, sql, metadata)?,
        }
        Ok(strategy)
    }

    fn windowed_run(
        &self,
        name: &str,
        sql: &str,
        metadata: &ModelMetadata,
        apply: impl FnOnce(&str, &IncrementalConfig) -> Result<()>,
    ) -> Result<()> {
        let config = self.config(name, metadata)?;
        let started = format_timestamp(Utc::now());
        let watermark = self
            .state
            .get_state(name)?
            .and_then(|s| s.last_processed_value);
        let filter = self.get_time_filter_condition(name, config, watermark.as_deref());
        self.logger
            .scoped(name)
            .info(&format!("{} run, window: {filter}", config.strategy().as_str()));

        let prepared = self.prepare_sql(name, sql, metadata, Some(&filter))?;
        apply(&prepared, config)?;
        self.state
            .update_watermark(name, &started, Some(config.strategy()))
    }

    pub fn execute_append(&self, name: &str, sql: &str, metadata: &ModelMetadata) -> Result<()> {
        self.windowed_run(name, sql, metadata, |prepared, _| {
            self.apply_append(name, prepared, metadata)
        })
    }

    pub fn execute_merge(&self, name: &str, sql: &str, metadata: &ModelMetadata) -> Result<()> {
        self.windowed_run(name, sql, metadata, |prepared, config| {
            self.apply_merge(name, prepared, config.unique_key())
        })
    }

    pub fn execute_delete_insert(&self, name: &str, sql: &str, metadata: &ModelMetadata) -> Result<()> {
        self.windowed_run(name, sql, metadata, |prepared, config| {
            self.apply_delete_insert(name, prepared, config, &[])
        })
    }

    /// Run one backfill chunk: no time window, placeholders already filled in.
    ///
    /// State is left alone; the caller records it once the backfill completes.
    pub fn run_chunk(
        &self,
        name: &str,
        sql: &str,
        metadata: &ModelMetadata,
        values: &[(String, String)],
    ) -> Result<()> {
        let config = self.config(name, metadata)?;
        let prepared = self.prepare_sql(name, sql, metadata, None)?;
        match config.strategy() {
            Strategy::Append => self.apply_append(name, &prepared, metadata),
            Strategy::Merge => self.apply_merge(name, &prepared, config.unique_key()),
            Strategy::DeleteInsert => self.apply_delete_insert(name, &prepared, config, values),
        }
    }

    fn apply_append(&self, name: &str, prepared: &str, metadata: &ModelMetadata) -> Result<()> {
        if self.capabilities.incremental_append {
            return self.adapter.execute_incremental_append(name, prepared);
        }
        if !self.adapter.table_exists(name)? {
            self.logger
                .scoped(name)
                .debug("append unsupported and destination missing, creating table");
            return self.adapter.create_table(name, prepared, Some(metadata));
        }
        self.adapter.execute(&insert_statement(self.adapter, name, prepared)?)
    }

    fn apply_merge(&self, name: &str, prepared: &str, unique_key: &[String]) -> Result<()> {
        if self.capabilities.incremental_merge {
            return self.adapter.execute_incremental_merge(name, prepared, unique_key);
        }
        self.logger
            .scoped(name)
            .debug("merge unsupported by adapter, merging row by row");
        self.merge_row_by_row(name, prepared, unique_key)
    }

    /// Stage the batch once, then replace one key at a time.
    fn merge_row_by_row(&self, name: &str, prepared: &str, unique_key: &[String]) -> Result<()> {
        let (_, bare) = split_qualified(name);
        let staging = quote_ident(&format!("__merge_{bare}__"));
        let target = quote_qualified(name);
        self.adapter
            .execute(&format!("CREATE TEMPORARY TABLE {staging} AS {prepared}"))?;

        let result = insertable_columns(self.adapter, name, &format!("SELECT * FROM {staging}"))
            .and_then(|columns| self.merge_from_staging(&target, &staging, unique_key, columns.as_deref()));
        let _ = self.adapter.execute(&format!("DROP TABLE IF EXISTS {staging}"));
        result
    }

    fn merge_from_staging(
        &self,
        target: &str,
        staging: &str,
        unique_key: &[String],
        columns: Option<&[String]>,
    ) -> Result<()> {
        let keys: Vec<String> = unique_key.iter().map(|k| quote_ident(k)).collect();
        let (insert_list, select_list) = match columns {
            Some(columns) => {
                let list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
                (format!(" ({list})"), list)
            }
            None => (String::new(), "*".to_string()),
        };
        let rows = self.adapter.query(&format!(
            "SELECT DISTINCT {} FROM {staging}",
            keys.join(", ")
        ))?;
        for row in &rows {
            let condition = keys
                .iter()
                .enumerate()
                .map(|(i, k)| match row.get(i) {
                    Some(v) => format!("CAST({k} AS VARCHAR) = '{}'", escape_sql_str(v)),
                    None => format!("{k} IS NULL"),
                })
                .collect::<Vec<_>>()
                .join(" AND ");
            self.adapter
                .execute(&format!("DELETE FROM {target} WHERE {condition}"))?;
            self.adapter.execute(&format!(
                "INSERT INTO {target}{insert_list} SELECT {select_list} FROM {staging} WHERE {condition}"
            ))?;
        }
        Ok(())
    }

    /// DELETE condition for a delete+insert run.
    ///
    /// A configured `where_condition` gets chunk placeholders and variables
    /// resolved and date literals cast; otherwise rows are matched on the
    /// unique key of the incoming batch.
    pub fn delete_condition(
        &self,
        name: &str,
        prepared: &str,
        config: &IncrementalConfig,
        values: &[(String, String)],
    ) -> Result<String> {
        if let Some(template) = config.where_condition() {
            let substituted = substitute_placeholders(template, values);
            let resolved = self.resolve_variables(name, &substituted)?;
            return Ok(add_date_casts(&resolved));
        }
        let (_, bare) = split_qualified(name);
        let target = quote_ident(bare);
        let matches = config
            .unique_key()
            .iter()
            .map(|k| {
                let q = quote_ident(k);
                format!("__src__.{q} = {target}.{q}")
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        Ok(format!(
            "EXISTS (SELECT 1 FROM ({prepared}) AS __src__ WHERE {matches})"
        ))
    }

    fn apply_delete_insert(
        &self,
        name: &str,
        prepared: &str,
        config: &IncrementalConfig,
        values: &[(String, String)],
    ) -> Result<()> {
        let condition = self.delete_condition(name, prepared, config, values)?;
        self.logger
            .scoped(name)
            .debug(&format!("delete condition: {condition}"));
        if self.capabilities.incremental_delete_insert {
            return self
                .adapter
                .execute_incremental_delete_insert(name, &condition, prepared);
        }
        let insert = insert_statement(self.adapter, name, prepared)?;
        self.adapter
            .execute(&format!("DELETE FROM {} WHERE {condition}", quote_qualified(name)))?;
        self.adapter.execute(&insert)
    }

    pub fn refresh_runner<'r>(&'r self, name: &'r str, metadata: &'r ModelMetadata) -> ModelRefresh<'r, 'a> {
        ModelRefresh {
            executor: self,
            name,
            metadata,
        }
    }
}

/// Binds an executor to one model for the schema change handler.
pub struct ModelRefresh<'r, 'a> {
    executor: &'r IncrementalExecutor<'a>,
    name: &'r str,
    metadata: &'r ModelMetadata,
}

impl RefreshRunner for ModelRefresh<'_, '_> {
    fn full_load(&mut self, sql: &str) -> Result<()> {
        self.executor.full_load(self.name, sql, self.metadata)
    }

    fn run_chunk(&mut self, sql: &str, values: &[(String, String)]) -> Result<()> {
        self.executor.run_chunk(self.name, sql, self.metadata, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DuckDbAdapter;
    use pretty_assertions::assert_eq;

    fn metadata(yaml: &str) -> ModelMetadata {
        ModelMetadata::from_yaml("events", yaml).unwrap()
    }

    const APPEND: &str = "incremental:\n  strategy: append\n  append:\n    filter_column: ts\n";
    const MERGE_LITERAL: &str = "incremental:\n  strategy: merge\n  merge:\n    filter_column: ts\n    start_value: '2024-01-01'\n    unique_key: id\n";
    const MERGE_AUTO: &str = "incremental:\n  strategy: merge\n  merge:\n    filter_column: ts\n    start_value: auto\n    lookback: 2 hours\n    unique_key: id\n";
    const MERGE_VAR: &str = "incremental:\n  strategy: merge\n  merge:\n    filter_column: ts\n    start_value: \"{{ var('since') }}\"\n    unique_key: id\n";

    #[test]
    fn test_full_load_when_state_is_missing_unknown_or_stale() {
        let db = DuckDbAdapter::in_memory().unwrap();
        let sm = StateManager::in_memory(Logger::default());
        let exec = IncrementalExecutor::new(&db, &sm, Logger::default());
        let sql = "SELECT 1 AS id, now() AS ts";
        let meta = metadata(APPEND);

        assert!(!exec.should_run_incremental("events", sql, &meta).unwrap());

        db.execute("CREATE TABLE events (id INTEGER, ts TIMESTAMP)").unwrap();
        sm.rebuild_from_database(&db, "events").unwrap();
        assert!(!exec.should_run_incremental("events", sql, &meta).unwrap());

        let sql_hash = IncrementalExecutor::sql_hash(sql);
        let cfg_hash = IncrementalExecutor::config_hash(&meta);
        sm.save_state("events", MaterializationKind::Incremental, &sql_hash, &cfg_hash, None, None)
            .unwrap();
        assert!(exec.should_run_incremental("events", sql, &meta).unwrap());
        assert!(!exec.should_run_incremental("events", "SELECT 2 AS id, now() AS ts", &meta).unwrap());
        assert!(!exec.should_run_incremental("events", sql, &metadata(MERGE_AUTO)).unwrap());
    }

    #[test]
    fn test_merge_needs_watermark_unless_auto_or_variable() {
        let db = DuckDbAdapter::in_memory().unwrap();
        db.execute("CREATE TABLE events (id INTEGER, ts TIMESTAMP)").unwrap();
        let sm = StateManager::in_memory(Logger::default());
        let sql = "SELECT * FROM src";
        let save = |meta: &ModelMetadata, wm: Option<&str>| {
            sm.save_state(
                "events",
                MaterializationKind::Incremental,
                &IncrementalExecutor::sql_hash(sql),
                &IncrementalExecutor::config_hash(meta),
                wm,
                None,
            )
            .unwrap();
        };

        let exec = IncrementalExecutor::new(&db, &sm, Logger::default());
        let literal = metadata(MERGE_LITERAL);
        save(&literal, None);
        assert!(!exec.should_run_incremental("events", sql, &literal).unwrap());
        save(&literal, Some("2024-02-01 00:00:00"));
        assert!(exec.should_run_incremental("events", sql, &literal).unwrap());

        let auto = metadata(MERGE_AUTO);
        save(&auto, None);
        assert!(exec.should_run_incremental("events", sql, &auto).unwrap());

        let var = metadata(MERGE_VAR);
        save(&var, None);
        assert!(!exec.should_run_incremental("events", sql, &var).unwrap());
        let exec = IncrementalExecutor::new(&db, &sm, Logger::default())
            .with_vars(HashMap::from([("since".to_string(), "2024-01-01".to_string())]));
        assert!(exec.should_run_incremental("events", sql, &var).unwrap());
    }

    #[test]
    fn test_time_filter_conditions() {
        let db = DuckDbAdapter::in_memory().unwrap();
        let sm = StateManager::in_memory(Logger::default());
        let exec = IncrementalExecutor::new(&db, &sm, Logger::default());

        let cfg = metadata(MERGE_LITERAL).incremental.unwrap();
        assert_eq!(
            exec.get_time_filter_condition("events", &cfg, Some("2024-03-01 12:00:00")),
            "\"ts\" > CAST('2024-03-01 12:00:00' AS TIMESTAMP)"
        );
        assert_eq!(exec.get_time_filter_condition("events", &cfg, None), "\"ts\" >= '2024-01-01'");

        let auto = metadata(MERGE_AUTO).incremental.unwrap();
        assert_eq!(
            exec.get_time_filter_condition("events", &auto, None),
            "\"ts\" > (SELECT COALESCE(MAX(\"ts\"), TIMESTAMP '1900-01-01') - INTERVAL '2 hours' FROM \"main\".\"events\")"
        );

        let var = metadata(MERGE_VAR).incremental.unwrap();
        assert_eq!(
            exec.get_time_filter_condition("events", &var, None),
            "\"ts\" >= CURRENT_TIMESTAMP - INTERVAL '7 days'"
        );

        let append = metadata(APPEND).incremental.unwrap();
        assert_eq!(
            exec.get_time_filter_condition("events", &append, None),
            "\"ts\" >= CURRENT_TIMESTAMP - INTERVAL '7 days'"
        );
    }

    #[test]
    fn test_delete_condition_resolves_and_casts() {
        let db = DuckDbAdapter::in_memory().unwrap();
        let sm = StateManager::in_memory(Logger::default());
        let exec = IncrementalExecutor::new(&db, &sm, Logger::default())
            .with_vars(HashMap::from([("region".to_string(), "eu".to_string())]));
        let meta = metadata(
            "incremental:\n  strategy: delete_insert\n  delete_insert:\n    filter_column: d\n    unique_key: id\n    where_condition: \"d >= '{{ day }}' AND d < DATE '2024-02-01' AND region = '${region}'\"\n",
        );
        let cfg = meta.incremental.unwrap();
        let cond = exec
            .delete_condition("events", "SELECT 1", &cfg, &[("day".into(), "2024-01-05".into())])
            .unwrap();
        assert_eq!(
            cond,
            "d >= CAST('2024-01-05' AS DATE) AND d < DATE '2024-02-01' AND region = 'eu'"
        );

        let err = IncrementalExecutor::new(&db, &sm, Logger::default())
            .resolve_variables("events", "region = '${region}'")
            .unwrap_err();
        assert!(err.to_string().contains("region"));
    }

    #[test]
    fn test_delete_condition_defaults_to_key_match() {
        let db = DuckDbAdapter::in_memory().unwrap();
        let sm = StateManager::in_memory(Logger::default());
        let exec = IncrementalExecutor::new(&db, &sm, Logger::default());
        let cfg = metadata(
            "incremental:\n  strategy: delete_insert\n  delete_insert:\n    filter_column: d\n    unique_key: [a, b]\n",
        )
        .incremental
        .unwrap();
        assert_eq!(
            exec.delete_condition("mart.events", "SELECT 1", &cfg, &[]).unwrap(),
            "EXISTS (SELECT 1 FROM (SELECT 1) AS __src__ WHERE __src__.\"a\" = \"events\".\"a\" AND __src__.\"b\" = \"events\".\"b\")"
        );
    }

    /// DuckDB with its native incremental statements switched off.
    struct Portable<'d>(&'d DuckDbAdapter);

    impl Adapter for Portable<'_> {
        fn name(&self) -> &'static str {
            "portable"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                describe_query_schema: true,
                ..Capabilities::default()
            }
        }
        fn table_exists(&self, name: &str) -> Result<bool> {
            self.0.table_exists(name)
        }
        fn create_table(&self, name: &str, sql: &str, metadata: Option<&ModelMetadata>) -> Result<()> {
            self.0.create_table(name, sql, metadata)
        }
        fn create_view(&self, name: &str, sql: &str) -> Result<()> {
            self.0.create_view(name, sql)
        }
        fn drop_table(&self, name: &str) -> Result<()> {
            self.0.drop_table(name)
        }
        fn drop_view(&self, name: &str) -> Result<()> {
            self.0.drop_view(name)
        }
        fn get_table_info(&self, name: &str) -> Result<crate::adapter::TableInfo> {
            self.0.get_table_info(name)
        }
        fn execute(&self, sql: &str) -> Result<()> {
            self.0.execute(sql)
        }
        fn query(&self, sql: &str) -> Result<Vec<crate::adapter::QueryRow>> {
            self.0.query(sql)
        }
        fn describe_query_schema(&self, sql: &str) -> Result<Vec<crate::schema::ColumnInfo>> {
            self.0.describe_query_schema(sql)
        }
    }

    #[test]
    fn test_portable_loads_skip_columns_the_destination_lacks() {
        let db = DuckDbAdapter::in_memory().unwrap();
        db.execute("CREATE TABLE events (id INTEGER, v VARCHAR)").unwrap();
        db.execute("INSERT INTO events VALUES (1, 'old')").unwrap();
        let portable = Portable(&db);
        let sm = StateManager::in_memory(Logger::default());
        let exec = IncrementalExecutor::new(&portable, &sm, Logger::default());
        let values = |sql: &str| -> Vec<(String, String)> {
            db.query(sql)
                .unwrap()
                .iter()
                .map(|r| (r.get(0).unwrap().to_string(), r.get(1).unwrap().to_string()))
                .collect()
        };

        exec.run_chunk("events", "SELECT 'web' AS channel, 'appended' AS v, 2 AS id", &metadata(APPEND), &[])
            .unwrap();
        assert_eq!(
            values("SELECT CAST(id AS VARCHAR), v FROM events ORDER BY id"),
            vec![("1".to_string(), "old".to_string()), ("2".to_string(), "appended".to_string())]
        );

        let delete_insert = metadata(
            "incremental:\n  strategy: delete_insert\n  delete_insert:\n    filter_column: ts\n    unique_key: id\n",
        );
        exec.run_chunk("events", "SELECT 'web' AS channel, 'replaced' AS v, 1 AS id", &delete_insert, &[])
            .unwrap();
        exec.run_chunk("events", "SELECT 'app' AS channel, 'merged' AS v, 2 AS id", &metadata(MERGE_LITERAL), &[])
            .unwrap();
        assert_eq!(
            values("SELECT CAST(id AS VARCHAR), v FROM events ORDER BY id"),
            vec![("1".to_string(), "replaced".to_string()), ("2".to_string(), "merged".to_string())]
        );
        assert_eq!(db.get_table_info("events").unwrap().schema.len(), 2);
    }
}

use crate::adapter::{Adapter, Capabilities};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::incremental::IncrementalExecutor;
use crate::logging::Logger;
use crate::project::{MaterializationKind, ModelMetadata, Strategy};
use crate::schema_change::{SchemaChangeHandler, SchemaChangeOutcome};
use crate::state::{format_timestamp, StateManager};
use crate::escape_sql_str;
use chrono::Utc;
use std::collections::HashMap;

/// What a `materialize` call ended up doing.
#[derive(Debug, Clone, PartialEq)]
pub enum MaterializeOutcome {
    /// Table, view, materialized view or external table (re)created.
    Created,
    /// Incremental model rebuilt from the full query.
    FullLoad,
    Incremental { strategy: Strategy },
    /// Schema drift forced a full refresh.
    Refreshed,
    Backfilled { chunks: usize },
}

/// Entry point for materializing one model.
pub struct MaterializationHandler<'a> {
    adapter: &'a dyn Adapter,
    capabilities: Capabilities,
    state: &'a StateManager,
    incremental: IncrementalExecutor<'a>,
    schema_changes: SchemaChangeHandler<'a>,
    logger: Logger,
}

impl<'a> MaterializationHandler<'a> {
    pub fn new(adapter: &'a dyn Adapter, state: &'a StateManager, logger: Logger) -> Self {
        MaterializationHandler {
            adapter,
            capabilities: adapter.capabilities(),
            state,
            incremental: IncrementalExecutor::new(adapter, state, logger.clone()),
            schema_changes: SchemaChangeHandler::new(adapter, logger.clone()),
            logger: logger.with_category("materialize"),
        }
    }

    /// Handler whose variable map comes from `settings`.
    pub fn from_settings(
        adapter: &'a dyn Adapter,
        state: &'a StateManager,
        settings: &Settings,
        logger: Logger,
    ) -> Self {
        Self::new(adapter, state, logger).with_vars(settings.vars.clone())
    }

    pub fn with_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.incremental = self.incremental.with_vars(vars);
        self
    }

    pub fn materialize(
        &self,
        name: &str,
        sql: &str,
        kind: MaterializationKind,
        metadata: &ModelMetadata,
    ) -> Result<MaterializeOutcome> {
        let logger = self.logger.scoped(name);
        logger.info(&format!("materializing as {}", kind.as_str()));

        let outcome = match kind {
            MaterializationKind::Incremental => return self.materialize_incremental(name, sql, metadata),
            MaterializationKind::Table => {
                self.drop_previous(name, kind)?;
                self.adapter.create_table(name, sql, Some(metadata))?;
                MaterializeOutcome::Created
            }
            MaterializationKind::View => {
                self.drop_previous(name, kind)?;
                self.adapter.create_view(name, sql)?;
                MaterializeOutcome::Created
            }
            MaterializationKind::MaterializedView => {
                self.drop_previous(name, kind)?;
                if self.capabilities.materialized_views {
                    self.adapter.create_materialized_view(name, sql)?;
                } else {
                    logger.info("materialized views unsupported, creating a table instead");
                    self.adapter.create_table(name, sql, Some(metadata))?;
                }
                MaterializeOutcome::Created
            }
            MaterializationKind::ExternalTable => {
                let external = metadata.external.as_ref().ok_or_else(|| {
                    Error::config(name, "external_table requires an 'external.location'")
                })?;
                self.drop_previous(name, kind)?;
                if self.capabilities.external_tables {
                    self.adapter.create_external_table(name, external)?;
                } else {
                    logger.info("external tables unsupported, creating a view over the location");
                    self.adapter.create_view(
                        name,
                        &format!("SELECT * FROM '{}'", escape_sql_str(&external.location)),
                    )?;
                }
                MaterializeOutcome::Created
            }
            MaterializationKind::Unknown => {
                return Err(Error::config(name, "unknown materialization type"));
            }
        };

        self.apply_comment(name, metadata);
        self.state.save_state(
            name,
            kind,
            &IncrementalExecutor::sql_hash(sql),
            &IncrementalExecutor::config_hash(metadata),
            None,
            None,
        )?;
        Ok(outcome)
    }

    fn materialize_incremental(
        &self,
        name: &str,
        sql: &str,
        metadata: &ModelMetadata,
    ) -> Result<MaterializeOutcome> {
        let logger = self.logger.scoped(name);

        let started = format_timestamp(Utc::now());
        let mut runner = self.incremental.refresh_runner(name, metadata);

        if !self.incremental.should_run_incremental(name, sql, metadata)? {
            self.drop_previous(name, MaterializationKind::Incremental)?;
            // templated models cannot run unsubstituted, so they load chunk by chunk
            if !metadata.full_incremental_refresh.is_empty() {
                let chunks = self
                    .schema_changes
                    .rebuild_in_chunks(name, sql, metadata, &mut runner)?;
                self.incremental.record_load(name, sql, metadata, &started)?;
                self.apply_comment(name, metadata);
                return Ok(MaterializeOutcome::Backfilled { chunks });
            }
            self.incremental.full_load(name, sql, metadata)?;
            self.apply_comment(name, metadata);
            return Ok(MaterializeOutcome::FullLoad);
        }

        let change = self.schema_changes.handle(name, sql, metadata, &mut runner)?;
        match change {
            SchemaChangeOutcome::FullRefreshed => {
                self.apply_comment(name, metadata);
                Ok(MaterializeOutcome::Refreshed)
            }
            SchemaChangeOutcome::Backfilled { chunks } => {
                self.incremental.record_load(name, sql, metadata, &started)?;
                self.apply_comment(name, metadata);
                Ok(MaterializeOutcome::Backfilled { chunks })
            }
            other => {
                if other != SchemaChangeOutcome::Unchanged {
                    logger.debug(&format!("schema reconciled: {other:?}"));
                }
                let run_sql =
                    self.schema_changes
                        .full_range_sql(name, sql, &metadata.full_incremental_refresh)?;
                let strategy = self.incremental.run_incremental(name, &run_sql, metadata)?;
                Ok(MaterializeOutcome::Incremental { strategy })
            }
        }
    }

    /// Remove an object left by a different materialization of the same name.
    fn drop_previous(&self, name: &str, kind: MaterializationKind) -> Result<()> {
        let Some(previous) = self.state.get_state(name)? else {
            return Ok(());
        };
        if previous.materialization == kind || previous.materialization == MaterializationKind::Unknown {
            return Ok(());
        }
        let dropped = match previous.materialization {
            MaterializationKind::View | MaterializationKind::ExternalTable => self.adapter.drop_view(name),
            _ => self.adapter.drop_table(name),
        };
        if let Err(e) = dropped {
            self.logger.scoped(name).warn(&format!(
                "could not drop previous {} ({e})",
                previous.materialization.as_str()
            ));
        }
        Ok(())
    }

    fn apply_comment(&self, name: &str, metadata: &ModelMetadata) {
        let Some(description) = metadata.description.as_deref() else {
            return;
        };
        if !self.capabilities.comments {
            return;
        }
        if let Err(e) = self.adapter.set_comment(name, description) {
            self.logger
                .scoped(name)
                .warn(&format!("could not set comment: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DuckDbAdapter;
    use pretty_assertions::assert_eq;

    fn count(db: &DuckDbAdapter, table: &str) -> String {
        db.query(&format!("SELECT COUNT(*) FROM {table}")).unwrap()[0]
            .get(0)
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_table_and_view() {
        let db = DuckDbAdapter::in_memory().unwrap();
        let sm = StateManager::in_memory(Logger::default());
        let handler = MaterializationHandler::new(&db, &sm, Logger::default());
        let meta = ModelMetadata::from_yaml("m", "description: numbers\n").unwrap();

        let outcome = handler
            .materialize("m", "SELECT * FROM range(3) t(i)", MaterializationKind::Table, &meta)
            .unwrap();
        assert_eq!(outcome, MaterializeOutcome::Created);
        assert_eq!(count(&db, "m"), "3");
        assert_eq!(sm.get_state("m").unwrap().unwrap().materialization, MaterializationKind::Table);

        handler
            .materialize("m", "SELECT 1 AS i", MaterializationKind::View, &meta)
            .unwrap();
        assert_eq!(count(&db, "m"), "1");
        assert_eq!(sm.get_state("m").unwrap().unwrap().materialization, MaterializationKind::View);
    }

    #[test]
    fn test_materialized_view_falls_back_to_table() {
        let db = DuckDbAdapter::in_memory().unwrap();
        let sm = StateManager::in_memory(Logger::default());
        let handler = MaterializationHandler::new(&db, &sm, Logger::default());
        handler
            .materialize(
                "mv",
                "SELECT 42 AS answer",
                MaterializationKind::MaterializedView,
                &ModelMetadata::default(),
            )
            .unwrap();
        assert!(db.table_exists("mv").unwrap());
    }

    #[test]
    fn test_external_table_requires_location() {
        let db = DuckDbAdapter::in_memory().unwrap();
        let sm = StateManager::in_memory(Logger::default());
        let handler = MaterializationHandler::new(&db, &sm, Logger::default());
        let err = handler
            .materialize("ext", "", MaterializationKind::ExternalTable, &ModelMetadata::default())
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(sm.get_state("ext").unwrap().is_none());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let db = DuckDbAdapter::in_memory().unwrap();
        let sm = StateManager::in_memory(Logger::default());
        let handler = MaterializationHandler::new(&db, &sm, Logger::default());
        assert!(handler
            .materialize("x", "SELECT 1", MaterializationKind::Unknown, &ModelMetadata::default())
            .is_err());
    }

    #[test]
    fn test_incremental_first_run_is_full_load() {
        let db = DuckDbAdapter::in_memory().unwrap();
        db.execute("CREATE TABLE src AS SELECT i AS id, TIMESTAMP '2999-01-01' AS ts FROM range(5) t(i)")
            .unwrap();
        let sm = StateManager::in_memory(Logger::default());
        let handler = MaterializationHandler::new(&db, &sm, Logger::default());
        let meta = ModelMetadata::from_yaml(
            "events",
            "incremental:\n  strategy: append\n  append:\n    filter_column: ts\n",
        )
        .unwrap();

        let outcome = handler
            .materialize("events", "SELECT * FROM src", MaterializationKind::Incremental, &meta)
            .unwrap();
        assert_eq!(outcome, MaterializeOutcome::FullLoad);
        let state = sm.get_state("events").unwrap().unwrap();
        assert_eq!(state.strategy, Some(Strategy::Append));
        assert!(state.last_processed_value.is_some());

        let outcome = handler
            .materialize("events", "SELECT * FROM src", MaterializationKind::Incremental, &meta)
            .unwrap();
        assert_eq!(outcome, MaterializeOutcome::Incremental { strategy: Strategy::Append });
    }
}

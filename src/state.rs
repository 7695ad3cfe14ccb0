use crate::adapter::Adapter;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::logging::Logger;
use crate::project::{MaterializationKind, Strategy};
use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::{params, Connection, Row};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Hash recorded for state rebuilt from an existing table with no history.
pub const UNKNOWN_HASH: &str = "unknown";

const STATE_TABLE: &str = "_trex_model_state";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Debug, Clone, PartialEq)]
pub struct ModelState {
    pub model_name: String,
    pub materialization: MaterializationKind,
    pub last_execution_timestamp: Option<DateTime<Utc>>,
    pub sql_hash: String,
    pub config_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_processed_value: Option<String>,
    pub strategy: Option<Strategy>,
}

impl ModelState {
    /// Reconstructed from table existence alone; the next run must be a full load.
    pub fn is_unknown(&self) -> bool {
        self.sql_hash == UNKNOWN_HASH || self.config_hash == UNKNOWN_HASH
    }
}

/// Format used for every timestamp the store writes, and for watermarks.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_stored_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .or_else(|| crate::chunk::parse_timestamp(raw))
        .map(|naive| naive.and_utc())
}

enum Slot {
    Unopened,
    Open(Connection),
    Closed,
}

/// Durable per-model execution state in a DuckDB database.
///
/// The store is opened on first use and held until `close`. It assumes a
/// single writer; concurrent runs against one file must be serialized by the
/// caller.
pub struct StateManager {
    path: PathBuf,
    slot: Mutex<Slot>,
    logger: Logger,
}

impl StateManager {
    /// `path` may be `:memory:` for a throwaway store.
    pub fn new(path: impl Into<PathBuf>, logger: Logger) -> Self {
        StateManager {
            path: path.into(),
            slot: Mutex::new(Slot::Unopened),
            logger: logger.with_category("state"),
        }
    }

    pub fn in_memory(logger: Logger) -> Self {
        Self::new(":memory:", logger)
    }

    pub fn from_settings(settings: &Settings, logger: Logger) -> Self {
        Self::new(&settings.state_path, logger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_slot(&self) -> Result<MutexGuard<'_, Slot>> {
        self.slot
            .lock()
            .map_err(|_| Error::State("state store mutex poisoned".into()))
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = if self.path.as_os_str() == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            Connection::open(&self.path)?
        };
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {STATE_TABLE} (\
                model_name VARCHAR PRIMARY KEY,\
                materialization VARCHAR NOT NULL,\
                last_execution_timestamp VARCHAR,\
                sql_hash VARCHAR NOT NULL,\
                config_hash VARCHAR NOT NULL,\
                created_at VARCHAR NOT NULL,\
                updated_at VARCHAR NOT NULL,\
                last_processed_value VARCHAR,\
                strategy VARCHAR\
            );"
        ))?;
        self.logger
            .debug(&format!("opened state store at {}", self.path.display()));
        Ok(conn)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut slot = self.lock_slot()?;
        if matches!(*slot, Slot::Unopened) {
            *slot = Slot::Open(self.open_connection()?);
        }
        match &mut *slot {
            Slot::Open(conn) => f(conn),
            Slot::Closed => Err(Error::State(format!(
                "state store {} is closed",
                self.path.display()
            ))),
            Slot::Unopened => Err(Error::State("state store failed to open".into())),
        }
    }

    /// Release the backing connection. Any later call fails.
    pub fn close(&self) -> Result<()> {
        let mut slot = self.lock_slot()?;
        if let Slot::Open(conn) = std::mem::replace(&mut *slot, Slot::Closed) {
            conn.close().map_err(|(_, e)| Error::Database(e))?;
        }
        Ok(())
    }

    pub fn get_state(&self, name: &str) -> Result<Option<ModelState>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT model_name, materialization, last_execution_timestamp, sql_hash, \
                 config_hash, created_at, updated_at, last_processed_value, strategy \
                 FROM {STATE_TABLE} WHERE model_name = ?"
            ))?;
            let mut rows = stmt.query(params![name])?;
            match rows.next()? {
                Some(row) => Ok(Some(state_from_row(row)?)),
                None => Ok(None),
            }
        })
    }

    pub fn list_states(&self) -> Result<Vec<ModelState>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT model_name, materialization, last_execution_timestamp, sql_hash, \
                 config_hash, created_at, updated_at, last_processed_value, strategy \
                 FROM {STATE_TABLE} ORDER BY model_name"
            ))?;
            let mut rows = stmt.query([])?;
            let mut states = Vec::new();
            while let Some(row) = rows.next()? {
                states.push(state_from_row(row)?);
            }
            Ok(states)
        })
    }

    /// Upsert the state row for `name`. `created_at` survives updates.
    pub fn save_state(
        &self,
        name: &str,
        kind: MaterializationKind,
        sql_hash: &str,
        config_hash: &str,
        watermark: Option<&str>,
        strategy: Option<Strategy>,
    ) -> Result<()> {
        let now = format_timestamp(Utc::now());
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!(
                    "INSERT INTO {STATE_TABLE} \
                     (model_name, materialization, last_execution_timestamp, sql_hash, config_hash, \
                      created_at, updated_at, last_processed_value, strategy) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT (model_name) DO UPDATE SET \
                     materialization = excluded.materialization, \
                     last_execution_timestamp = excluded.last_execution_timestamp, \
                     sql_hash = excluded.sql_hash, \
                     config_hash = excluded.config_hash, \
                     updated_at = excluded.updated_at, \
                     last_processed_value = excluded.last_processed_value, \
                     strategy = excluded.strategy"
                ),
                params![
                    name,
                    kind.as_str(),
                    now,
                    sql_hash,
                    config_hash,
                    now,
                    now,
                    watermark,
                    strategy.map(|s| s.as_str()),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })?;
        self.logger.debug(&format!(
            "saved state for {name}: kind={}, watermark={}",
            kind.as_str(),
            watermark.unwrap_or("none")
        ));
        Ok(())
    }

    /// Record a new watermark. An unknown model is logged and ignored.
    pub fn update_watermark(&self, name: &str, value: &str, strategy: Option<Strategy>) -> Result<()> {
        let Some(state) = self.get_state(name)? else {
            self.logger.error(&format!(
                "cannot update watermark for unknown model '{name}'; state must be saved first"
            ));
            return Ok(());
        };
        self.save_state(
            name,
            state.materialization,
            &state.sql_hash,
            &state.config_hash,
            Some(value),
            strategy.or(state.strategy),
        )
    }

    pub fn delete_state(&self, name: &str) -> Result<bool> {
        let deleted = self.with_conn(|conn| {
            Ok(conn.execute(
                &format!("DELETE FROM {STATE_TABLE} WHERE model_name = ?"),
                params![name],
            )?)
        })?;
        Ok(deleted > 0)
    }

    pub fn compute_sql_hash(sql: &str) -> String {
        hex::encode(Sha256::digest(sql.as_bytes()))
    }

    /// Digest of `config` after recursive key sorting, so field order never
    /// changes the result.
    pub fn compute_config_hash(config: &serde_json::Value) -> String {
        let mut canonical = String::new();
        write_canonical(config, &mut canonical);
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    pub fn check_existence(&self, adapter: &dyn Adapter, name: &str) -> Result<bool> {
        adapter.table_exists(name)
    }

    /// Adopt a destination that exists without recorded history.
    ///
    /// The rebuilt row carries `unknown` hashes, which forces the next run to
    /// do a full load. Returns the existing state untouched when there is one.
    pub fn rebuild_from_database(&self, adapter: &dyn Adapter, name: &str) -> Result<Option<ModelState>> {
        if let Some(existing) = self.get_state(name)? {
            return Ok(Some(existing));
        }
        if !self.check_existence(adapter, name)? {
            return Ok(None);
        }
        self.logger.info(&format!(
            "rebuilding state for {name} from existing {} object",
            adapter.name()
        ));
        self.save_state(
            name,
            MaterializationKind::Unknown,
            UNKNOWN_HASH,
            UNKNOWN_HASH,
            None,
            None,
        )?;
        self.get_state(name)
    }
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn state_from_row(row: &Row<'_>) -> Result<ModelState> {
    let model_name: String = row.get(0)?;
    let materialization: String = row.get(1)?;
    let last_execution: Option<String> = row.get(2)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    let strategy: Option<String> = row.get(8)?;

    let stamp = |raw: &str| {
        parse_stored_timestamp(raw).ok_or_else(|| {
            Error::State(format!("invalid timestamp '{raw}' stored for {model_name}"))
        })
    };

    Ok(ModelState {
        materialization: MaterializationKind::parse(&materialization),
        last_execution_timestamp: last_execution.as_deref().and_then(parse_stored_timestamp),
        sql_hash: row.get(3)?,
        config_hash: row.get(4)?,
        created_at: stamp(&created_at)?,
        updated_at: stamp(&updated_at)?,
        last_processed_value: row.get(7)?,
        strategy: strategy.as_deref().and_then(Strategy::parse),
        model_name,
    })
}

use crate::chunk::{ChunkParameter, ParamValue};
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializationKind {
    Table,
    View,
    MaterializedView,
    ExternalTable,
    Incremental,
    Unknown,
}

impl MaterializationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaterializationKind::Table => "table",
            MaterializationKind::View => "view",
            MaterializationKind::MaterializedView => "materialized_view",
            MaterializationKind::ExternalTable => "external_table",
            MaterializationKind::Incremental => "incremental",
            MaterializationKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> MaterializationKind {
        match s.trim().to_lowercase().as_str() {
            "table" => MaterializationKind::Table,
            "view" => MaterializationKind::View,
            "materialized_view" | "materialized view" => MaterializationKind::MaterializedView,
            "external_table" | "external" => MaterializationKind::ExternalTable,
            "incremental" => MaterializationKind::Incremental,
            _ => MaterializationKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Append,
    Merge,
    DeleteInsert,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Append => "append",
            Strategy::Merge => "merge",
            Strategy::DeleteInsert => "delete_insert",
        }
    }

    pub fn parse(s: &str) -> Option<Strategy> {
        match s.trim().to_lowercase().as_str() {
            "append" => Some(Strategy::Append),
            "merge" => Some(Strategy::Merge),
            "delete_insert" | "delete+insert" | "delete-insert" => Some(Strategy::DeleteInsert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaChangePolicy {
    Fail,
    #[default]
    Ignore,
    AppendNewColumns,
    SyncAllColumns,
    FullRefresh,
    FullIncrementalRefresh,
    RecreateEmpty,
}

impl SchemaChangePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaChangePolicy::Fail => "fail",
            SchemaChangePolicy::Ignore => "ignore",
            SchemaChangePolicy::AppendNewColumns => "append_new_columns",
            SchemaChangePolicy::SyncAllColumns => "sync_all_columns",
            SchemaChangePolicy::FullRefresh => "full_refresh",
            SchemaChangePolicy::FullIncrementalRefresh => "full_incremental_refresh",
            SchemaChangePolicy::RecreateEmpty => "recreate_empty",
        }
    }

    pub fn parse(s: &str) -> Option<SchemaChangePolicy> {
        match s.trim().to_lowercase().as_str() {
            "fail" => Some(SchemaChangePolicy::Fail),
            "ignore" => Some(SchemaChangePolicy::Ignore),
            "append_new_columns" => Some(SchemaChangePolicy::AppendNewColumns),
            "sync_all_columns" => Some(SchemaChangePolicy::SyncAllColumns),
            "full_refresh" => Some(SchemaChangePolicy::FullRefresh),
            "full_incremental_refresh" => Some(SchemaChangePolicy::FullIncrementalRefresh),
            "recreate_empty" => Some(SchemaChangePolicy::RecreateEmpty),
            _ => None,
        }
    }
}

/// Where an incremental window starts when no watermark is recorded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartValue {
    /// Bounded by the destination's current max of the filter column.
    Auto,
    CurrentDate,
    /// A literal date or timestamp, kept as written.
    Literal(String),
    /// Name of an externally supplied variable.
    Variable(String),
}

impl StartValue {
    pub fn parse(raw: &str) -> Option<StartValue> {
        static VAR_RE: OnceLock<Regex> = OnceLock::new();
        let re = VAR_RE.get_or_init(|| {
            Regex::new(
                r#"^(?:\{\{\s*var\(\s*['"]([A-Za-z_][A-Za-z0-9_]*)['"]\s*\)\s*\}\}|\$\{([A-Za-z_][A-Za-z0-9_]*)\})$"#,
            )
            .expect("valid var regex")
        });
        let s = raw.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Some(StartValue::Auto);
        }
        if s.eq_ignore_ascii_case("current_date") {
            return Some(StartValue::CurrentDate);
        }
        if let Some(caps) = re.captures(s) {
            let name = caps.get(1).or_else(|| caps.get(2))?;
            return Some(StartValue::Variable(name.as_str().to_string()));
        }
        match ParamValue::parse(s) {
            Some(ParamValue::Date(_)) | Some(ParamValue::Timestamp(_)) => {
                Some(StartValue::Literal(crate::chunk::strip_quotes(s).to_string()))
            }
            _ => None,
        }
    }

    fn canonical(&self) -> String {
        match self {
            StartValue::Auto => "auto".into(),
            StartValue::CurrentDate => "CURRENT_DATE".into(),
            StartValue::Literal(v) => v.clone(),
            StartValue::Variable(name) => format!("{{{{ var('{name}') }}}}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookbackUnit {
    Minute,
    Hour,
    Day,
}

/// Late-arrival window. Weeks become 7 days and months 30 days (approximate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookback {
    pub amount: i64,
    pub unit: LookbackUnit,
}

impl Lookback {
    pub fn parse(raw: &str) -> Option<Lookback> {
        static LOOKBACK_RE: OnceLock<Regex> = OnceLock::new();
        let re = LOOKBACK_RE.get_or_init(|| {
            Regex::new(r"(?i)^\s*(\d+)\s*(minute|minutes|hour|hours|day|days|week|weeks|month|months)\s*$")
                .expect("valid lookback regex")
        });
        let caps = re.captures(raw)?;
        let amount: i64 = caps[1].parse().ok()?;
        let lookback = match caps[2].to_lowercase().trim_end_matches('s') {
            "minute" => Lookback { amount, unit: LookbackUnit::Minute },
            "hour" => Lookback { amount, unit: LookbackUnit::Hour },
            "day" => Lookback { amount, unit: LookbackUnit::Day },
            "week" => Lookback { amount: amount * 7, unit: LookbackUnit::Day },
            "month" => Lookback { amount: amount * 30, unit: LookbackUnit::Day },
            _ => return None,
        };
        Some(lookback)
    }

    /// SQL interval literal, e.g. `INTERVAL '3 days'`.
    pub fn as_interval(&self) -> String {
        let unit = match self.unit {
            LookbackUnit::Minute => "minutes",
            LookbackUnit::Hour => "hours",
            LookbackUnit::Day => "days",
        };
        format!("INTERVAL '{} {}'", self.amount, unit)
    }

    fn canonical(&self) -> String {
        let unit = match self.unit {
            LookbackUnit::Minute => "minutes",
            LookbackUnit::Hour => "hours",
            LookbackUnit::Day => "days",
        };
        format!("{} {}", self.amount, unit)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendConfig {
    pub filter_column: String,
    pub start_value: Option<StartValue>,
    pub lookback: Option<Lookback>,
    /// Only orders generated ids; append never excludes existing keys.
    pub unique_key: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeConfig {
    pub filter_column: String,
    pub start_value: Option<StartValue>,
    pub lookback: Option<Lookback>,
    pub unique_key: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteInsertConfig {
    pub filter_column: String,
    pub start_value: Option<StartValue>,
    pub lookback: Option<Lookback>,
    pub unique_key: Vec<String>,
    pub where_condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IncrementalConfig {
    Append(AppendConfig),
    Merge(MergeConfig),
    DeleteInsert(DeleteInsertConfig),
}

impl IncrementalConfig {
    pub fn strategy(&self) -> Strategy {
        match self {
            IncrementalConfig::Append(_) => Strategy::Append,
            IncrementalConfig::Merge(_) => Strategy::Merge,
            IncrementalConfig::DeleteInsert(_) => Strategy::DeleteInsert,
        }
    }

    pub fn filter_column(&self) -> &str {
        match self {
            IncrementalConfig::Append(c) => &c.filter_column,
            IncrementalConfig::Merge(c) => &c.filter_column,
            IncrementalConfig::DeleteInsert(c) => &c.filter_column,
        }
    }

    pub fn start_value(&self) -> Option<&StartValue> {
        match self {
            IncrementalConfig::Append(c) => c.start_value.as_ref(),
            IncrementalConfig::Merge(c) => c.start_value.as_ref(),
            IncrementalConfig::DeleteInsert(c) => c.start_value.as_ref(),
        }
    }

    pub fn lookback(&self) -> Option<Lookback> {
        match self {
            IncrementalConfig::Append(c) => c.lookback,
            IncrementalConfig::Merge(c) => c.lookback,
            IncrementalConfig::DeleteInsert(c) => c.lookback,
        }
    }

    pub fn unique_key(&self) -> &[String] {
        match self {
            IncrementalConfig::Append(c) => &c.unique_key,
            IncrementalConfig::Merge(c) => &c.unique_key,
            IncrementalConfig::DeleteInsert(c) => &c.unique_key,
        }
    }

    pub fn where_condition(&self) -> Option<&str> {
        match self {
            IncrementalConfig::DeleteInsert(c) => c.where_condition.as_deref(),
            _ => None,
        }
    }

    /// Structure hashed for drift detection. Key order is irrelevant downstream
    /// because the hasher canonicalises it.
    pub fn to_json(&self) -> serde_json::Value {
        let mut section = json!({
            "filter_column": self.filter_column(),
            "start_value": self.start_value().map(StartValue::canonical),
            "lookback": self.lookback().map(|l| l.canonical()),
        });
        if let Some(obj) = section.as_object_mut() {
            if !self.unique_key().is_empty() {
                obj.insert("unique_key".into(), json!(self.unique_key()));
            }
            if let Some(cond) = self.where_condition() {
                obj.insert("where_condition".into(), json!(cond));
            }
        }
        let mut root = serde_json::Map::new();
        root.insert("strategy".into(), json!(self.strategy().as_str()));
        root.insert(self.strategy().as_str().into(), section);
        serde_json::Value::Object(root)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(default, alias = "type", alias = "data_type")]
    pub datatype: Option<String>,
    #[serde(default, rename = "autoIncremental", alias = "auto_incremental")]
    pub auto_incremental: bool,
}

impl ColumnSpec {
    pub fn new(name: &str, datatype: &str) -> Self {
        ColumnSpec {
            name: name.to_string(),
            datatype: Some(datatype.to_string()),
            auto_incremental: false,
        }
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_incremental = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExternalConfig {
    pub location: String,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelMetadata {
    pub schema: Vec<ColumnSpec>,
    pub incremental: Option<IncrementalConfig>,
    pub on_schema_change: SchemaChangePolicy,
    pub full_incremental_refresh: Vec<ChunkParameter>,
    pub description: Option<String>,
    pub external: Option<ExternalConfig>,
}

impl ModelMetadata {
    pub fn from_yaml(model: &str, text: &str) -> Result<Self> {
        let raw: MetadataRaw = serde_yaml::from_str(text)?;
        raw.validate(model)
    }

    pub fn from_json(model: &str, text: &str) -> Result<Self> {
        let raw: MetadataRaw = serde_json::from_str(text)?;
        raw.validate(model)
    }

    /// The auto-incremental column, failing when more than one is flagged.
    pub fn auto_incremental_column(&self, model: &str) -> Result<Option<&ColumnSpec>> {
        let flagged: Vec<&ColumnSpec> = self.schema.iter().filter(|c| c.auto_incremental).collect();
        match flagged.len() {
            0 => Ok(None),
            1 => Ok(Some(flagged[0])),
            _ => Err(Error::config(
                model,
                format!(
                    "only one column may be autoIncremental, found: {}",
                    flagged
                        .iter()
                        .map(|c| c.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )),
        }
    }

    pub fn config_hash_input(&self) -> serde_json::Value {
        match &self.incremental {
            Some(cfg) => {
                let mut value = cfg.to_json();
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("on_schema_change".into(), json!(self.on_schema_change.as_str()));
                }
                value
            }
            None => serde_json::Value::Null,
        }
    }
}

// ── Raw serde layer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UniqueKeyConfig {
    Single(String),
    Composite(Vec<String>),
}

impl UniqueKeyConfig {
    pub fn columns(&self) -> Vec<String> {
        match self {
            UniqueKeyConfig::Single(s) => vec![s.clone()],
            UniqueKeyConfig::Composite(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MetadataRaw {
    #[serde(default)]
    schema: Vec<ColumnSpec>,
    #[serde(default)]
    incremental: Option<IncrementalRaw>,
    #[serde(default)]
    full_incremental_refresh: Option<FullRefreshRaw>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    external: Option<ExternalConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct IncrementalRaw {
    strategy: String,
    #[serde(default)]
    on_schema_change: Option<String>,
    #[serde(default)]
    append: Option<StrategyRaw>,
    #[serde(default)]
    merge: Option<StrategyRaw>,
    #[serde(default, alias = "delete+insert")]
    delete_insert: Option<StrategyRaw>,
}

#[derive(Debug, Clone, Deserialize)]
struct StrategyRaw {
    filter_column: String,
    #[serde(default)]
    start_value: Option<String>,
    #[serde(default)]
    lookback: Option<String>,
    #[serde(default)]
    unique_key: Option<UniqueKeyConfig>,
    #[serde(default)]
    where_condition: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FullRefreshRaw {
    #[serde(default)]
    parameters: Vec<ParameterRaw>,
}

#[derive(Debug, Clone, Deserialize)]
struct ParameterRaw {
    name: String,
    start_value: String,
    end_value: String,
    step: String,
}

impl MetadataRaw {
    fn validate(self, model: &str) -> Result<ModelMetadata> {
        let (incremental, on_schema_change) = match self.incremental {
            Some(raw) => {
                let policy = match raw.on_schema_change.as_deref() {
                    Some(p) => SchemaChangePolicy::parse(p).ok_or_else(|| {
                        Error::config(model, format!("unknown on_schema_change policy '{p}'"))
                    })?,
                    None => SchemaChangePolicy::Ignore,
                };
                (Some(raw.validate(model)?), policy)
            }
            None => (None, SchemaChangePolicy::Ignore),
        };

        let mut full_incremental_refresh = Vec::new();
        if let Some(refresh) = self.full_incremental_refresh {
            for p in refresh.parameters {
                full_incremental_refresh.push(ChunkParameter::parse(
                    model,
                    &p.name,
                    &p.start_value,
                    &p.end_value,
                    &p.step,
                )?);
            }
        }
        if on_schema_change == SchemaChangePolicy::FullIncrementalRefresh
            && full_incremental_refresh.is_empty()
        {
            return Err(Error::config(
                model,
                "full_incremental_refresh policy requires full_incremental_refresh.parameters",
            ));
        }

        let metadata = ModelMetadata {
            schema: self.schema,
            incremental,
            on_schema_change,
            full_incremental_refresh,
            description: self.description,
            external: self.external,
        };
        metadata.auto_incremental_column(model)?;
        Ok(metadata)
    }
}

impl IncrementalRaw {
    fn validate(self, model: &str) -> Result<IncrementalConfig> {
        let strategy = Strategy::parse(&self.strategy).ok_or_else(|| {
            Error::config(model, format!("unknown incremental strategy '{}'", self.strategy))
        })?;
        let section = match strategy {
            Strategy::Append => self.append,
            Strategy::Merge => self.merge,
            Strategy::DeleteInsert => self.delete_insert,
        }
        .ok_or_else(|| {
            Error::config(
                model,
                format!("strategy '{}' requires an '{}' section", strategy.as_str(), strategy.as_str()),
            )
        })?;

        if section.filter_column.trim().is_empty() {
            return Err(Error::config(model, "filter_column must not be empty"));
        }
        let start_value = match section.start_value.as_deref() {
            Some(s) => Some(StartValue::parse(s).ok_or_else(|| {
                Error::config(model, format!("unrecognised start_value '{s}'"))
            })?),
            None => None,
        };
        let lookback = match section.lookback.as_deref() {
            Some(s) => Some(Lookback::parse(s).ok_or_else(|| {
                Error::config(
                    model,
                    format!("unrecognised lookback '{s}', expected '<n> minutes|hours|days|weeks|months'"),
                )
            })?),
            None => None,
        };
        let unique_key = section
            .unique_key
            .map(|k| k.columns())
            .unwrap_or_default();

        Ok(match strategy {
            Strategy::Append => IncrementalConfig::Append(AppendConfig {
                filter_column: section.filter_column,
                start_value,
                lookback,
                unique_key,
            }),
            Strategy::Merge => {
                if unique_key.is_empty() {
                    return Err(Error::config(model, "merge strategy requires unique_key"));
                }
                IncrementalConfig::Merge(MergeConfig {
                    filter_column: section.filter_column,
                    start_value,
                    lookback,
                    unique_key,
                })
            }
            Strategy::DeleteInsert => {
                if unique_key.is_empty() {
                    return Err(Error::config(model, "delete_insert strategy requires unique_key"));
                }
                IncrementalConfig::DeleteInsert(DeleteInsertConfig {
                    filter_column: section.filter_column,
                    start_value,
                    lookback,
                    unique_key,
                    where_condition: section.where_condition,
                })
            }
        })
    }
}

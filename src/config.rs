use crate::error::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_state_path")]
    pub state_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Externally supplied variables, referenced as `{{ var('name') }}`.
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

fn default_state_path() -> String {
    ".trex/state.duckdb".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            state_path: default_state_path(),
            log_level: default_log_level(),
            vars: HashMap::new(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Defaults with environment overrides applied; used when no settings file exists.
    pub fn from_env() -> Self {
        Settings::default().with_env_overrides()
    }

    /// Apply `TREX_STATE_PATH` and `TREX_LOG_LEVEL` overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = env::var("TREX_STATE_PATH") {
            if !path.trim().is_empty() {
                self.state_path = path;
            }
        }
        if let Ok(level) = env::var("TREX_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.log_level = level;
            }
        }
        self
    }

    pub fn log_filter(&self) -> log::LevelFilter {
        crate::logging::parse_level(&self.log_level)
    }
}

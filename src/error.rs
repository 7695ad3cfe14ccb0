use crate::schema::SchemaDiff;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid model configuration. Never retried.
    #[error("configuration error in model '{model}': {message}")]
    Config { model: String, message: String },

    /// Raised by the `fail` schema change policy.
    #[error("schema change detected for model '{model}': {diff}")]
    SchemaDrift { model: String, diff: SchemaDiff },

    #[error("adapter does not support {capability}")]
    Unsupported { capability: &'static str },

    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("sql parse error: {0}")]
    Parse(#[from] sqlparser::parser::ParserError),

    #[error("sql rewrite failed: {0}")]
    Rewrite(String),

    #[error("state store error: {0}")]
    State(String),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(model: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            model: model.into(),
            message: message.into(),
        }
    }

    pub fn rewrite(message: impl Into<String>) -> Self {
        Error::Rewrite(message.into())
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported { .. })
    }
}

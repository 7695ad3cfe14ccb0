//! SELECT-statement rewriting.
//!
//! `SqlRewriter` tries the structural `AstRewriter` first and falls back to the
//! best-effort `TextPatternRewriter` when the statement cannot be parsed.

mod ast;
mod text;

pub use self::ast::AstRewriter;
pub use self::text::TextPatternRewriter;

use crate::error::Result;
use crate::logging::Logger;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedColumn {
    /// Output name, when it can be determined statically.
    pub name: Option<String>,
    pub expr: String,
    pub is_wildcard: bool,
}

impl ProjectedColumn {
    pub fn named(name: &str, expr: &str) -> Self {
        ProjectedColumn {
            name: Some(name.to_string()),
            expr: expr.to_string(),
            is_wildcard: false,
        }
    }

    pub fn matches(&self, alias: &str) -> bool {
        self.name
            .as_deref()
            .is_some_and(|n| n.eq_ignore_ascii_case(alias))
    }
}

pub trait QueryRewriter {
    fn projected_columns(&self, sql: &str) -> Result<Vec<ProjectedColumn>>;

    /// Replace the projection named `alias` with `replacement AS alias`.
    fn replace_projection(&self, sql: &str, alias: &str, replacement: &str) -> Result<String>;

    /// AND `condition` into the statement's filter.
    fn inject_where(&self, sql: &str, condition: &str) -> Result<String>;
}

pub struct SqlRewriter {
    ast: AstRewriter,
    text: TextPatternRewriter,
    logger: Logger,
}

impl SqlRewriter {
    pub fn new(logger: Logger) -> Self {
        SqlRewriter {
            ast: AstRewriter,
            text: TextPatternRewriter,
            logger: logger.with_category("rewrite"),
        }
    }

    fn with_fallback<T>(&self, op: &str, f: impl Fn(&dyn QueryRewriter) -> Result<T>) -> Result<T> {
        match f(&self.ast) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.logger
                    .debug(&format!("{op}: AST rewrite unavailable ({e}), using text patterns"));
                f(&self.text)
            }
        }
    }

    pub fn projected_columns(&self, sql: &str) -> Result<Vec<ProjectedColumn>> {
        self.with_fallback("projected_columns", |r| r.projected_columns(sql))
    }

    pub fn find_projection(&self, sql: &str, alias: &str) -> Result<Option<ProjectedColumn>> {
        Ok(self
            .projected_columns(sql)?
            .into_iter()
            .find(|c| c.matches(alias)))
    }

    pub fn replace_projection(&self, sql: &str, alias: &str, replacement: &str) -> Result<String> {
        self.with_fallback("replace_projection", |r| {
            r.replace_projection(sql, alias, replacement)
        })
    }

    pub fn inject_where(&self, sql: &str, condition: &str) -> Result<String> {
        self.with_fallback("inject_where", |r| r.inject_where(sql, condition))
    }

    /// Relations read by `sql`, in order of appearance, CTE names excluded.
    /// Empty when the statement does not parse.
    pub fn table_references(&self, sql: &str) -> Vec<String> {
        match self.ast.table_references(sql) {
            Ok(refs) => refs,
            Err(e) => {
                self.logger
                    .debug(&format!("table_references: parse failed ({e}), no tables found"));
                Vec::new()
            }
        }
    }
}

impl Default for SqlRewriter {
    fn default() -> Self {
        SqlRewriter::new(Logger::default())
    }
}
